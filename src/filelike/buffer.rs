//! A sparse byte buffer with block-level LRU eviction
//!
//! [`VirtualLruBuffer`] represents a whole file but only keeps a bounded number
//! of fixed-size blocks in memory. Writing into an unallocated block evicts the
//! least recently used one once the limit is reached, and the evicted byte range
//! is dropped from [`VirtualLruBuffer::ranges_with_data`].

use super::ranges;
use crate::error::{PlaybackError, Result};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;

pub struct VirtualLruBuffer {
    byte_length: u64,
    block_size: u64,
    number_of_blocks: usize,
    blocks: HashMap<u64, Vec<u8>>,
    /// Block indices from least to most recently used
    recently_used: VecDeque<u64>,
    ranges_with_data: Vec<Range<u64>>,
}

impl VirtualLruBuffer {
    /// Buffer that keeps everything in a single block
    pub fn unbounded(size: u64) -> Self {
        Self::new(size, size.max(1), usize::MAX)
    }

    pub fn new(size: u64, block_size: u64, number_of_blocks: usize) -> Self {
        Self {
            byte_length: size,
            block_size: block_size.max(1),
            number_of_blocks: number_of_blocks.max(1),
            blocks: HashMap::new(),
            recently_used: VecDeque::new(),
            ranges_with_data: Vec::new(),
        }
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Whether `[start, end)` was copied in and not evicted since
    pub fn has_data(&self, start: u64, end: u64) -> bool {
        ranges::is_covered(&(start..end), &self.ranges_with_data)
    }

    /// Resident ranges, sorted and non-overlapping
    pub fn ranges_with_data(&self) -> &[Range<u64>] {
        &self.ranges_with_data
    }

    /// Copy `source` into the buffer at `target_start`
    pub fn copy_from(&mut self, source: &[u8], target_start: u64) -> Result<()> {
        let end = target_start + source.len() as u64;
        if target_start >= self.byte_length || end > self.byte_length {
            return Err(PlaybackError::generic(format!(
                "copy of {} bytes at {target_start} exceeds buffer of {} bytes",
                source.len(),
                self.byte_length
            )));
        }

        let mut position = target_start;
        while position < end {
            let (block_index, position_in_block) = self.locate(position);
            let block = self.block_mut(block_index);
            let available = block.len() - position_in_block;
            let offset = (position - target_start) as usize;
            let count = available.min(source.len() - offset);
            block[position_in_block..position_in_block + count]
                .copy_from_slice(&source[offset..offset + count]);
            position += count as u64;
        }

        self.ranges_with_data = ranges::merge(&self.ranges_with_data, target_start..end);
        Ok(())
    }

    /// Copy `[start, end)` out of the buffer; fails if any byte is not resident
    pub fn slice(&mut self, start: u64, end: u64) -> Result<Vec<u8>> {
        if start >= end || end > self.byte_length {
            return Err(PlaybackError::generic(format!("invalid slice {start}..{end}")));
        }
        if !self.has_data(start, end) {
            return Err(PlaybackError::generic(format!("slice {start}..{end} has no data")));
        }

        let mut result = Vec::with_capacity((end - start) as usize);
        let mut position = start;
        while position < end {
            let (block_index, position_in_block) = self.locate(position);
            // Resident blocks are never evicted by touching them
            let block = self.block_mut(block_index);
            let count = (block.len() - position_in_block).min((end - position) as usize);
            result.extend_from_slice(&block[position_in_block..position_in_block + count]);
            position += count as u64;
        }
        Ok(result)
    }

    fn locate(&self, position: u64) -> (u64, usize) {
        let block_index = position / self.block_size;
        (block_index, (position - block_index * self.block_size) as usize)
    }

    /// Get a block, allocating it if needed, and mark it most recently used
    fn block_mut(&mut self, index: u64) -> &mut Vec<u8> {
        self.recently_used.retain(|&i| i != index);
        self.recently_used.push_back(index);

        if self.recently_used.len() > self.number_of_blocks {
            if let Some(evicted) = self.recently_used.pop_front() {
                self.blocks.remove(&evicted);
                let evicted_range =
                    evicted * self.block_size..((evicted + 1) * self.block_size).min(self.byte_length);
                self.ranges_with_data = ranges::subtract(&self.ranges_with_data, &evicted_range);
            }
        }

        let block_start = index * self.block_size;
        let size = self.block_size.min(self.byte_length - block_start) as usize;
        self.blocks.entry(index).or_insert_with(|| vec![0; size])
    }
}
