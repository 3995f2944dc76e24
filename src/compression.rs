//! Pluggable per-message decompression

use crate::error::{PlaybackError, Result};
use crate::types::CompressionMode;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Decompresses individual message payloads
pub trait Decompressor: Send + Sync {
    /// Format name as written in `compression_format` (e.g. "zstd")
    fn name(&self) -> &str;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

#[cfg(feature = "compression")]
pub struct ZstdDecompressor;

#[cfg(feature = "compression")]
impl Decompressor for ZstdDecompressor {
    fn name(&self) -> &str {
        "zstd"
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| PlaybackError::compression(format!("zstd: {e}")))
    }
}

/// Decompressors by format name
#[derive(Clone, Default)]
pub struct DecompressorRegistry {
    decompressors: HashMap<String, Arc<dyn Decompressor>>,
}

impl fmt::Debug for DecompressorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.decompressors.keys()).finish()
    }
}

impl DecompressorRegistry {
    /// Registry with the built-in decompressors
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::default();
        #[cfg(feature = "compression")]
        registry.register(Arc::new(ZstdDecompressor));
        registry
    }

    pub fn register(&mut self, decompressor: Arc<dyn Decompressor>) {
        self.decompressors
            .insert(decompressor.name().to_string(), decompressor);
    }

    /// Decompressor to apply to each payload of a bag, `None` when uncompressed
    pub fn for_bag(
        &self,
        mode: CompressionMode,
        format: Option<&str>,
    ) -> Result<Option<Arc<dyn Decompressor>>> {
        match (mode, format) {
            (CompressionMode::None, _) | (_, None) => Ok(None),
            (CompressionMode::File, Some(format)) => Err(PlaybackError::UnsupportedCompressionFormat {
                format: format!("{format} (file compression mode)"),
            }),
            (CompressionMode::Message, Some(format)) => self
                .decompressors
                .get(format)
                .cloned()
                .map(Some)
                .ok_or_else(|| PlaybackError::UnsupportedCompressionFormat {
                    format: format.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl Decompressor for Reverse {
        fn name(&self) -> &str {
            "reverse"
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().rev().copied().collect())
        }
    }

    #[test]
    fn uncompressed_bags_need_no_decompressor() {
        let registry = DecompressorRegistry::default();
        assert!(registry.for_bag(CompressionMode::None, None).unwrap().is_none());
    }

    #[test]
    fn custom_decompressors_are_looked_up_by_name() {
        let mut registry = DecompressorRegistry::default();
        registry.register(Arc::new(Reverse));
        let decompressor = registry
            .for_bag(CompressionMode::Message, Some("reverse"))
            .unwrap()
            .unwrap();
        assert_eq!(decompressor.decompress(&[1, 2, 3]).unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn unknown_format_and_file_mode_are_rejected() {
        let registry = DecompressorRegistry::default();
        assert!(registry.for_bag(CompressionMode::Message, Some("lz4")).is_err());
        assert!(registry.for_bag(CompressionMode::File, Some("zstd")).is_err());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn zstd_round_trip() {
        let compressed = zstd::encode_all(&b"hello"[..], 0).unwrap();
        let registry = DecompressorRegistry::with_defaults();
        let zstd = registry
            .for_bag(CompressionMode::Message, Some("zstd"))
            .unwrap()
            .unwrap();
        assert_eq!(zstd.decompress(&compressed).unwrap(), b"hello");
    }
}
