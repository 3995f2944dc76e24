//! Operations on sorted lists of half-open ranges
//!
//! All lists produced here are sorted by `start` and non-overlapping.

use std::ops::Range;

/// Whether `query` lies entirely inside one of `ranges`
pub fn is_covered<T: Copy + PartialOrd>(query: &Range<T>, ranges: &[Range<T>]) -> bool {
    ranges
        .iter()
        .any(|range| range.start <= query.start && query.end <= range.end)
}

/// Union of `ranges` and `new_range`, with touching ranges joined
pub fn merge<T: Copy + PartialOrd>(ranges: &[Range<T>], new_range: Range<T>) -> Vec<Range<T>> {
    let mut all: Vec<Range<T>> = ranges.to_vec();
    all.push(new_range);
    simplify(all)
}

/// Sort and join overlapping or touching ranges; empty ranges are dropped
pub fn simplify<T: Copy + PartialOrd>(mut ranges: Vec<Range<T>>) -> Vec<Range<T>> {
    ranges.retain(|range| range.start < range.end);
    ranges.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    let mut result: Vec<Range<T>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match result.last_mut() {
            Some(last) if range.start <= last.end => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => result.push(range),
        }
    }
    result
}

/// `ranges` with `removed` cut out
pub fn subtract<T: Copy + PartialOrd>(ranges: &[Range<T>], removed: &Range<T>) -> Vec<Range<T>> {
    let mut result = Vec::with_capacity(ranges.len() + 1);
    for range in ranges {
        if removed.end <= range.start || range.end <= removed.start {
            result.push(range.clone());
            continue;
        }
        if range.start < removed.start {
            result.push(range.start..removed.start);
        }
        if removed.end < range.end {
            result.push(removed.end..range.end);
        }
    }
    result
}

/// Parts of `bounds` not covered by `ranges`
pub fn missing<T: Copy + PartialOrd>(bounds: &Range<T>, ranges: &[Range<T>]) -> Vec<Range<T>> {
    subtract_all(&[bounds.clone()], ranges)
}

fn subtract_all<T: Copy + PartialOrd>(ranges: &[Range<T>], removed: &[Range<T>]) -> Vec<Range<T>> {
    removed
        .iter()
        .fold(ranges.to_vec(), |acc, range| subtract(&acc, range))
}

/// Intersection of two simplified lists
pub fn intersect<T: Copy + PartialOrd>(a: &[Range<T>], b: &[Range<T>]) -> Vec<Range<T>> {
    let mut result = Vec::new();
    for x in a {
        for y in b {
            let start = if x.start > y.start { x.start } else { y.start };
            let end = if x.end < y.end { x.end } else { y.end };
            if start < end {
                result.push(start..end);
            }
        }
    }
    simplify(result)
}

/// Put `new_range` first in an unsorted list, absorbing every range it overlaps or touches
///
/// The other ranges keep their order, so a list kept most-recent-first stays that way.
pub fn merge_into_unsorted<T: Copy + PartialOrd>(new_range: Range<T>, ranges: &[Range<T>]) -> Vec<Range<T>> {
    let mut merged = new_range;
    let mut rest = ranges.to_vec();
    // Growing `merged` can make it reach ranges that were skipped earlier
    loop {
        let before = rest.len();
        rest.retain(|range| {
            if range.end < merged.start || merged.end < range.start {
                return true;
            }
            if range.start < merged.start {
                merged.start = range.start;
            }
            if range.end > merged.end {
                merged.end = range.end;
            }
            false
        });
        if rest.len() == before {
            break;
        }
    }
    rest.insert(0, merged);
    rest
}

/// Intersection of every list; an empty input yields an empty list
pub fn deep_intersect<T: Copy + PartialOrd>(lists: &[Vec<Range<T>>]) -> Vec<Range<T>> {
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    rest.iter()
        .fold(first.clone(), |acc, list| intersect(&acc, list))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_requires_a_single_enclosing_range() {
        assert!(is_covered(&(5..7), &[0..1, 4..10, 12..20]));
        assert!(is_covered(&(5..7), &[5..7]));
        assert!(!is_covered(&(5..7), &[0..1]));
        assert!(!is_covered(&(5..7), &[3..6, 7..10]));
    }

    #[test]
    fn merge_joins_touching_ranges() {
        assert_eq!(merge(&[0..5, 10..15], 5..10), vec![0..15]);
        assert_eq!(merge(&[10..15], 0..2), vec![0..2, 10..15]);
    }

    #[test]
    fn missing_ranges_within_bounds() {
        assert_eq!(missing(&(0..10), &[]), vec![0..10]);
        assert_eq!(missing(&(0..10), &[2..4, 6..8]), vec![0..2, 4..6, 8..10]);
        assert_eq!(missing(&(0..10), &[0..10]), Vec::<Range<i32>>::new());
    }

    #[test]
    fn deep_intersect_of_lists() {
        let empty: Vec<Vec<Range<i32>>> = Vec::new();
        assert_eq!(deep_intersect(&empty), Vec::<Range<i32>>::new());
        assert_eq!(deep_intersect(&[vec![0..10, 20..30]]), vec![0..10, 20..30]);
        assert_eq!(
            deep_intersect(&[vec![0..10, 20..30], vec![5..15, 18..28]]),
            vec![5..10, 20..28]
        );
    }

    #[test]
    fn merge_into_unsorted_puts_the_new_range_first() {
        assert_eq!(merge_into_unsorted(20..30, &[]), vec![20..30]);
        assert_eq!(merge_into_unsorted(20..30, &[0..10]), vec![20..30, 0..10]);
        assert_eq!(merge_into_unsorted(20..30, &[25..35, 0..10]), vec![20..35, 0..10]);
        assert_eq!(merge_into_unsorted(20..30, &[30..40, 0..10]), vec![20..40, 0..10]);
        assert_eq!(
            merge_into_unsorted(20..30, &[30..40, 0..10, 15..25]),
            vec![15..40, 0..10]
        );
    }

    #[test]
    fn intersect_works_for_fractions() {
        assert_eq!(intersect(&[0.0..0.5], &[0.25..1.0]), vec![0.25..0.5]);
    }
}
