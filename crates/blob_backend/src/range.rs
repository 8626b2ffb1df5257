//! Byte range algebra.
//!
//! Pure functions over half-open byte intervals: validation, normalization
//! and the gap ratio used to decide whether neighbouring ranges are worth
//! fetching as one widened request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobResult};

/// Half-open byte interval `[start, start + count)` within a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub count: u64,
}

impl Range {
    /// Build a validated range.
    pub fn new(start: u64, count: u64) -> BlobResult<Self> {
        let range = Self { start, count };
        range.validate()?;
        Ok(range)
    }

    /// Check `count > 0` and that the end does not overflow.
    pub fn validate(&self) -> BlobResult<()> {
        if self.count == 0 {
            return Err(BlobError::invalid_range(
                self.start,
                self.count,
                "zero-length range",
            ));
        }
        if self.start.checked_add(self.count).is_none() {
            return Err(BlobError::invalid_range(
                self.start,
                self.count,
                "end overflows u64",
            ));
        }
        Ok(())
    }

    /// Exclusive end offset. Only meaningful for validated ranges.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn as_std(&self) -> std::ops::Range<u64> {
        self.start..self.end()
    }

    /// Whether `other` lies entirely within `self`.
    pub fn contains(&self, other: &Range) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

impl TryFrom<std::ops::Range<u64>> for Range {
    type Error = BlobError;

    fn try_from(range: std::ops::Range<u64>) -> BlobResult<Self> {
        Range::new(range.start, range.end.saturating_sub(range.start))
    }
}

/// A range tagged with its position in the caller's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedRange {
    pub index: usize,
    pub range: Range,
}

/// Validate every range, rejecting empty requests.
pub fn validate_all(ranges: &[Range]) -> BlobResult<()> {
    if ranges.is_empty() {
        return Err(BlobError::EmptyRequest);
    }
    ranges.iter().try_for_each(Range::validate)
}

/// Sort ranges by start, then by count, keeping each element's input index.
///
/// The sort is stable so identical ranges keep their request order.
pub fn normalize(ranges: &[Range]) -> Vec<IndexedRange> {
    let mut indexed: Vec<IndexedRange> = ranges
        .iter()
        .enumerate()
        .map(|(index, range)| IndexedRange {
            index,
            range: *range,
        })
        .collect();
    indexed.sort_by_key(|r| (r.range.start, r.range.count));
    indexed
}

/// Covering range of an ordered group. `None` for an empty group.
pub fn span<'a>(group: impl IntoIterator<Item = &'a Range>) -> Option<Range> {
    let mut iter = group.into_iter();
    let first = iter.next()?;
    let end = iter.fold(first.end(), |end, r| end.max(r.end()));
    Some(Range {
        start: first.start,
        count: end - first.start,
    })
}

/// Bytes covered by the union of an ordered group.
pub(crate) fn covered_bytes<'a>(group: impl IntoIterator<Item = &'a Range>) -> u64 {
    let mut covered = 0;
    let mut reach = 0;
    for (i, r) in group.into_iter().enumerate() {
        let from = if i == 0 { r.start } else { r.start.max(reach) };
        if r.end() > from {
            covered += r.end() - from;
        }
        reach = if i == 0 { r.end() } else { reach.max(r.end()) };
    }
    covered
}

/// Fraction of the group's combined span not covered by any range.
///
/// The group must be ordered by start. For disjoint ranges this is
/// `(last.end - first.start - sum(count)) / (last.end - first.start)`;
/// overlapping bytes are counted once.
pub fn gap_ratio<'a>(group: impl IntoIterator<Item = &'a Range> + Clone) -> f64 {
    let Some(total) = span(group.clone()) else {
        return 0.0;
    };
    debug_assert!(total.count > 0, "zero-span group");
    if total.count == 0 {
        return 0.0;
    }
    let covered = covered_bytes(group);
    (total.count - covered) as f64 / total.count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, count: u64) -> Range {
        Range { start, count }
    }

    #[test]
    fn test_gap_ratio_disjoint() {
        let ranges = [r(0, 100), r(200, 100), r(400, 100)];
        assert_eq!(gap_ratio(&ranges), 200.0 / 500.0);
        assert_eq!(gap_ratio(&ranges), 0.4);
    }

    #[test]
    fn test_gap_ratio_contiguous_is_zero() {
        let ranges = [r(0, 10), r(10, 5), r(15, 85)];
        assert_eq!(gap_ratio(&ranges), 0.0);
        assert_eq!(gap_ratio(&[r(7, 3)]), 0.0);
    }

    #[test]
    fn test_gap_ratio_counts_overlap_once() {
        // span [0,30), covered [0,10) and [20,30)
        let ranges = [r(0, 10), r(5, 5), r(20, 10)];
        assert!((gap_ratio(&ranges) - 10.0 / 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_span_uses_furthest_end() {
        let ranges = [r(0, 100), r(10, 5)];
        assert_eq!(span(&ranges), Some(r(0, 100)));
        assert_eq!(span(&[] as &[Range]), None);
    }

    #[test]
    fn test_normalize_orders_and_keeps_indices() {
        let ranges = [r(20, 5), r(0, 5), r(0, 2), r(10, 5)];
        let normalized = normalize(&ranges);
        let order: Vec<usize> = normalized.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
        assert_eq!(normalized[0].range, r(0, 2));
    }

    #[test]
    fn test_normalize_is_stable_for_duplicates() {
        let ranges = [r(5, 5), r(5, 5)];
        let order: Vec<usize> = normalize(&ranges).iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_range_validation() {
        assert!(Range::new(0, 1).is_ok());
        assert!(matches!(
            Range::new(3, 0),
            Err(BlobError::InvalidRange { .. })
        ));
        assert!(matches!(
            Range::new(u64::MAX, 1),
            Err(BlobError::InvalidRange { .. })
        ));
        assert!(matches!(validate_all(&[]), Err(BlobError::EmptyRequest)));
    }

    #[test]
    fn test_try_from_std_range() {
        let range = Range::try_from(6u64..11).unwrap();
        assert_eq!(range, r(6, 5));
        assert!(Range::try_from(5u64..5).is_err());
    }
}
