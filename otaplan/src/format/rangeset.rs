// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, ops::Range, str::FromStr};

use thiserror::Error;

use crate::util::DebugString;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid range set: {0:?}")]
    InvalidSyntax(DebugString),
    #[error("Invalid block number in range set: {0:?}")]
    InvalidNumber(DebugString),
    #[error("Range end {end} is before start {start}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Range set has {actual} numbers, but header says {expected}")]
    MismatchedCount { expected: usize, actual: usize },
    #[error("Block count overflow: {0} + {1}")]
    Overflow(u64, u64),
}

type Result<T> = std::result::Result<T, Error>;

/// An immutable, ordered set of half-open block intervals. The intervals are
/// always sorted, non-empty, non-overlapping, and never adjacent (adjacent
/// intervals are merged).
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ranges.iter()).finish()
    }
}

/// Human-readable form with inclusive ends, eg. `0-9 12 14-19`. This is the
/// syntax used by block map files.
impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            if range.end - range.start == 1 {
                write!(f, "{}", range.start)?;
            } else {
                write!(f, "{}-{}", range.start, range.end - 1)?;
            }
        }

        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut ranges = vec![];

        for piece in s.split_whitespace() {
            let (start, last) = match piece.split_once('-') {
                Some((a, b)) => (parse_u64(a)?, parse_u64(b)?),
                None => {
                    let n = parse_u64(piece)?;
                    (n, n)
                }
            };

            if last < start {
                return Err(Error::InvalidRange {
                    start,
                    end: last.saturating_add(1),
                });
            }

            let end = last.checked_add(1).ok_or(Error::Overflow(last, 1))?;
            ranges.push(start..end);
        }

        Ok(Self::from_ranges(ranges))
    }
}

fn parse_u64(s: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| Error::InvalidNumber(DebugString::new(s)))
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from arbitrary (possibly unsorted, overlapping, or empty)
    /// intervals.
    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<u64>>) -> Self {
        let mut ranges = ranges
            .into_iter()
            .filter(|r| r.start < r.end)
            .collect::<Vec<_>>();
        ranges.sort_by_key(|r| (r.start, r.end));

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());

        for range in ranges {
            if let Some(last) = merged.last_mut() {
                if range.start <= last.end {
                    last.end = last.end.max(range.end);
                    continue;
                }
            }

            merged.push(range);
        }

        Self { ranges: merged }
    }

    pub fn from_range(range: Range<u64>) -> Self {
        Self::from_ranges([range])
    }

    /// Parse the compact form produced by [`Self::to_string_raw`].
    pub fn parse_raw(s: &str) -> Result<Self> {
        let mut numbers = s.trim().split(',');

        let count = numbers
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidSyntax(DebugString::new(s)))
            .and_then(|n| {
                n.parse::<usize>()
                    .map_err(|_| Error::InvalidNumber(DebugString::new(n)))
            })?;

        let numbers = numbers.map(parse_u64).collect::<Result<Vec<_>>>()?;

        if numbers.len() != count {
            return Err(Error::MismatchedCount {
                expected: count,
                actual: numbers.len(),
            });
        } else if count % 2 != 0 {
            return Err(Error::InvalidSyntax(DebugString::new(s)));
        }

        let mut ranges = Vec::with_capacity(count / 2);

        for pair in numbers.chunks_exact(2) {
            if pair[1] < pair[0] {
                return Err(Error::InvalidRange {
                    start: pair[0],
                    end: pair[1],
                });
            }

            ranges.push(pair[0]..pair[1]);
        }

        Ok(Self::from_ranges(ranges))
    }

    /// Compact form `<number count>,<start>,<end>,...` with exclusive ends.
    /// This is the syntax understood by the install-time interpreter.
    pub fn to_string_raw(&self) -> String {
        let mut result = (self.ranges.len() * 2).to_string();

        for range in &self.ranges {
            result.push_str(&format!(",{},{}", range.start, range.end));
        }

        result
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of blocks in the set.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// First block in the set.
    pub fn start(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.start)
    }

    /// One past the last block in the set.
    pub fn end(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end)
    }

    pub fn contains_block(&self, block: u64) -> bool {
        let index = self.ranges.partition_point(|r| r.end <= block);
        self.ranges.get(index).is_some_and(|r| r.start <= block)
    }

    pub fn union(&self, other: &Self) -> Self {
        Self::from_ranges(self.ranges.iter().chain(other.ranges.iter()).cloned())
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut result = vec![];
        let (mut a, mut b) = (self.ranges.iter().peekable(), other.ranges.iter().peekable());

        while let (Some(x), Some(y)) = (a.peek(), b.peek()) {
            let start = x.start.max(y.start);
            let end = x.end.min(y.end);

            if start < end {
                result.push(start..end);
            }

            if x.end <= y.end {
                a.next();
            } else {
                b.next();
            }
        }

        // Both inputs are normalized, so the output is already sorted and
        // disjoint. Intersections of adjacent inputs can touch, though.
        Self::from_ranges(result)
    }

    pub fn subtract(&self, other: &Self) -> Self {
        let mut result = vec![];
        let mut others = other.ranges.iter().peekable();

        for range in &self.ranges {
            let mut start = range.start;

            while let Some(o) = others.peek() {
                if o.end <= start {
                    others.next();
                    continue;
                } else if o.start >= range.end {
                    break;
                }

                if o.start > start {
                    result.push(start..o.start);
                }

                start = start.max(o.end);

                if o.end >= range.end {
                    break;
                }

                others.next();
            }

            if start < range.end {
                result.push(start..range.end);
            }
        }

        Self { ranges: result }
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Widen every interval by `n` blocks on both sides. The lower bound is
    /// clamped to zero.
    pub fn extend(&self, n: u64) -> Self {
        Self::from_ranges(
            self.ranges
                .iter()
                .map(|r| r.start.saturating_sub(n)..r.end.saturating_add(n)),
        )
    }

    /// Return the first `n` blocks of the set.
    pub fn first(&self, mut n: u64) -> Self {
        let mut result = vec![];

        for range in &self.ranges {
            if n == 0 {
                break;
            }

            let len = (range.end - range.start).min(n);
            result.push(range.start..range.start + len);
            n -= len;
        }

        Self { ranges: result }
    }
}

impl FromIterator<Range<u64>> for RangeSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        Self::from_ranges(iter)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn rs(ranges: &[Range<u64>]) -> RangeSet {
        RangeSet::from_ranges(ranges.iter().cloned())
    }

    #[test]
    fn normalization() {
        let set = rs(&[10..20, 0..5, 5..7, 15..25, 30..30]);
        assert_eq!(set.ranges(), &[0..7, 10..25]);
        assert_eq!(set.size(), 22);
        assert!(RangeSet::new().is_empty());
    }

    #[test]
    fn set_operations() {
        let a = rs(&[0..10, 20..30]);
        let b = rs(&[5..25]);

        assert_eq!(a.union(&b), rs(&[0..30]));
        assert_eq!(a.intersect(&b), rs(&[5..10, 20..25]));
        assert_eq!(a.subtract(&b), rs(&[0..5, 25..30]));
        assert_eq!(b.subtract(&a), rs(&[10..20]));
        assert!(a.overlaps(&b));
        assert!(!rs(&[0..5]).overlaps(&rs(&[5..10])));
    }

    #[test]
    fn subtract_edge_cases() {
        let a = rs(&[0..10, 20..30, 40..50]);

        assert!(a.subtract(&a).is_empty());
        assert!(a.subtract(&rs(&[0..100])).is_empty());
        assert_eq!(a.subtract(&RangeSet::new()), a);
        assert_eq!(a.subtract(&rs(&[0..1, 9..21, 45..46])), rs(&[1..9, 21..30, 40..45, 46..50]));
    }

    #[test]
    fn partition_law() {
        let sets = [
            rs(&[]),
            rs(&[0..10]),
            rs(&[3..4, 8..12, 40..41]),
            rs(&[0..2, 4..6, 8..10, 12..14]),
            rs(&[5..100]),
        ];

        for a in &sets {
            for b in &sets {
                let rebuilt = a.subtract(b).union(&a.intersect(b));
                assert_eq!(&rebuilt, a, "{a:?} vs {b:?}");
                assert_eq!(a.subtract(b).size() + a.intersect(b).size(), a.size());
            }
        }
    }

    #[test]
    fn contains_block() {
        let a = rs(&[2..4, 10..11]);

        assert!(!a.contains_block(1));
        assert!(a.contains_block(2));
        assert!(a.contains_block(3));
        assert!(!a.contains_block(4));
        assert!(a.contains_block(10));
        assert!(!a.contains_block(11));
    }

    #[test]
    fn extend_and_first() {
        let a = rs(&[2..4, 10..12]);

        assert_eq!(a.extend(3), rs(&[0..15]));
        assert_eq!(a.first(3), rs(&[2..4, 10..11]));
        assert_eq!(a.first(100), a);
        assert!(a.first(0).is_empty());
    }

    #[test]
    fn text_forms() {
        let a = rs(&[0..10, 12..13, 14..20]);

        assert_eq!(a.to_string_raw(), "6,0,10,12,13,14,20");
        assert_eq!(RangeSet::parse_raw("6,0,10,12,13,14,20").unwrap(), a);
        assert_eq!(RangeSet::new().to_string_raw(), "0");
        assert!(RangeSet::parse_raw("0").unwrap().is_empty());

        assert_eq!(a.to_string(), "0-9 12 14-19");
        assert_eq!("0-9 12 14-19".parse::<RangeSet>().unwrap(), a);
    }

    #[test]
    fn invalid_text_forms() {
        assert_matches!(
            RangeSet::parse_raw("4,0,10"),
            Err(Error::MismatchedCount {
                expected: 4,
                actual: 2
            })
        );
        assert_matches!(RangeSet::parse_raw("2,10,0"), Err(Error::InvalidRange { .. }));
        assert_matches!(RangeSet::parse_raw(""), Err(Error::InvalidSyntax(_)));
        assert_matches!("5-2".parse::<RangeSet>(), Err(Error::InvalidRange { .. }));
        assert_matches!("x".parse::<RangeSet>(), Err(Error::InvalidNumber(_)));
    }
}
