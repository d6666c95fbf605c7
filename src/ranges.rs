//! Pure algebra over inclusive block-number ranges: compaction, inversion,
//! chunking, and the `"<from>-<to>"` text round-trip used by the checkpoint
//! document.

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

/// Inclusive `[from, to]` interval of block numbers. Invariant: `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockRange {
    from: u64,
    to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Result<Self> {
        if from > to {
            bail!("invalid range: from ({from}) exceeds to ({to})");
        }
        Ok(Self { from, to })
    }

    /// Single-block range.
    pub fn single(block: u64) -> Self {
        Self {
            from: block,
            to: block,
        }
    }

    pub fn from(&self) -> u64 {
        self.from
    }

    pub fn to(&self) -> u64 {
        self.to
    }

    /// Number of blocks covered (inclusive count).
    pub fn size(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        self.from <= block && block <= self.to
    }

    /// Iterates the covered block numbers in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u64> {
        self.from..=self.to
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for BlockRange {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let Some((from, to)) = value.split_once('-') else {
            bail!("malformed range {value:?}: expected \"<from>-<to>\"");
        };
        let from: u64 = from
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("malformed range {value:?}: bad lower bound"))?;
        let to: u64 = to
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("malformed range {value:?}: bad upper bound"))?;
        Self::new(from, to)
    }
}

/// Merges overlapping and adjacent ranges into a sorted, disjoint,
/// non-adjacent sequence. The result is the only way a compacted set is
/// ever produced.
pub fn compact(mut ranges: Vec<BlockRange>) -> Vec<BlockRange> {
    if ranges.len() <= 1 {
        return ranges;
    }

    ranges.sort_by_key(|range| range.from);

    let mut compacted: Vec<BlockRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match compacted.last_mut() {
            // `from - 1 <= current.to` means overlap or adjacency.
            Some(current) if range.from <= current.to.saturating_add(1) => {
                current.to = current.to.max(range.to);
            }
            _ => compacted.push(range),
        }
    }
    compacted
}

/// Returns the gaps of a compacted set restricted to `[lower, upper]`.
///
/// With no `lower` bound the gap before the first range is unbounded and
/// therefore omitted; with no `upper` bound the trailing gap is omitted.
/// An empty set inverts to `[lower, upper]` when both bounds are given.
pub fn invert(
    compacted: &[BlockRange],
    lower: Option<u64>,
    upper: Option<u64>,
) -> Vec<BlockRange> {
    let mut gaps = Vec::new();
    let mut cursor = lower;

    for range in compacted {
        if let Some(hi) = upper {
            if range.from > hi {
                break;
            }
        }
        if let Some(start) = cursor {
            if start < range.from {
                let end = match upper {
                    Some(hi) => hi.min(range.from - 1),
                    None => range.from - 1,
                };
                if start <= end {
                    gaps.push(BlockRange {
                        from: start,
                        to: end,
                    });
                }
            }
        }
        cursor = match range.to.checked_add(1) {
            Some(next) => Some(cursor.map_or(next, |start| start.max(next))),
            None => return gaps,
        };
    }

    if let (Some(start), Some(hi)) = (cursor, upper) {
        if start <= hi {
            gaps.push(BlockRange {
                from: start,
                to: hi,
            });
        }
    }

    gaps
}

/// Splits a range into contiguous pieces of at most `max_size` blocks.
///
/// `max_chunks` caps how many scheduling units are produced for a very
/// large range; when the cap is hit the final piece absorbs the rest.
pub fn chunk(range: BlockRange, max_size: u64, max_chunks: Option<usize>) -> Vec<BlockRange> {
    assert!(max_size > 0, "max_size must be greater than zero");

    let mut chunks = Vec::new();
    let mut from = range.from;

    loop {
        if let Some(cap) = max_chunks {
            if chunks.len() + 1 == cap.max(1) {
                chunks.push(BlockRange { from, to: range.to });
                return chunks;
            }
        }

        let to = from.saturating_add(max_size - 1).min(range.to);
        chunks.push(BlockRange { from, to });
        if to == range.to {
            return chunks;
        }
        from = to + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(from: u64, to: u64) -> BlockRange {
        BlockRange::new(from, to).expect("test range must be valid")
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(BlockRange::new(5, 4).is_err());
        assert!(BlockRange::new(5, 5).is_ok());
    }

    #[test]
    fn compact_merges_overlap() {
        let compacted = compact(vec![range(1, 5), range(3, 8)]);
        assert_eq!(compacted, vec![range(1, 8)]);
    }

    #[test]
    fn compact_merges_adjacency_but_keeps_gaps() {
        let compacted = compact(vec![range(10, 20), range(21, 30), range(40, 50)]);
        assert_eq!(compacted, vec![range(10, 30), range(40, 50)]);
    }

    #[test]
    fn compact_sorts_input() {
        let compacted = compact(vec![range(40, 50), range(0, 4), range(5, 9)]);
        assert_eq!(compacted, vec![range(0, 9), range(40, 50)]);
    }

    #[test]
    fn compact_result_is_disjoint_and_non_adjacent() {
        let compacted = compact(vec![
            range(1, 3),
            range(2, 6),
            range(8, 8),
            range(7, 7),
            range(20, 25),
        ]);
        for window in compacted.windows(2) {
            assert!(
                window[0].to + 1 < window[1].from,
                "ranges {} and {} must not touch",
                window[0],
                window[1]
            );
        }
        let covered: Vec<u64> = compacted.iter().flat_map(|r| r.blocks()).collect();
        assert_eq!(covered, vec![1, 2, 3, 4, 5, 6, 7, 8, 20, 21, 22, 23, 24, 25]);
    }

    #[test]
    fn invert_reports_gaps_within_bounds() {
        let compacted = vec![range(10, 20), range(30, 40)];
        let gaps = invert(&compacted, Some(0), Some(50));
        assert_eq!(gaps, vec![range(0, 9), range(21, 29), range(41, 50)]);
    }

    #[test]
    fn invert_empty_set_is_full_span() {
        assert_eq!(invert(&[], Some(5), Some(9)), vec![range(5, 9)]);
        assert!(invert(&[], Some(5), None).is_empty());
        assert!(invert(&[], None, Some(9)).is_empty());
    }

    #[test]
    fn invert_omits_negative_trailing_gap() {
        let compacted = vec![range(0, 50)];
        assert!(invert(&compacted, Some(0), Some(40)).is_empty());
        assert!(invert(&compacted, Some(0), Some(50)).is_empty());
        assert_eq!(invert(&compacted, Some(0), Some(51)), vec![range(51, 51)]);
    }

    #[test]
    fn invert_clips_gap_to_upper_bound() {
        let compacted = vec![range(10, 20), range(40, 50)];
        assert_eq!(
            invert(&compacted, Some(0), Some(30)),
            vec![range(0, 9), range(21, 30)]
        );
    }

    #[test]
    fn invert_union_covers_span_exactly() {
        let compacted = vec![range(3, 5), range(9, 12)];
        let gaps = invert(&compacted, Some(0), Some(15));
        let mut all: Vec<u64> = gaps
            .iter()
            .chain(compacted.iter())
            .flat_map(|r| r.blocks())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..=15).collect::<Vec<u64>>());
    }

    #[test]
    fn chunk_splits_evenly() {
        let chunks = chunk(range(1, 30), 10, None);
        assert_eq!(chunks, vec![range(1, 10), range(11, 20), range(21, 30)]);
    }

    #[test]
    fn chunk_last_piece_may_be_smaller() {
        let chunks = chunk(range(0, 24), 10, None);
        assert_eq!(chunks, vec![range(0, 9), range(10, 19), range(20, 24)]);
    }

    #[test]
    fn chunk_respects_cap_with_oversized_tail() {
        let chunks = chunk(range(0, 99), 10, Some(3));
        assert_eq!(chunks, vec![range(0, 9), range(10, 19), range(20, 99)]);
    }

    #[test]
    fn chunk_covers_range_exactly() {
        let source = range(7, 113);
        let chunks = chunk(source, 13, None);
        assert_eq!(chunks.first().map(|r| r.from()), Some(7));
        assert_eq!(chunks.last().map(|r| r.to()), Some(113));
        for window in chunks.windows(2) {
            assert_eq!(window[0].to() + 1, window[1].from());
            assert!(window[0].size() <= 13);
        }
    }

    #[test]
    fn text_round_trip() {
        let source = range(12, 3456);
        let parsed: BlockRange = source.to_string().parse().expect("round-trip must parse");
        assert_eq!(parsed, source);

        assert!("12".parse::<BlockRange>().is_err());
        assert!("a-b".parse::<BlockRange>().is_err());
        assert!("9-3".parse::<BlockRange>().is_err());
    }
}
