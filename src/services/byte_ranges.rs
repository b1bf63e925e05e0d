//! Set of received byte ranges for an upload session.

use std::collections::BTreeMap;

/// Disjoint, non-adjacent half-open ranges `[start, end)`, keyed by start.
#[derive(Debug, Default, Clone)]
pub struct ByteRanges {
    ranges: BTreeMap<u64, u64>,
}

impl ByteRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[start, end)`, merging with touching or overlapping ranges.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        // The range starting at or before `start` may reach into the new one.
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
            }
        }

        let absorbed: Vec<u64> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                new_end = new_end.max(e);
            }
        }

        self.ranges.insert(new_start, new_end);
    }

    /// Portions of `[start, end)` that are already recorded.
    pub fn overlaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        if start >= end {
            return out;
        }
        if let Some((_, &e)) = self.ranges.range(..start).next_back() {
            if e > start {
                out.push((start, e.min(end)));
            }
        }
        for (&s, &e) in self.ranges.range(start..end) {
            out.push((s, e.min(end)));
        }
        out
    }

    /// Total number of distinct bytes recorded.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// End of the range starting at byte 0, or 0 if byte 0 is missing.
    pub fn contiguous_from_zero(&self) -> u64 {
        match self.ranges.get(&0) {
            Some(&end) => end,
            None => 0,
        }
    }

    /// True when `[0, total)` is fully recorded.
    pub fn covers(&self, total: u64) -> bool {
        self.contiguous_from_zero() >= total
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
