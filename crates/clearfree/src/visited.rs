//! Record of the physical ranges already attempted during a pass.

use std::collections::BTreeMap;

/// Set of disjoint half-open byte intervals.
///
/// Adjacent and overlapping marks coalesce, so the set only ever grows within a pass.
#[derive(Debug, Clone, Default)]
pub struct VisitedSet {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl VisitedSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `[start, start + len)` to the set.
    pub fn mark(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut lo = start;
        let mut hi = start.saturating_add(len);

        // Absorb a predecessor that touches or overlaps the new range.
        if let Some((&s, &e)) = self.ranges.range(..=lo).next_back() {
            if e >= lo {
                lo = s;
                hi = hi.max(e);
            }
        }
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(lo..=hi)
            .map(|(s, e)| (*s, *e))
            .collect();
        for (s, e) in absorbed {
            self.ranges.remove(&s);
            hi = hi.max(e);
        }
        self.ranges.insert(lo, hi);
    }

    /// Returns whether any byte of `[start, start + len)` is in the set.
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let end = start.saturating_add(len);
        if let Some((_, &e)) = self.ranges.range(..=start).next_back() {
            if e > start {
                return true;
            }
        }
        self.ranges.range(start..end).next().is_some()
    }

    /// Returns the parts of `[start, start + len)` that are not in the set.
    pub fn gaps(&self, start: u64, len: u64) -> Vec<(u64, u64)> {
        let end = start.saturating_add(len);
        let mut out = Vec::new();
        let mut pos = start;
        let first = self
            .ranges
            .range(..=start)
            .next_back()
            .map(|(s, e)| (*s, *e));
        let rest = self.ranges.range(start.saturating_add(1)..end).map(|(s, e)| (*s, *e));
        for (s, e) in first.into_iter().chain(rest) {
            if e <= pos {
                continue;
            }
            if s > pos {
                out.push((pos, s.min(end) - pos));
            }
            pos = pos.max(e);
            if pos >= end {
                break;
            }
        }
        if pos < end {
            out.push((pos, end - pos));
        }
        out
    }

    /// Total bytes in the set.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns whether nothing has been marked.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Forgets every mark.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
