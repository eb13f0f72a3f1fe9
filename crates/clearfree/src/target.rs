//! Choosing the next physical extent to evacuate.
//!
//! The selector walks the refcount map of the range. Shared extents are candidates as
//! they stand; singly owned extents are broken down by owner through the space map so
//! unwritten extents, which move without copying, can jump the queue.

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::cursor::{Advance, FsmapCursor, RefcountCursor};
use crate::error::ClearResult;
use crate::fsops::FsOps;
use crate::request::ClearCtx;
use crate::visited::VisitedSet;

/// Rank of a candidate before its score is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PriorityClass {
    /// Written data; moving it means copying or remapping bytes.
    #[default]
    Written,
    /// Unwritten extents; nothing to copy.
    Unwritten,
}

/// How urgently a candidate extent should be evacuated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority {
    /// Compared first.
    pub class: PriorityClass,
    /// Blocks times owners, saturating.
    pub score: u64,
}

impl Priority {
    /// Computes the priority of an extent of `length` bytes with `owners` owners.
    pub fn new(length: u64, block_size: u64, owners: u64, class: PriorityClass) -> Self {
        Self {
            class,
            score: (length / block_size).saturating_mul(owners),
        }
    }
}

/// The extent currently being evacuated, and what became of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvacuationTarget {
    /// Physical start in bytes.
    pub start: u64,
    /// Length in bytes; zero means nothing left to do.
    pub length: u64,
    /// Owners observed when the extent was selected.
    pub owners: u64,
    /// Selection priority.
    pub priority: Priority,
    /// Owners successfully moved away.
    pub evacuated: u64,
    /// Some owner could not be moved and should be retried in a later pass.
    pub try_again: bool,
}

impl EvacuationTarget {
    /// Returns whether this target is better than `other`.
    ///
    /// Higher priority wins; equal priority prefers the longer extent.
    pub fn beats(&self, other: &EvacuationTarget) -> bool {
        match self.priority.cmp(&other.priority) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.length > other.length,
        }
    }

    fn offer(&mut self, candidate: EvacuationTarget) {
        if self.length == 0 || candidate.beats(self) {
            trace!(
                "candidate {:#x}+{:#x} owners={} prio={:?}",
                candidate.start,
                candidate.length,
                candidate.owners,
                candidate.priority
            );
            *self = candidate;
        }
    }
}

/// Picks the best unvisited extent in the range and marks it visited.
///
/// Returns a zero-length target when nothing is left to try in this pass.
pub fn find_target<F: FsOps>(
    ctx: &ClearCtx<'_, F>,
    visited: &mut VisitedSet,
) -> ClearResult<EvacuationTarget> {
    let bs = ctx.geom.block_size;
    let mut best = EvacuationTarget::default();
    let mut refs = RefcountCursor::new(ctx.config.refcount_batch);
    let mut owners = FsmapCursor::new(ctx.config.fsmap_batch);

    refs.start(ctx.device, ctx.start, ctx.length);
    while refs.advance(ctx.fs)? == Advance::MoreRows {
        for rec in refs.rows() {
            let lo = rec.physical.max(ctx.start);
            let hi = rec.end().min(ctx.end());
            if lo >= hi {
                continue;
            }
            for (gap_start, gap_len) in visited.gaps(lo, hi - lo) {
                if rec.owners > 1 {
                    best.offer(EvacuationTarget {
                        start: gap_start,
                        length: gap_len,
                        owners: rec.owners,
                        priority: Priority::new(gap_len, bs, rec.owners, PriorityClass::Written),
                        ..Default::default()
                    });
                    continue;
                }

                owners.start(ctx.device, gap_start, gap_len);
                while owners.advance(ctx.fs)? == Advance::MoreRows {
                    for map in owners.rows() {
                        if !map.is_file_data() || ctx.is_shadow(map.owner) {
                            continue;
                        }
                        let Some(map) = map.clamp(gap_start, gap_start + gap_len) else {
                            continue;
                        };
                        let class = if map.is_unwritten() {
                            PriorityClass::Unwritten
                        } else {
                            PriorityClass::Written
                        };
                        best.offer(EvacuationTarget {
                            start: map.physical,
                            length: map.length,
                            owners: 1,
                            priority: Priority::new(map.length, bs, 1, class),
                            ..Default::default()
                        });
                    }
                }
            }
        }
    }

    if best.length > 0 {
        visited.mark(best.start, best.length);
        debug!(
            "selected target {:#x}+{:#x} owners={} prio={:?}",
            best.start, best.length, best.owners, best.priority
        );
    }
    Ok(best)
}
