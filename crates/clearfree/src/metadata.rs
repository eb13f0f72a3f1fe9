//! Relocating filesystem metadata out of the range via online repair.
//!
//! Metadata blocks cannot be moved directly. Instead, each allocation group holding
//! metadata in the range gets a forced rebuild of the affected btrees; the new copies
//! are written into free space, which the capture file has already claimed inside the
//! range, so they land elsewhere.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::cursor::{Advance, FsmapCursor};
use crate::error::{ClearError, ClearResult, Errno};
use crate::fsops::FsOps;
use crate::records::{ScrubKind, ScrubOutcome, SpecialOwner};
use crate::request::ClearCtx;
use crate::visited::VisitedSet;

/// Set of btrees to rebuild, one bit per [`ScrubKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildMask(u8);

impl RebuildMask {
    /// No rebuilds.
    pub const EMPTY: RebuildMask = RebuildMask(0);

    fn bit(kind: ScrubKind) -> u8 {
        1 << ScrubKind::ALL.iter().position(|k| *k == kind).unwrap_or(0)
    }

    /// Builds a mask from a list of kinds.
    pub fn of(kinds: &[ScrubKind]) -> Self {
        RebuildMask(kinds.iter().fold(0, |m, k| m | Self::bit(*k)))
    }

    /// Returns whether the mask is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns whether `kind` is in the mask.
    pub fn contains(self, kind: ScrubKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    /// Union of two masks.
    pub fn union(self, other: RebuildMask) -> RebuildMask {
        RebuildMask(self.0 | other.0)
    }

    /// Kinds in `self` but not in `other`.
    pub fn minus(self, other: RebuildMask) -> RebuildMask {
        RebuildMask(self.0 & !other.0)
    }

    /// Kinds in the mask, in rebuild order.
    pub fn kinds(self) -> impl Iterator<Item = ScrubKind> {
        ScrubKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

/// What to do about an internal owner found in the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataAction {
    /// Rebuild these btrees.
    Rebuild(RebuildMask),
    /// Inode chunks; no relocation mechanism exists yet.
    RelocateInodes,
    /// Cannot be moved online (superblocks, log, free space, CoW staging).
    Skip,
    /// Deliberately left alone (unknown or defective blocks).
    Ignore,
}

/// Maps an internal owner to the action that can move its blocks.
pub fn action_for(owner: SpecialOwner) -> MetadataAction {
    match owner {
        SpecialOwner::Ag => MetadataAction::Rebuild(RebuildMask::of(&[
            ScrubKind::Bnobt,
            ScrubKind::Cntbt,
            ScrubKind::Rmapbt,
        ])),
        SpecialOwner::Inobt => {
            MetadataAction::Rebuild(RebuildMask::of(&[ScrubKind::Inobt, ScrubKind::Finobt]))
        }
        SpecialOwner::Refc => MetadataAction::Rebuild(RebuildMask::of(&[ScrubKind::Refcntbt])),
        SpecialOwner::Inodes => MetadataAction::RelocateInodes,
        SpecialOwner::Fs | SpecialOwner::Log | SpecialOwner::Free | SpecialOwner::Cow => {
            MetadataAction::Skip
        }
        SpecialOwner::Unknown | SpecialOwner::Defective | SpecialOwner::Other(_) => {
            MetadataAction::Ignore
        }
    }
}

/// Drives forced rebuilds of metadata found in the range.
#[derive(Debug, Default)]
pub struct MetadataRelocator {
    done: BTreeMap<u32, RebuildMask>,
    rebuilds: u64,
    disabled: bool,
}

impl MetadataRelocator {
    /// Creates a relocator with no rebuilds issued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forced rebuilds issued so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Returns whether the filesystem turned out not to support forced rebuilds.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Scans the unvisited parts of the range and issues rebuilds not yet attempted.
    ///
    /// Returns whether any new rebuild was issued.
    pub fn relocate<F: FsOps>(
        &mut self,
        ctx: &ClearCtx<'_, F>,
        visited: &VisitedSet,
    ) -> ClearResult<bool> {
        if self.disabled {
            return Ok(false);
        }

        let mut wanted: BTreeMap<u32, RebuildMask> = BTreeMap::new();
        let mut cursor = FsmapCursor::new(ctx.config.fsmap_batch);
        for (lo, len) in visited.gaps(ctx.start, ctx.length) {
            cursor.start(ctx.device, lo, len);
            while cursor.advance(ctx.fs)? == Advance::MoreRows {
                for rec in cursor.rows() {
                    let Some(owner) = rec.special_owner() else {
                        continue;
                    };
                    let agno = ctx.geom.agno_of(rec.physical.max(lo));
                    match action_for(owner) {
                        MetadataAction::Rebuild(mask) => {
                            let entry = wanted.entry(agno).or_default();
                            *entry = entry.union(mask);
                        }
                        MetadataAction::RelocateInodes => relocate_inodes(agno, rec.physical),
                        MetadataAction::Skip => {
                            debug!("{:?} at {:#x} cannot move", owner, rec.physical)
                        }
                        MetadataAction::Ignore => {}
                    }
                }
            }
        }

        let mut issued = false;
        for (agno, mask) in wanted {
            let done = self.done.get(&agno).copied().unwrap_or_default();
            let todo = mask.minus(done);
            if todo.is_empty() {
                continue;
            }
            self.done.insert(agno, done.union(todo));
            for kind in todo.kinds() {
                if !self.rebuild(ctx, agno, kind)? {
                    return Ok(issued);
                }
                issued = true;
            }
        }
        Ok(issued)
    }

    /// Issues one forced rebuild. Returns false once rebuilds are known to be unsupported.
    fn rebuild<F: FsOps>(
        &mut self,
        ctx: &ClearCtx<'_, F>,
        agno: u32,
        kind: ScrubKind,
    ) -> ClearResult<bool> {
        match ctx.fs.scrub_metadata(agno, kind) {
            Ok(ScrubOutcome::Rebuilt) => {
                self.rebuilds += 1;
                debug!("rebuilt {:?} in AG {}", kind, agno);
                Ok(true)
            }
            Ok(ScrubOutcome::NeedsRepair) => {
                self.rebuilds += 1;
                warn!("{:?} in AG {} still needs repair after rebuild", kind, agno);
                Ok(true)
            }
            Err(e) => match Errno::of(&e) {
                Errno::Gone | Errno::NoSpace => {
                    debug!("rebuild of {:?} in AG {} skipped: {}", kind, agno, e);
                    Ok(true)
                }
                Errno::NotSupported => {
                    info!("online repair unavailable, leaving metadata in place");
                    self.disabled = true;
                    Ok(false)
                }
                _ => Err(ClearError::io("scrub_metadata", e)),
            },
        }
    }
}

/// Inode chunks cannot be relocated yet; they stay where they are.
fn relocate_inodes(agno: u32, physical: u64) {
    debug!(
        "inode chunk at {:#x} in AG {} left in place",
        physical, agno
    );
}
