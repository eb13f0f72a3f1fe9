//! A clearing request: lifecycle, orchestration and reporting.
//!
//! A [`ClearRequest`] owns two unlinked scratch files on the target filesystem: the
//! capture file, which accumulates ownership of the range, and the work file used to
//! stage copies and free-space mappings. Both are released when the request is freed or
//! dropped, whatever state the last run left behind.

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, info, info_span, warn};

use crate::config::ClearConfig;
use crate::cursor::BmapCursor;
use crate::error::{ClearError, ClearResult};
use crate::evacuate::{evacuate_target, DedupeStrategy, EvacuationStrategy, ExchangeStrategy};
use crate::freeze::{freeze_until_stable, grab_free_space};
use crate::fsops::FsOps;
use crate::geometry::Geometry;
use crate::metadata::MetadataRelocator;
use crate::records::{BmapFork, BmapState};
use crate::target::{find_target, EvacuationTarget};
use crate::visited::VisitedSet;

/// Where a request is in its last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Free space captured and live data frozen.
    Prepared,
    /// Moving file data.
    Evacuating,
    /// Rebuilding metadata.
    EvacuatingMetadata,
    /// The run finished.
    Done,
    /// The run stopped on a fatal error.
    Failed,
}

/// Counters from one [`ClearRequest::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Targets selected.
    pub targets: u64,
    /// Owner mappings moved away.
    pub evacuated: u64,
    /// Targets with at least one owner left for a later pass.
    pub retries: u64,
    /// Forced metadata rebuilds issued.
    pub metadata_rebuilds: u64,
    /// Bytes of the range newly owned by the capture file.
    pub newly_cleared: u64,
    /// Phase the run ended in.
    pub phase: Phase,
}

/// How much of the range the capture file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Efficacy {
    /// Bytes mapped only by the capture file, at their own physical address.
    pub cleared: u64,
    /// Bytes requested.
    pub requested: u64,
}

impl Efficacy {
    /// Cleared fraction as a percentage.
    pub fn percent(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        self.cleared as f64 * 100.0 / self.requested as f64
    }

    /// Returns whether the whole range is cleared.
    pub fn is_complete(&self) -> bool {
        self.cleared >= self.requested
    }
}

/// State shared by the engine's phases for one request.
pub struct ClearCtx<'a, F: FsOps> {
    pub(crate) fs: &'a F,
    pub(crate) geom: Geometry,
    pub(crate) config: ClearConfig,
    pub(crate) device: u32,
    pub(crate) start: u64,
    pub(crate) length: u64,
    pub(crate) space: F::File,
    pub(crate) space_ino: u64,
    pub(crate) work: F::File,
    pub(crate) work_ino: u64,
}

impl<F: FsOps> ClearCtx<'_, F> {
    /// End of the range, exclusive.
    pub(crate) fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Returns whether an inode is one of our scratch files.
    pub(crate) fn is_shadow(&self, ino: u64) -> bool {
        ino == self.space_ino || ino == self.work_ino
    }
}

impl<F: FsOps> Drop for ClearCtx<'_, F> {
    fn drop(&mut self) {
        debug!(
            "releasing scratch files {} and {} for {:#x}+{:#x}",
            self.space_ino, self.work_ino, self.start, self.length
        );
    }
}

/// Request to clear `[start, start + length)` of one device.
pub struct ClearRequest<'a, F: FsOps> {
    ctx: ClearCtx<'a, F>,
    strategy: Box<dyn EvacuationStrategy<F> + 'a>,
    visited: VisitedSet,
    freeze: bool,
    evacuate_metadata: bool,
    phase: Phase,
}

impl<'a, F: FsOps + 'a> ClearRequest<'a, F> {
    /// Validates the range against the filesystem and creates the scratch files.
    pub fn init(fs: &'a F, start: u64, length: u64, config: ClearConfig) -> ClearResult<Self> {
        config.validate()?;
        let geom = fs
            .geometry()
            .map_err(|e| ClearError::io("fsgeometry", e))?;
        let realtime = config.realtime;

        let device = match geom.device(realtime) {
            Some(dev) if !realtime || geom.rt_blocks > 0 => dev,
            _ => return Err(ClearError::NoRealtimeDevice),
        };
        if !geom.rmapbt {
            return Err(ClearError::Unsupported { op: "getfsmap" });
        }
        validate_range(&geom, realtime, start, length)?;

        let dedupe = match config.use_dedupe {
            Some(true) if !geom.reflink => return Err(ClearError::Unsupported { op: "dedupe" }),
            Some(forced) => forced,
            None => geom.reflink,
        };
        let strategy: Box<dyn EvacuationStrategy<F> + 'a> = if dedupe {
            Box::new(DedupeStrategy::new())
        } else {
            Box::new(ExchangeStrategy::new())
        };

        let space = fs
            .create_temp_file(realtime)
            .map_err(|e| ClearError::io("create capture file", e))?;
        fs.set_len(&space, length)
            .map_err(|e| ClearError::io("size capture file", e))?;
        let work = fs
            .create_temp_file(realtime)
            .map_err(|e| ClearError::io("create work file", e))?;
        let space_ino = fs
            .stat(&space)
            .map_err(|e| ClearError::io("stat capture file", e))?
            .ino;
        let work_ino = fs
            .stat(&work)
            .map_err(|e| ClearError::io("stat work file", e))?
            .ino;

        let freeze = geom.reflink;
        let evacuate_metadata = config.evacuate_metadata && !realtime;
        info!(
            "clearing {:#x}+{:#x} on {} device with {} strategy",
            start,
            length,
            if realtime { "realtime" } else { "data" },
            strategy.name()
        );

        Ok(Self {
            ctx: ClearCtx {
                fs,
                geom,
                config,
                device,
                start,
                length,
                space,
                space_ino,
                work,
                work_ino,
            },
            strategy,
            visited: VisitedSet::new(),
            freeze,
            evacuate_metadata,
            phase: Phase::Prepared,
        })
    }

    /// Runs one full clearing pass.
    ///
    /// Running again after a pass left owners behind picks them up; running on a fully
    /// cleared range does nothing.
    pub fn run(&mut self) -> ClearResult<RunReport> {
        let span = info_span!("clearspace", start = self.ctx.start, length = self.ctx.length);
        let _enter = span.enter();

        let before = self.efficacy()?.cleared;
        let mut report = RunReport {
            targets: 0,
            evacuated: 0,
            retries: 0,
            metadata_rebuilds: 0,
            newly_cleared: 0,
            phase: Phase::Prepared,
        };
        match self.run_passes(&mut report) {
            Ok(()) => {
                self.phase = Phase::Done;
                report.phase = Phase::Done;
                report.newly_cleared = self.efficacy()?.cleared.saturating_sub(before);
                info!(
                    "pass done: {} targets, {} owners moved, {} retries, {} rebuilds",
                    report.targets, report.evacuated, report.retries, report.metadata_rebuilds
                );
                Ok(report)
            }
            Err(e) => {
                warn!("clearing failed in {:?}: {}", self.phase, e);
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    fn run_passes(&mut self, report: &mut RunReport) -> ClearResult<()> {
        self.visited.clear();
        self.phase = Phase::Prepared;
        self.prepare()?;

        self.phase = Phase::Evacuating;
        loop {
            let mut target = find_target(&self.ctx, &mut self.visited)?;
            if target.length == 0 {
                break;
            }
            report.targets += 1;
            self.evacuate(&mut target)?;
            report.evacuated += target.evacuated;
            if target.try_again {
                report.retries += 1;
            }
        }

        if self.evacuate_metadata {
            self.phase = Phase::EvacuatingMetadata;
            let mut relocator = MetadataRelocator::new();
            for _ in 0..self.ctx.config.max_metadata_rounds {
                if !relocator.relocate(&self.ctx, &self.visited)? {
                    break;
                }
                grab_free_space(&self.ctx)?;
            }
            if relocator.is_disabled() {
                self.evacuate_metadata = false;
            }
            report.metadata_rebuilds = relocator.rebuilds();
        }

        grab_free_space(&self.ctx)?;
        Ok(())
    }

    fn prepare(&mut self) -> ClearResult<()> {
        let fs = self.ctx.fs;
        fs.sync_fs().map_err(|e| ClearError::io("syncfs", e))?;
        fs.free_eofblocks()
            .map_err(|e| ClearError::io("free_eofblocks", e))?;
        if self.freeze {
            freeze_until_stable(&self.ctx)
        } else {
            grab_free_space(&self.ctx).map(|_| ())
        }
    }

    fn evacuate(&mut self, target: &mut EvacuationTarget) -> ClearResult<()> {
        let span = debug_span!("target", start = target.start, length = target.length);
        let _enter = span.enter();
        evacuate_target(self.strategy.as_mut(), &self.ctx, target)?;
        if target.evacuated > 0 {
            grab_free_space(&self.ctx)?;
        }
        Ok(())
    }

    /// Selects and marks the next target without evacuating it.
    pub fn next_target(&mut self) -> ClearResult<EvacuationTarget> {
        find_target(&self.ctx, &mut self.visited)
    }

    /// Measures how much of the range the capture file holds at its own address.
    ///
    /// Frozen blocks still shared with a file are not cleared and are left out.
    pub fn efficacy(&self) -> ClearResult<Efficacy> {
        let mut cursor = BmapCursor::new(self.ctx.config.bmap_batch);
        cursor.start(0, self.ctx.length, BmapFork::Data);
        let cleared = cursor
            .collect(self.ctx.fs, &self.ctx.space)?
            .iter()
            .filter(|rec| !rec.shared)
            .filter_map(|rec| match rec.state {
                BmapState::Mapped(phys) if phys == self.ctx.start + rec.offset => {
                    Some(rec.length.min(self.ctx.length - rec.offset))
                }
                _ => None,
            })
            .sum();
        Ok(Efficacy {
            cleared,
            requested: self.ctx.length,
        })
    }

    /// Releases the scratch files, handing the captured space back to the filesystem.
    pub fn free(self) {
        info!(
            "releasing request for {:#x}+{:#x}",
            self.ctx.start, self.ctx.length
        );
    }

    /// Phase the last run reached.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Name of the strategy picked at init.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Regions attempted during the current pass.
    pub fn visited(&self) -> &VisitedSet {
        &self.visited
    }

    /// Inode of the capture file.
    pub fn capture_ino(&self) -> u64 {
        self.ctx.space_ino
    }

    /// Inode of the work file.
    pub fn work_ino(&self) -> u64 {
        self.ctx.work_ino
    }

    /// Returns whether metadata relocation is still enabled.
    pub fn evacuates_metadata(&self) -> bool {
        self.evacuate_metadata
    }
}

fn validate_range(geom: &Geometry, realtime: bool, start: u64, length: u64) -> ClearResult<()> {
    let invalid = |reason: &str| ClearError::InvalidRange {
        start,
        length,
        reason: reason.to_string(),
    };
    if length == 0 {
        return Err(invalid("empty range"));
    }
    let end = start
        .checked_add(length)
        .ok_or_else(|| invalid("range overflows"))?;
    let unit = geom.alloc_unit(realtime);
    if start % unit != 0 || length % unit != 0 {
        return Err(invalid(&format!("not aligned to {} bytes", unit)));
    }
    if end > geom.device_bytes(realtime) {
        return Err(invalid("past the end of the device"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::{MemFs, MemFsConfig};

    const BS: u64 = 4096;

    #[test]
    fn test_init_rejects_bad_ranges() {
        let fs = MemFs::new(MemFsConfig::default());
        let cfg = ClearConfig::default();
        for (start, len) in [(0, 0), (100, BS), (0, 100), (u64::MAX - BS + 1, BS), (0, 2048 * BS)] {
            let err = ClearRequest::init(&fs, start, len, cfg.clone()).err();
            assert!(
                matches!(err, Some(ClearError::InvalidRange { .. })),
                "{}+{} accepted",
                start,
                len
            );
        }
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_init_rejects_missing_realtime() {
        let fs = MemFs::new(MemFsConfig::default());
        let cfg = ClearConfig {
            realtime: true,
            ..Default::default()
        };
        assert!(matches!(
            ClearRequest::init(&fs, 0, BS, cfg),
            Err(ClearError::NoRealtimeDevice)
        ));
    }

    #[test]
    fn test_forced_dedupe_needs_reflink() {
        let fs = MemFs::new(MemFsConfig {
            reflink: false,
            ..Default::default()
        });
        let cfg = ClearConfig {
            use_dedupe: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            ClearRequest::init(&fs, 0, BS, cfg),
            Err(ClearError::Unsupported { op: "dedupe" })
        ));
    }

    #[test]
    fn test_strategy_selection() {
        let fs = MemFs::new(MemFsConfig::default());
        let req = ClearRequest::init(&fs, 0, 16 * BS, ClearConfig::default()).unwrap();
        assert_eq!(req.strategy_name(), "dedupe");
        drop(req);

        let cfg = ClearConfig {
            use_dedupe: Some(false),
            ..Default::default()
        };
        let req = ClearRequest::init(&fs, 0, 16 * BS, cfg).unwrap();
        assert_eq!(req.strategy_name(), "exchange");
    }

    #[test]
    fn test_free_releases_scratch_files() {
        let fs = MemFs::new(MemFsConfig::default());
        let mut req = ClearRequest::init(&fs, 0, 16 * BS, ClearConfig::default()).unwrap();
        assert_eq!(fs.open_handles(), 2);
        req.run().unwrap();
        assert!(!fs.is_free(0, 16 * BS));
        req.free();
        assert_eq!(fs.open_handles(), 0);
        assert!(fs.is_free(0, 16 * BS));
    }

    #[test]
    fn test_efficacy_percent() {
        let e = Efficacy {
            cleared: 3 * BS,
            requested: 4 * BS,
        };
        assert!((e.percent() - 75.0).abs() < f64::EPSILON);
        assert!(!e.is_complete());
    }
}
