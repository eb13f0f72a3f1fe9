//! Moving file owners off a target extent.
//!
//! Two strategies exist and one is picked when the request is created:
//!
//! - [`DedupeStrategy`] stages a private copy of the frozen target in the work file and
//!   asks the kernel to remap each owner onto it. The kernel compares contents first, so
//!   a racing writer simply makes the dedupe fail.
//! - [`ExchangeStrategy`] copies each owner's bytes into the work file and swaps the
//!   mappings, guarded by a freshness token sampled before the copy.
//!
//! Unwritten owner extents carry no data, so both strategies relocate them by
//! preallocating the same file range in the work file and exchanging.

use tracing::{debug, trace, warn};

use crate::cursor::{BmapCursor, FsmapCursor};
use crate::error::{ClearError, ClearResult, Errno};
use crate::fsops::FsOps;
use crate::records::{BmapFork, BmapState, DedupeOutcome, FsmapRecord};
use crate::request::ClearCtx;
use crate::target::EvacuationTarget;

/// Largest range handed to a single dedupe call.
pub const DEDUPE_MAX: u64 = 16 * 1024 * 1024;

/// Copy buffer for the exchange strategy.
const COPY_BUF: usize = 1024 * 1024;

/// A way of moving one owner's mapping away from a target extent.
pub trait EvacuationStrategy<F: FsOps> {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Stages whatever the strategy needs before the target's owners are visited.
    fn prepare(&mut self, ctx: &ClearCtx<'_, F>, target: &EvacuationTarget) -> ClearResult<()>;

    /// Moves one written owner mapping, recording the outcome on `target`.
    fn evacuate_mapping(
        &mut self,
        ctx: &ClearCtx<'_, F>,
        target: &mut EvacuationTarget,
        rec: &FsmapRecord,
    ) -> ClearResult<()>;
}

/// Opens the owner of a mapping. `None` means the inode went away and there is nothing
/// left to move.
fn open_owner<F: FsOps>(ctx: &ClearCtx<'_, F>, ino: u64) -> ClearResult<Option<F::File>> {
    match ctx.fs.open_owner(ino) {
        Ok(f) => Ok(Some(f)),
        Err(e) if Errno::of(&e) == Errno::Gone => {
            trace!("ino {} is gone", ino);
            Ok(None)
        }
        Err(e) => Err(ClearError::io("open_owner", e)),
    }
}

fn truncate_work<F: FsOps>(ctx: &ClearCtx<'_, F>) -> ClearResult<()> {
    ctx.fs
        .set_len(&ctx.work, 0)
        .map_err(|e| ClearError::io("truncate work file", e))
}

/// Evacuates every owner of `target` with `strategy`.
pub fn evacuate_target<F: FsOps>(
    strategy: &mut dyn EvacuationStrategy<F>,
    ctx: &ClearCtx<'_, F>,
    target: &mut EvacuationTarget,
) -> ClearResult<()> {
    if target.length == 0 {
        return Ok(());
    }
    strategy.prepare(ctx, target)?;

    let mut cursor = FsmapCursor::new(ctx.config.fsmap_batch);
    cursor.start(ctx.device, target.start, target.length);
    let recs = cursor.collect(ctx.fs)?;
    let lo = target.start;
    let hi = target.start + target.length;
    for rec in recs {
        if !rec.is_file_data() || ctx.is_shadow(rec.owner) {
            continue;
        }
        let Some(rec) = rec.clamp(lo, hi) else {
            continue;
        };
        if rec.is_unwritten() {
            relocate_unwritten(ctx, target, &rec)?;
        } else {
            strategy.evacuate_mapping(ctx, target, &rec)?;
        }
    }

    truncate_work(ctx)?;
    debug!(
        "{} target {:#x}+{:#x}: {} owners moved{}",
        strategy.name(),
        target.start,
        target.length,
        target.evacuated,
        if target.try_again { ", retry later" } else { "" }
    );
    Ok(())
}

/// Swaps an unwritten owner extent for a freshly preallocated one.
fn relocate_unwritten<F: FsOps>(
    ctx: &ClearCtx<'_, F>,
    target: &mut EvacuationTarget,
    rec: &FsmapRecord,
) -> ClearResult<()> {
    let fs = ctx.fs;
    let Some(owner) = open_owner(ctx, rec.owner)? else {
        return Ok(());
    };
    let guard = match fs.start_exchange(&owner) {
        Ok(g) => g,
        Err(e) if Errno::of(&e).is_transient() => {
            target.try_again = true;
            return Ok(());
        }
        Err(e) => return Err(ClearError::io("start_exchange", e)),
    };
    let size = fs
        .stat(&owner)
        .map_err(|e| ClearError::io("stat owner", e))?
        .size;

    truncate_work(ctx)?;
    fs.set_len(&ctx.work, size.max(rec.offset + rec.length))
        .map_err(|e| ClearError::io("size work file", e))?;
    match fs.preallocate(&ctx.work, rec.offset, rec.length) {
        Ok(()) => {}
        Err(e) if Errno::of(&e) == Errno::NoSpace => {
            warn!("no space to relocate unwritten extent of ino {}", rec.owner);
            target.try_again = true;
            return truncate_work(ctx);
        }
        Err(e) => return Err(ClearError::io("preallocate", e)),
    }

    match fs.exchange_range(&ctx.work, rec.offset, &owner, rec.offset, rec.length, Some(&guard)) {
        Ok(()) => {
            target.evacuated += 1;
            trace!("relocated unwritten ino {} {:#x}", rec.owner, rec.offset);
        }
        Err(e) if Errno::of(&e).is_transient() => {
            debug!("ino {} changed during unwritten exchange: {}", rec.owner, e);
            target.try_again = true;
        }
        Err(e) => return Err(ClearError::io("exchange_range", e)),
    }
    truncate_work(ctx)
}

/// Remaps owners onto an unshared copy of the frozen target.
#[derive(Debug, Default)]
pub struct DedupeStrategy;

enum Dedupe {
    Done(u64),
    Retry,
}

impl DedupeStrategy {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }

    fn dedupe_once<F: FsOps>(
        ctx: &ClearCtx<'_, F>,
        owner: &F::File,
        work_off: u64,
        len: u64,
        file_off: u64,
    ) -> ClearResult<Dedupe> {
        let fs = ctx.fs;
        let mut unshared = false;
        loop {
            match fs.dedupe_range(&ctx.work, work_off, len, owner, file_off) {
                Ok(DedupeOutcome::Same(n)) => return Ok(Dedupe::Done(n)),
                Ok(DedupeOutcome::Differs) => return Ok(Dedupe::Retry),
                Err(e) => match Errno::of(&e) {
                    Errno::NoSpace if !unshared => {
                        // The staged copy may still share blocks with the target.
                        unshared = true;
                        if let Err(e) = fs.unshare_range(&ctx.work, work_off, len) {
                            if Errno::of(&e) == Errno::NoSpace {
                                return Ok(Dedupe::Retry);
                            }
                            return Err(ClearError::io("unshare work file", e));
                        }
                    }
                    Errno::NoSpace | Errno::Invalid | Errno::Busy | Errno::Gone => {
                        trace!("dedupe at {:#x} refused: {}", file_off, e);
                        return Ok(Dedupe::Retry);
                    }
                    _ => return Err(ClearError::io("dedupe_range", e)),
                },
            }
        }
    }

    /// Dedupes `[file_off, file_off + len)`, finishing short results block by block.
    fn dedupe_extent<F: FsOps>(
        ctx: &ClearCtx<'_, F>,
        owner: &F::File,
        work_off: u64,
        len: u64,
        file_off: u64,
    ) -> ClearResult<bool> {
        let bs = ctx.geom.block_size;
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(DEDUPE_MAX);
            match Self::dedupe_once(ctx, owner, work_off + done, chunk, file_off + done)? {
                Dedupe::Done(n) if n >= chunk => done += chunk,
                Dedupe::Done(n) => {
                    let mut pos = done + ctx.geom.round_down(n);
                    let end = done + chunk;
                    while pos < end {
                        let step = (end - pos).min(bs);
                        match Self::dedupe_once(ctx, owner, work_off + pos, step, file_off + pos)? {
                            Dedupe::Done(m) if m >= step => pos += step,
                            _ => return Ok(false),
                        }
                    }
                    done = end;
                }
                Dedupe::Retry => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl<F: FsOps> EvacuationStrategy<F> for DedupeStrategy {
    fn name(&self) -> &'static str {
        "dedupe"
    }

    /// Clones the capture file's view of the target into the work file at the same
    /// offsets, then unshares it so the work file holds private blocks with equal bytes.
    fn prepare(&mut self, ctx: &ClearCtx<'_, F>, target: &EvacuationTarget) -> ClearResult<()> {
        let fs = ctx.fs;
        let off = target.start - ctx.start;
        truncate_work(ctx)?;
        fs.set_len(&ctx.work, ctx.length)
            .map_err(|e| ClearError::io("size work file", e))?;

        let mut cursor = BmapCursor::new(ctx.config.bmap_batch);
        cursor.start(off, target.length, BmapFork::Data);
        for rec in cursor.collect(fs, &ctx.space)? {
            if rec.unwritten || !matches!(rec.state, BmapState::Mapped(_)) {
                continue;
            }
            match fs.clone_range(&ctx.space, rec.offset, rec.length, &ctx.work, rec.offset) {
                Ok(()) => {}
                Err(e) if Errno::of(&e) == Errno::NoSpace => {
                    warn!("no space to stage capture data at {:#x}", rec.offset);
                }
                Err(e) => return Err(ClearError::io("clone capture file", e)),
            }
        }

        match fs.unshare_range(&ctx.work, off, target.length) {
            Ok(()) => Ok(()),
            Err(e) if Errno::of(&e) == Errno::NoSpace => {
                debug!("unshare of staged copy ran out of space, continuing");
                Ok(())
            }
            Err(e) => Err(ClearError::io("unshare work file", e)),
        }
    }

    fn evacuate_mapping(
        &mut self,
        ctx: &ClearCtx<'_, F>,
        target: &mut EvacuationTarget,
        rec: &FsmapRecord,
    ) -> ClearResult<()> {
        let Some(owner) = open_owner(ctx, rec.owner)? else {
            return Ok(());
        };
        let size = ctx
            .fs
            .stat(&owner)
            .map_err(|e| ClearError::io("stat owner", e))?
            .size;
        if rec.offset >= size {
            target.try_again = true;
            return Ok(());
        }
        let len = rec.length.min(size - rec.offset);
        let work_off = rec.physical - ctx.start;

        if Self::dedupe_extent(ctx, &owner, work_off, len, rec.offset)? {
            target.evacuated += 1;
            trace!("deduped ino {} {:#x}+{:#x}", rec.owner, rec.offset, len);
        } else {
            debug!("ino {} at {:#x} did not dedupe", rec.owner, rec.offset);
            target.try_again = true;
        }
        Ok(())
    }
}

/// Copies owners into the work file and swaps the mappings.
#[derive(Debug)]
pub struct ExchangeStrategy {
    buf: Vec<u8>,
}

impl Default for ExchangeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeStrategy {
    /// Creates the strategy with its copy buffer.
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; COPY_BUF],
        }
    }

    /// Copies `[offset, offset + len)` of `owner` into the work file. Returns false if
    /// the owner shrank underneath us.
    fn copy_to_work<F: FsOps>(
        &mut self,
        ctx: &ClearCtx<'_, F>,
        owner: &F::File,
        offset: u64,
        len: u64,
    ) -> ClearResult<bool> {
        let fs = ctx.fs;
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let want = ((end - pos) as usize).min(self.buf.len());
            let n = fs
                .read_at(owner, &mut self.buf[..want], pos)
                .map_err(|e| ClearError::io("read owner", e))?;
            if n == 0 {
                return Ok(false);
            }
            fs.write_at(&ctx.work, &self.buf[..n], pos)
                .map_err(|e| ClearError::io("write work file", e))?;
            pos += n as u64;
        }
        Ok(true)
    }
}

impl<F: FsOps> EvacuationStrategy<F> for ExchangeStrategy {
    fn name(&self) -> &'static str {
        "exchange"
    }

    fn prepare(&mut self, ctx: &ClearCtx<'_, F>, _target: &EvacuationTarget) -> ClearResult<()> {
        truncate_work(ctx)
    }

    fn evacuate_mapping(
        &mut self,
        ctx: &ClearCtx<'_, F>,
        target: &mut EvacuationTarget,
        rec: &FsmapRecord,
    ) -> ClearResult<()> {
        let fs = ctx.fs;
        let Some(owner) = open_owner(ctx, rec.owner)? else {
            return Ok(());
        };
        let guard = match fs.start_exchange(&owner) {
            Ok(g) => g,
            Err(e) if Errno::of(&e).is_transient() => {
                target.try_again = true;
                return Ok(());
            }
            Err(e) => return Err(ClearError::io("start_exchange", e)),
        };
        let size = fs
            .stat(&owner)
            .map_err(|e| ClearError::io("stat owner", e))?
            .size;
        if rec.offset >= size {
            target.try_again = true;
            return Ok(());
        }
        let len = rec.length.min(size - rec.offset);

        truncate_work(ctx)?;
        let copied = match self.copy_to_work(ctx, &owner, rec.offset, len) {
            Ok(copied) => copied,
            Err(ClearError::Io { source, .. }) if Errno::of(&source) == Errno::NoSpace => {
                warn!("no space to copy ino {} at {:#x}", rec.owner, rec.offset);
                false
            }
            Err(e) => return Err(e),
        };
        if !copied {
            target.try_again = true;
            return truncate_work(ctx);
        }
        fs.set_len(&ctx.work, size)
            .map_err(|e| ClearError::io("size work file", e))?;
        fs.fsync(&ctx.work)
            .map_err(|e| ClearError::io("fsync work file", e))?;

        match fs.exchange_range(&ctx.work, rec.offset, &owner, rec.offset, len, Some(&guard)) {
            Ok(()) => {
                target.evacuated += 1;
                trace!("exchanged ino {} {:#x}+{:#x}", rec.owner, rec.offset, len);
            }
            Err(e) if Errno::of(&e).is_transient() => {
                debug!("ino {} changed during copy: {}", rec.owner, e);
                target.try_again = true;
            }
            Err(e) => return Err(ClearError::io("exchange_range", e)),
        }
        truncate_work(ctx)
    }
}
