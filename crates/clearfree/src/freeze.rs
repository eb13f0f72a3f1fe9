//! Capturing free space and freezing live data in the target range.
//!
//! The capture file mirrors the range: capture offset `o` holds physical byte
//! `start + o`. Free space is mapped into the work file (where the kernel places it at
//! offset == physical) and exchanged across. Written file data is frozen by cloning it
//! into the capture file, so concurrent writers copy-on-write elsewhere instead of
//! rewriting blocks we are trying to empty.

use tracing::{debug, trace};

use crate::cursor::{Advance, BmapCursor, FsmapCursor, RefcountCursor};
use crate::error::{ClearError, ClearResult, Errno};
use crate::fsops::FsOps;
use crate::records::{BmapFork, BmapRecord, BmapState, FsmapRecord};
use crate::request::ClearCtx;

/// Moves every free block of the range into the capture file. Returns bytes captured.
pub fn grab_free_space<F: FsOps>(ctx: &ClearCtx<'_, F>) -> ClearResult<u64> {
    let fs = ctx.fs;
    fs.set_len(&ctx.work, 0)
        .map_err(|e| ClearError::io("truncate work file", e))?;
    fs.set_len(&ctx.work, ctx.end())
        .map_err(|e| ClearError::io("size work file", e))?;
    fs.map_free_space(&ctx.work, ctx.start, ctx.length)
        .map_err(|e| ClearError::io("map_free_space", e))?;

    let mut captured = 0;
    let mut cursor = BmapCursor::new(ctx.config.bmap_batch);
    cursor.start(ctx.start, ctx.length, BmapFork::Data);
    for rec in cursor.collect(fs, &ctx.work)? {
        if rec.physical() != Some(rec.offset) {
            continue;
        }
        fs.exchange_range(
            &ctx.work,
            rec.offset,
            &ctx.space,
            rec.offset - ctx.start,
            rec.length,
            None,
        )
        .map_err(|e| ClearError::io("exchange free space", e))?;
        captured += rec.length;
    }

    fs.set_len(&ctx.work, 0)
        .map_err(|e| ClearError::io("truncate work file", e))?;
    if captured > 0 {
        debug!("captured {} bytes of free space", captured);
    }
    Ok(captured)
}

/// Returns the holes of the capture file as `(capture offset, length)` pairs.
fn capture_holes<F: FsOps>(ctx: &ClearCtx<'_, F>) -> ClearResult<Vec<(u64, u64)>> {
    let mut cursor = BmapCursor::new(ctx.config.bmap_batch);
    cursor.start(0, ctx.length, BmapFork::Data);
    let recs = cursor.collect(ctx.fs, &ctx.space)?;

    let mut holes: Vec<(u64, u64)> = Vec::new();
    let mut pos = 0;
    for rec in recs.iter().filter(|r| r.state != BmapState::Hole) {
        if rec.offset > pos {
            holes.push((pos, rec.offset - pos));
        }
        pos = pos.max(rec.end());
    }
    if pos < ctx.length {
        holes.push((pos, ctx.length - pos));
    }
    Ok(holes)
}

/// Clones every file mapping found in a hole of the capture file into the capture file.
///
/// Mappings that change underneath us are skipped; the next hole scan retries them.
pub fn freeze_range<F: FsOps>(ctx: &ClearCtx<'_, F>) -> ClearResult<()> {
    let mut cursor = FsmapCursor::new(ctx.config.fsmap_batch);
    for (hole, len) in capture_holes(ctx)? {
        let phys = ctx.start + hole;
        cursor.start(ctx.device, phys, len);
        while cursor.advance(ctx.fs)? == Advance::MoreRows {
            for rec in cursor.rows() {
                if !rec.is_file_data() || ctx.is_shadow(rec.owner) {
                    continue;
                }
                if let Some(rec) = rec.clamp(phys, phys + len) {
                    freeze_mapping(ctx, &rec)?;
                }
            }
        }
    }
    Ok(())
}

/// Checks that `[offset, offset + len)` of the work file maps the expected physical blocks.
fn verify_work<F: FsOps>(
    ctx: &ClearCtx<'_, F>,
    rec: &FsmapRecord,
    len: u64,
) -> ClearResult<bool> {
    let mut cursor = BmapCursor::new(ctx.config.bmap_batch);
    cursor.start(rec.offset, len, BmapFork::Data);
    let maps: Vec<BmapRecord> = cursor.collect(ctx.fs, &ctx.work)?;
    if maps.is_empty() {
        return Ok(rec.is_unwritten());
    }
    let ok = maps.iter().all(|m| {
        if rec.is_unwritten() {
            return m.state == BmapState::Hole;
        }
        let expected = rec.physical + (m.offset - rec.offset);
        m.physical() == Some(expected) && !m.unwritten
    });
    Ok(ok)
}

fn owners_at<F: FsOps>(ctx: &ClearCtx<'_, F>, physical: u64, len: u64) -> ClearResult<u64> {
    let mut cursor = RefcountCursor::new(1);
    cursor.start(ctx.device, physical, len);
    let mut owners = 0;
    while cursor.advance(ctx.fs)? == Advance::MoreRows {
        for rec in cursor.rows() {
            owners = owners.max(rec.owners);
        }
    }
    Ok(owners)
}

fn freeze_mapping<F: FsOps>(ctx: &ClearCtx<'_, F>, rec: &FsmapRecord) -> ClearResult<()> {
    let fs = ctx.fs;
    let bs = ctx.geom.block_size;
    let owner = match fs.open_owner(rec.owner) {
        Ok(f) => f,
        Err(e) if Errno::of(&e) == Errno::Gone => return Ok(()),
        Err(e) => return Err(ClearError::io("open_owner", e)),
    };
    let size = fs
        .stat(&owner)
        .map_err(|e| ClearError::io("stat owner", e))?
        .size;
    if rec.offset >= size {
        trace!("ino {} mapping at {:#x} is past EOF", rec.owner, rec.offset);
        return Ok(());
    }

    fs.set_len(&ctx.work, 0)
        .map_err(|e| ClearError::io("truncate work file", e))?;
    let at_eof = rec.offset + rec.length > size;
    let clone_len = if at_eof {
        size - rec.offset
    } else {
        rec.length
    };
    match fs.clone_range(&owner, rec.offset, clone_len, &ctx.work, rec.offset) {
        Ok(()) => {}
        Err(e) if matches!(Errno::of(&e), Errno::Invalid | Errno::NoSpace) => {
            debug!("ino {} changed while freezing: {}", rec.owner, e);
            return Ok(());
        }
        Err(e) => return Err(ClearError::io("clone_range", e)),
    }

    let mut len = clone_len;
    if at_eof && clone_len % bs != 0 {
        // Give the owner its own copy of the partial tail block, so the old one is ours.
        let tail = ctx.geom.round_down(clone_len);
        if let Err(e) = fs.unshare_range(&owner, rec.offset + tail, bs) {
            if !matches!(Errno::of(&e), Errno::Invalid | Errno::NoSpace) {
                return Err(ClearError::io("unshare owner tail", e));
            }
        }
        fs.set_len(&ctx.work, rec.offset + ctx.geom.round_up(clone_len))
            .map_err(|e| ClearError::io("size work file", e))?;
        len = if owners_at(ctx, rec.physical + tail, bs)? > 1 {
            tail
        } else {
            ctx.geom.round_up(clone_len)
        };
    }
    drop(owner);

    if len == 0 || !verify_work(ctx, rec, len)? {
        debug!(
            "ino {} no longer maps {:#x}, retrying later",
            rec.owner, rec.physical
        );
        fs.set_len(&ctx.work, 0)
            .map_err(|e| ClearError::io("truncate work file", e))?;
        return Ok(());
    }

    if !rec.is_unwritten() {
        let dst = rec.physical - ctx.start;
        match fs.clone_range(&ctx.work, rec.offset, len, &ctx.space, dst) {
            Ok(()) => {}
            Err(e) if Errno::of(&e) == Errno::NoSpace => {
                fs.exchange_range(&ctx.work, rec.offset, &ctx.space, dst, len, None)
                    .map_err(|e| ClearError::io("exchange into capture file", e))?;
            }
            Err(e) => return Err(ClearError::io("clone into capture file", e)),
        }
        trace!(
            "froze ino {} {:#x}+{:#x} at {:#x}",
            rec.owner,
            rec.offset,
            len,
            rec.physical
        );
    }

    fs.set_len(&ctx.work, 0)
        .map_err(|e| ClearError::io("truncate work file", e))?;
    Ok(())
}

/// Grabs free space and freezes data until the capture file stops growing.
pub fn freeze_until_stable<F: FsOps>(ctx: &ClearCtx<'_, F>) -> ClearResult<()> {
    let fs = ctx.fs;
    let mut last = fs
        .stat(&ctx.space)
        .map_err(|e| ClearError::io("stat capture file", e))?
        .allocated;
    for round in 0..ctx.config.max_freeze_rounds {
        grab_free_space(ctx)?;
        freeze_range(ctx)?;
        grab_free_space(ctx)?;
        let now = fs
            .stat(&ctx.space)
            .map_err(|e| ClearError::io("stat capture file", e))?
            .allocated;
        debug!("freeze round {}: capture file holds {} bytes", round, now);
        if now <= last {
            break;
        }
        last = now;
    }
    Ok(())
}
