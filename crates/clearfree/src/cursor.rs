//! Paginated cursors over the space-map, refcount-map and block-map queries.
//!
//! Each cursor is started over a range, then advanced until it reports
//! [`Advance::Exhausted`]. A batch whose final record lacks the "last" flag means the
//! cursor re-issues the query with its low key moved past that record.

use tracing::trace;

use crate::error::{ClearError, ClearResult};
use crate::fsops::FsOps;
use crate::records::{BmapFork, BmapRecord, BmapRequest, FsmapRecord, RefcountRecord};

/// Result of advancing a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A new batch is available through `rows()`.
    MoreRows,
    /// The query is complete; `rows()` is empty.
    Exhausted,
}

/// Cursor over the physical-to-owner map.
#[derive(Debug)]
pub struct FsmapCursor {
    keys: [FsmapRecord; 2],
    batch: Vec<FsmapRecord>,
    cap: usize,
    done: bool,
}

impl FsmapCursor {
    /// Creates a cursor returning at most `cap` records per batch.
    pub fn new(cap: usize) -> Self {
        Self {
            keys: [FsmapRecord::default(); 2],
            batch: Vec::with_capacity(cap),
            cap,
            done: true,
        }
    }

    /// Starts a query over `[physical, physical + length)` of a device.
    pub fn start(&mut self, device: u32, physical: u64, length: u64) {
        self.keys[0] = FsmapRecord {
            device,
            physical,
            ..Default::default()
        };
        self.keys[1] = FsmapRecord {
            device,
            flags: u32::MAX,
            physical: physical + length.max(1) - 1,
            owner: u64::MAX,
            offset: u64::MAX,
            length: 0,
        };
        self.batch.clear();
        self.done = length == 0;
    }

    /// Fetches the next batch.
    pub fn advance<F: FsOps>(&mut self, fs: &F) -> ClearResult<Advance> {
        self.batch.clear();
        if self.done {
            return Ok(Advance::Exhausted);
        }
        let recs = fs
            .getfsmap(&self.keys, self.cap)
            .map_err(|e| ClearError::io("getfsmap", e))?;
        trace!(
            "getfsmap: {} records from {:#x}",
            recs.len(),
            self.keys[0].physical
        );
        match recs.last() {
            None => {
                self.done = true;
                return Ok(Advance::Exhausted);
            }
            Some(last) if last.is_last() => self.done = true,
            Some(last) => self.keys[0] = *last,
        }
        self.batch = recs;
        Ok(Advance::MoreRows)
    }

    /// Records of the current batch.
    pub fn rows(&self) -> &[FsmapRecord] {
        &self.batch
    }

    /// Calls `f` on every record of the current batch.
    pub fn for_each_row<E>(
        &self,
        mut f: impl FnMut(&FsmapRecord) -> Result<(), E>,
    ) -> Result<(), E> {
        self.batch.iter().try_for_each(|r| f(r))
    }

    /// Runs the whole query and returns every record.
    pub fn collect<F: FsOps>(&mut self, fs: &F) -> ClearResult<Vec<FsmapRecord>> {
        let mut out = Vec::new();
        while self.advance(fs)? == Advance::MoreRows {
            out.extend_from_slice(&self.batch);
        }
        Ok(out)
    }
}

/// Cursor over the physical-to-refcount map.
#[derive(Debug)]
pub struct RefcountCursor {
    keys: [RefcountRecord; 2],
    batch: Vec<RefcountRecord>,
    cap: usize,
    done: bool,
}

impl RefcountCursor {
    /// Creates a cursor returning at most `cap` records per batch.
    pub fn new(cap: usize) -> Self {
        Self {
            keys: [RefcountRecord::default(); 2],
            batch: Vec::with_capacity(cap),
            cap,
            done: true,
        }
    }

    /// Starts a query over `[physical, physical + length)` of a device.
    pub fn start(&mut self, device: u32, physical: u64, length: u64) {
        self.keys[0] = RefcountRecord {
            device,
            physical,
            ..Default::default()
        };
        self.keys[1] = RefcountRecord {
            device,
            flags: u32::MAX,
            physical: physical + length.max(1) - 1,
            owners: u64::MAX,
            length: 0,
        };
        self.batch.clear();
        self.done = length == 0;
    }

    /// Fetches the next batch.
    pub fn advance<F: FsOps>(&mut self, fs: &F) -> ClearResult<Advance> {
        self.batch.clear();
        if self.done {
            return Ok(Advance::Exhausted);
        }
        let recs = fs
            .getfsrefs(&self.keys, self.cap)
            .map_err(|e| ClearError::io("getfsrefcounts", e))?;
        match recs.last() {
            None => {
                self.done = true;
                return Ok(Advance::Exhausted);
            }
            Some(last) if last.is_last() => self.done = true,
            Some(last) => self.keys[0] = *last,
        }
        self.batch = recs;
        Ok(Advance::MoreRows)
    }

    /// Records of the current batch.
    pub fn rows(&self) -> &[RefcountRecord] {
        &self.batch
    }

    /// Calls `f` on every record of the current batch.
    pub fn for_each_row<E>(
        &self,
        mut f: impl FnMut(&RefcountRecord) -> Result<(), E>,
    ) -> Result<(), E> {
        self.batch.iter().try_for_each(|r| f(r))
    }
}

/// Cursor over a file's block map.
#[derive(Debug)]
pub struct BmapCursor {
    req: BmapRequest,
    end: u64,
    batch: Vec<BmapRecord>,
    cap: usize,
    done: bool,
}

impl BmapCursor {
    /// Creates a cursor returning at most `cap` records per batch.
    pub fn new(cap: usize) -> Self {
        Self {
            req: BmapRequest {
                offset: 0,
                length: 0,
                fork: BmapFork::Data,
            },
            end: 0,
            batch: Vec::with_capacity(cap),
            cap,
            done: true,
        }
    }

    /// Starts a query over `[offset, offset + length)` of one fork.
    pub fn start(&mut self, offset: u64, length: u64, fork: BmapFork) {
        self.req = BmapRequest {
            offset,
            length,
            fork,
        };
        self.end = offset.saturating_add(length);
        self.batch.clear();
        self.done = length == 0;
    }

    /// Fetches the next batch for `file`.
    pub fn advance<F: FsOps>(&mut self, fs: &F, file: &F::File) -> ClearResult<Advance> {
        self.batch.clear();
        if self.done {
            return Ok(Advance::Exhausted);
        }
        let recs = fs
            .getbmapx(file, &self.req, self.cap)
            .map_err(|e| ClearError::io("getbmapx", e))?;
        match recs.last() {
            None => {
                self.done = true;
                return Ok(Advance::Exhausted);
            }
            Some(last) if last.last || last.end() >= self.end => self.done = true,
            Some(last) => {
                self.req.offset = last.end();
                self.req.length = self.end - last.end();
            }
        }
        self.batch = recs;
        Ok(Advance::MoreRows)
    }

    /// Records of the current batch.
    pub fn rows(&self) -> &[BmapRecord] {
        &self.batch
    }

    /// Runs the whole query for `file` and returns every record.
    pub fn collect<F: FsOps>(&mut self, fs: &F, file: &F::File) -> ClearResult<Vec<BmapRecord>> {
        let mut out = Vec::new();
        while self.advance(fs, file)? == Advance::MoreRows {
            out.extend_from_slice(&self.batch);
        }
        Ok(out)
    }
}
