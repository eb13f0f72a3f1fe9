//! In-memory filesystem for exercising the clearing engine.
//!
//! [`MemFs`] models block ownership at block granularity: files map file blocks to
//! physical blocks (written or unwritten), physical blocks carry reference counts, and
//! allocation groups hold filesystem-internal owners. The allocator hands out the highest
//! free block, so relocated data lands far away from low target ranges.
//!
//! Races and faults are injected with [`MemFs::inject`]: the next matching primitive
//! first applies the hook (fail with an errno, truncate an owner, shorten a dedupe).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::errno;
use crate::fsops::FsOps;
use crate::geometry::Geometry;
use crate::records::{
    BmapFork, BmapRecord, BmapRequest, BmapState, DedupeOutcome, FileStat, Freshness,
    FsmapRecord, RefcountRecord, ScrubKind, ScrubOutcome, SpecialOwner, FCR_OF_LAST,
    FMR_OF_LAST, FMR_OF_PREALLOC, FMR_OF_SHARED, FMR_OF_SPECIAL_OWNER,
};

const MEM_DATA_DEV: u32 = 0x803;

/// Shape and capabilities of a simulated filesystem.
#[derive(Debug, Clone)]
pub struct MemFsConfig {
    /// Block size in bytes.
    pub block_size: u64,
    /// Blocks per allocation group.
    pub ag_blocks: u64,
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Whether clone and dedupe are available.
    pub reflink: bool,
    /// Whether forced metadata rebuilds are available.
    pub repair: bool,
}

impl Default for MemFsConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            ag_blocks: 256,
            ag_count: 4,
            reflink: true,
            repair: true,
        }
    }
}

/// Primitive a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    /// [`FsOps::open_owner`]
    Open,
    /// [`FsOps::clone_range`]
    Clone,
    /// [`FsOps::dedupe_range`]
    Dedupe,
    /// [`FsOps::exchange_range`]
    Exchange,
    /// [`FsOps::unshare_range`]
    Unshare,
    /// [`FsOps::map_free_space`]
    MapFree,
    /// [`FsOps::scrub_metadata`]
    Scrub,
}

/// Action applied before the next matching primitive runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemHook {
    /// Fail the primitive with this errno.
    Fail(i32),
    /// Truncate a file first, as a concurrent writer would.
    Truncate {
        /// Inode to truncate.
        ino: u64,
        /// New size in bytes.
        size: u64,
    },
    /// Overwrite part of a file first, as a concurrent writer would.
    Write {
        /// Inode to write.
        ino: u64,
        /// File offset in bytes.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Let a dedupe remap at most this many bytes.
    ShortDedupe(u64),
    /// Run the primitive unchanged, letting a later hook target a later call.
    Proceed,
}

/// Counters of primitives issued against a [`MemFs`].
#[derive(Debug, Clone, Default)]
pub struct MemStats {
    /// Clone calls that succeeded.
    pub clones: u64,
    /// Dedupe calls that remapped something.
    pub dedupes: u64,
    /// Exchange calls that succeeded.
    pub exchanges: u64,
    /// Unshare calls.
    pub unshares: u64,
    /// Forced rebuilds, in issue order.
    pub scrubs: Vec<(u32, ScrubKind)>,
    /// Filesystem syncs.
    pub syncs: u64,
    /// Speculative preallocation sweeps.
    pub eofblock_sweeps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    pblk: u64,
    unwritten: bool,
}

#[derive(Debug, Default)]
struct MemInode {
    size: u64,
    map: BTreeMap<u64, Mapping>,
    change: u64,
    linked: bool,
    opens: usize,
}

struct State {
    cfg: MemFsConfig,
    inodes: BTreeMap<u64, MemInode>,
    next_ino: u64,
    refs: HashMap<u64, u32>,
    metadata: BTreeMap<u64, SpecialOwner>,
    data: HashMap<u64, Vec<u8>>,
    hooks: VecDeque<(MemOp, MemHook)>,
    stats: MemStats,
    clock: u64,
    open_handles: usize,
}

/// Open file on a [`MemFs`]. Closing an unlinked file frees it.
pub struct MemFile {
    ino: u64,
    state: Arc<Mutex<State>>,
}

impl MemFile {
    /// Inode number of the open file.
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        st.open_handles -= 1;
        let release = match st.inodes.get_mut(&self.ino) {
            Some(inode) => {
                inode.opens -= 1;
                inode.opens == 0 && !inode.linked
            }
            None => false,
        };
        if release {
            st.release_inode(self.ino);
            debug!("MemFs: released unlinked inode {}", self.ino);
        }
    }
}

/// Simulated filesystem implementing [`FsOps`].
pub struct MemFs {
    state: Arc<Mutex<State>>,
}

impl State {
    fn bs(&self) -> u64 {
        self.cfg.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.cfg.ag_blocks * self.cfg.ag_count as u64
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, ino: u64) {
        let now = self.tick();
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.change = now;
        }
    }

    fn is_free(&self, pblk: u64) -> bool {
        pblk < self.total_blocks()
            && !self.refs.contains_key(&pblk)
            && !self.metadata.contains_key(&pblk)
    }

    fn alloc_in(&mut self, lo: u64, hi: u64) -> io::Result<u64> {
        let found = (lo..hi).rev().find(|b| self.is_free(*b));
        match found {
            Some(pblk) => {
                self.data.remove(&pblk);
                Ok(pblk)
            }
            None => Err(errno(libc::ENOSPC)),
        }
    }

    fn alloc(&mut self) -> io::Result<u64> {
        let total = self.total_blocks();
        self.alloc_in(0, total)
    }

    fn add_ref(&mut self, pblk: u64) {
        *self.refs.entry(pblk).or_insert(0) += 1;
    }

    fn drop_ref(&mut self, pblk: u64) {
        if let Some(count) = self.refs.get_mut(&pblk) {
            *count -= 1;
            if *count == 0 {
                self.refs.remove(&pblk);
                self.data.remove(&pblk);
            }
        }
    }

    fn refcount(&self, pblk: u64) -> u32 {
        self.refs.get(&pblk).copied().unwrap_or(0)
    }

    fn inode(&self, ino: u64) -> io::Result<&MemInode> {
        self.inodes.get(&ino).ok_or_else(|| errno(libc::ESTALE))
    }

    fn mapping(&self, ino: u64, fblk: u64) -> Option<Mapping> {
        self.inodes.get(&ino).and_then(|i| i.map.get(&fblk).copied())
    }

    fn set_mapping(&mut self, ino: u64, fblk: u64, new: Option<Mapping>) {
        if let Some(m) = new {
            self.add_ref(m.pblk);
        }
        let old = match self.inodes.get_mut(&ino) {
            Some(inode) => match new {
                Some(m) => inode.map.insert(fblk, m),
                None => inode.map.remove(&fblk),
            },
            None => None,
        };
        if let Some(m) = old {
            self.drop_ref(m.pblk);
        }
    }

    fn release_inode(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.remove(&ino) {
            for m in inode.map.values() {
                self.drop_ref(m.pblk);
            }
        }
    }

    fn new_inode(&mut self, linked: bool) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        let change = self.tick();
        self.inodes.insert(
            ino,
            MemInode {
                linked,
                change,
                ..Default::default()
            },
        );
        ino
    }

    fn block_bytes(&self, ino: u64, fblk: u64) -> Vec<u8> {
        let bs = self.bs() as usize;
        match self.mapping(ino, fblk) {
            Some(Mapping {
                pblk,
                unwritten: false,
            }) => {
                let mut buf = self.data.get(&pblk).cloned().unwrap_or_default();
                buf.resize(bs, 0);
                buf
            }
            _ => vec![0u8; bs],
        }
    }

    fn read_range(&self, ino: u64, offset: u64, len: u64) -> Vec<u8> {
        let bs = self.bs();
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        while pos < offset + len {
            let fblk = pos / bs;
            let within = (pos % bs) as usize;
            let take = ((bs - pos % bs).min(offset + len - pos)) as usize;
            let block = self.block_bytes(ino, fblk);
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        out
    }

    /// Makes a file block privately writable, allocating or unsharing as needed.
    fn writable_block(&mut self, ino: u64, fblk: u64) -> io::Result<u64> {
        let bs = self.bs() as usize;
        match self.mapping(ino, fblk) {
            None => {
                let pblk = self.alloc()?;
                self.set_mapping(ino, fblk, Some(Mapping { pblk, unwritten: false }));
                self.data.insert(pblk, vec![0u8; bs]);
                Ok(pblk)
            }
            Some(m) if m.unwritten => {
                self.set_mapping(ino, fblk, Some(Mapping { pblk: m.pblk, unwritten: false }));
                self.data.insert(m.pblk, vec![0u8; bs]);
                Ok(m.pblk)
            }
            Some(m) if self.refcount(m.pblk) > 1 => {
                let copy = self.block_bytes(ino, fblk);
                let pblk = self.alloc()?;
                self.set_mapping(ino, fblk, Some(Mapping { pblk, unwritten: false }));
                self.data.insert(pblk, copy);
                Ok(pblk)
            }
            Some(m) => Ok(m.pblk),
        }
    }

    fn write_range(&mut self, ino: u64, offset: u64, buf: &[u8]) -> io::Result<()> {
        let bs = self.bs();
        let mut pos = offset;
        let mut consumed = 0usize;
        while consumed < buf.len() {
            let fblk = pos / bs;
            let within = (pos % bs) as usize;
            let take = ((bs as usize) - within).min(buf.len() - consumed);
            let pblk = self.writable_block(ino, fblk)?;
            let block = self
                .data
                .entry(pblk)
                .or_insert_with(|| vec![0u8; bs as usize]);
            block.resize(bs as usize, 0);
            block[within..within + take].copy_from_slice(&buf[consumed..consumed + take]);
            consumed += take;
            pos += take as u64;
        }
        let end = offset + buf.len() as u64;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.size = inode.size.max(end);
        }
        self.touch(ino);
        Ok(())
    }

    fn truncate(&mut self, ino: u64, size: u64) -> io::Result<()> {
        let bs = self.bs();
        let keep = size.div_ceil(bs);
        let doomed: Vec<u64> = self
            .inode(ino)?
            .map
            .range(keep..)
            .map(|(fblk, _)| *fblk)
            .collect();
        for fblk in doomed {
            self.set_mapping(ino, fblk, None);
        }
        let old_size = self.inode(ino)?.size;
        if size % bs != 0 && size < old_size {
            let tail = size / bs;
            if matches!(self.mapping(ino, tail), Some(m) if !m.unwritten) {
                let pblk = self.writable_block(ino, tail)?;
                if let Some(block) = self.data.get_mut(&pblk) {
                    for b in block.iter_mut().skip((size % bs) as usize) {
                        *b = 0;
                    }
                }
            }
        }
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.size = size;
        }
        self.touch(ino);
        Ok(())
    }

    fn fire(&mut self, op: MemOp) -> io::Result<Option<u64>> {
        let idx = match self.hooks.iter().position(|(o, _)| *o == op) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let hook = match self.hooks.remove(idx) {
            Some((_, hook)) => hook,
            None => return Ok(None),
        };
        debug!("MemFs: firing {:?} before {:?}", hook, op);
        match hook {
            MemHook::Fail(code) => Err(errno(code)),
            MemHook::Truncate { ino, size } => {
                self.truncate(ino, size)?;
                Ok(None)
            }
            MemHook::Write { ino, offset, data } => {
                self.write_range(ino, offset, &data)?;
                Ok(None)
            }
            MemHook::ShortDedupe(limit) => Ok(Some(limit)),
            MemHook::Proceed => Ok(None),
        }
    }

    /// Every owner of a physical block, as `(owner, file offset, flags)` tuples.
    fn owners_of(&self, pblk: u64) -> Vec<(u64, u64, u32)> {
        let bs = self.bs();
        if let Some(owner) = self.metadata.get(&pblk) {
            return vec![(owner.to_raw(), 0, FMR_OF_SPECIAL_OWNER)];
        }
        if !self.refs.contains_key(&pblk) {
            return Vec::new();
        }
        let shared = if self.refcount(pblk) > 1 {
            FMR_OF_SHARED
        } else {
            0
        };
        let mut out = Vec::new();
        for (ino, inode) in &self.inodes {
            for (fblk, m) in &inode.map {
                if m.pblk == pblk {
                    let prealloc = if m.unwritten { FMR_OF_PREALLOC } else { 0 };
                    out.push((*ino, fblk * bs, shared | prealloc));
                }
            }
        }
        out
    }

    fn check_file_range(&self, ino: u64, offset: u64, len: u64) -> io::Result<()> {
        let bs = self.bs();
        let size = self.inode(ino)?.size;
        if offset % bs != 0 || offset + len > size {
            return Err(errno(libc::EINVAL));
        }
        if len % bs != 0 && offset + len != size {
            return Err(errno(libc::EINVAL));
        }
        Ok(())
    }
}

impl MemFs {
    /// Creates an empty simulated filesystem.
    pub fn new(cfg: MemFsConfig) -> Self {
        debug!(
            "MemFs created: bs={}, agblocks={}, agcount={}, reflink={}",
            cfg.block_size, cfg.ag_blocks, cfg.ag_count, cfg.reflink
        );
        Self {
            state: Arc::new(Mutex::new(State {
                cfg,
                inodes: BTreeMap::new(),
                next_ino: 128,
                refs: HashMap::new(),
                metadata: BTreeMap::new(),
                data: HashMap::new(),
                hooks: VecDeque::new(),
                stats: MemStats::default(),
                clock: 0,
                open_handles: 0,
            })),
        }
    }

    /// Queues a hook for the next call of `op`.
    pub fn inject(&self, op: MemOp, hook: MemHook) {
        self.state.lock().hooks.push_back((op, hook));
    }

    /// Hooks queued but not yet fired.
    pub fn pending_hooks(&self) -> usize {
        self.state.lock().hooks.len()
    }

    /// Creates a linked file whose data is laid out contiguously from `physical`.
    pub fn place_file(&self, physical: u64, data: &[u8]) -> io::Result<u64> {
        let mut st = self.state.lock();
        let bs = st.bs();
        let nblocks = (data.len() as u64).div_ceil(bs);
        let first = physical / bs;
        if (first..first + nblocks).any(|b| !st.is_free(b)) {
            return Err(errno(libc::EEXIST));
        }
        let ino = st.new_inode(true);
        for i in 0..nblocks {
            let lo = (i * bs) as usize;
            let hi = ((i + 1) * bs).min(data.len() as u64) as usize;
            let mut block = data[lo..hi].to_vec();
            block.resize(bs as usize, 0);
            st.set_mapping(ino, i, Some(Mapping { pblk: first + i, unwritten: false }));
            st.data.insert(first + i, block);
        }
        if let Some(inode) = st.inodes.get_mut(&ino) {
            inode.size = data.len() as u64;
        }
        Ok(ino)
    }

    /// Creates a linked file of `len` bytes of unwritten extents starting at `physical`.
    pub fn place_unwritten(&self, physical: u64, len: u64) -> io::Result<u64> {
        let mut st = self.state.lock();
        let bs = st.bs();
        let first = physical / bs;
        let nblocks = len.div_ceil(bs);
        if (first..first + nblocks).any(|b| !st.is_free(b)) {
            return Err(errno(libc::EEXIST));
        }
        let ino = st.new_inode(true);
        for i in 0..nblocks {
            st.set_mapping(ino, i, Some(Mapping { pblk: first + i, unwritten: true }));
        }
        if let Some(inode) = st.inodes.get_mut(&ino) {
            inode.size = len;
        }
        Ok(ino)
    }

    /// Creates a linked file sharing every block of `ino`.
    pub fn share_file(&self, ino: u64) -> io::Result<u64> {
        let mut st = self.state.lock();
        let (size, map) = {
            let src = st.inode(ino)?;
            (src.size, src.map.clone())
        };
        let copy = st.new_inode(true);
        for (fblk, m) in map {
            st.set_mapping(copy, fblk, Some(m));
        }
        if let Some(inode) = st.inodes.get_mut(&copy) {
            inode.size = size;
        }
        Ok(copy)
    }

    /// Marks `[physical, physical + len)` as owned by filesystem metadata.
    pub fn place_metadata(&self, physical: u64, len: u64, owner: SpecialOwner) -> io::Result<()> {
        let mut st = self.state.lock();
        let bs = st.bs();
        let first = physical / bs;
        let nblocks = len.div_ceil(bs);
        if (first..first + nblocks).any(|b| !st.is_free(b)) {
            return Err(errno(libc::EEXIST));
        }
        for b in first..first + nblocks {
            st.metadata.insert(b, owner);
        }
        Ok(())
    }

    /// Truncates a file, as another process would.
    pub fn truncate(&self, ino: u64, size: u64) -> io::Result<()> {
        self.state.lock().truncate(ino, size)
    }

    /// Writes into a file, as another process would.
    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> io::Result<()> {
        self.state.lock().write_range(ino, offset, data)
    }

    /// Removes a file's name. Its blocks go away once nobody holds it open.
    pub fn unlink(&self, ino: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        let opens = {
            let inode = st.inodes.get_mut(&ino).ok_or_else(|| errno(libc::ENOENT))?;
            inode.linked = false;
            inode.opens
        };
        if opens == 0 {
            st.release_inode(ino);
        }
        Ok(())
    }

    /// Returns the full contents of a file.
    pub fn contents(&self, ino: u64) -> io::Result<Vec<u8>> {
        let st = self.state.lock();
        let size = st.inode(ino)?.size;
        Ok(st.read_range(ino, 0, size))
    }

    /// Returns the physical address backing a file offset.
    pub fn physical_of(&self, ino: u64, offset: u64) -> Option<u64> {
        let st = self.state.lock();
        let bs = st.bs();
        st.mapping(ino, offset / bs)
            .map(|m| m.pblk * bs + offset % bs)
    }

    /// Returns the linked (visible) inodes mapping any block of a physical range.
    pub fn linked_owners(&self, physical: u64, len: u64) -> Vec<u64> {
        let st = self.state.lock();
        let bs = st.bs();
        let mut out: Vec<u64> = Vec::new();
        for pblk in physical / bs..(physical + len).div_ceil(bs) {
            for (owner, _, flags) in st.owners_of(pblk) {
                let linked = st.inodes.get(&owner).map(|i| i.linked).unwrap_or(false);
                if flags & FMR_OF_SPECIAL_OWNER == 0 && linked && !out.contains(&owner) {
                    out.push(owner);
                }
            }
        }
        out
    }

    /// Returns the internal owners of any block of a physical range.
    pub fn metadata_owners(&self, physical: u64, len: u64) -> Vec<SpecialOwner> {
        let st = self.state.lock();
        let bs = st.bs();
        let mut out = Vec::new();
        for pblk in physical / bs..(physical + len).div_ceil(bs) {
            if let Some(owner) = st.metadata.get(&pblk) {
                if !out.contains(owner) {
                    out.push(*owner);
                }
            }
        }
        out
    }

    /// Returns whether every block of a physical range is free.
    pub fn is_free(&self, physical: u64, len: u64) -> bool {
        let st = self.state.lock();
        let bs = st.bs();
        (physical / bs..(physical + len).div_ceil(bs)).all(|b| st.is_free(b))
    }

    /// Returns primitive counters.
    pub fn stats(&self) -> MemStats {
        self.state.lock().stats.clone()
    }

    /// Returns the number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.state.lock().open_handles
    }

    fn handle(&self, st: &mut State, ino: u64) -> MemFile {
        st.open_handles += 1;
        if let Some(inode) = st.inodes.get_mut(&ino) {
            inode.opens += 1;
        }
        MemFile {
            ino,
            state: Arc::clone(&self.state),
        }
    }
}

impl FsOps for MemFs {
    type File = MemFile;

    fn geometry(&self) -> io::Result<Geometry> {
        let st = self.state.lock();
        Ok(Geometry {
            block_size: st.cfg.block_size,
            ag_blocks: st.cfg.ag_blocks,
            ag_count: st.cfg.ag_count,
            data_blocks: st.total_blocks(),
            rt_blocks: 0,
            rt_extent_blocks: 1,
            data_dev: MEM_DATA_DEV,
            rt_dev: None,
            reflink: st.cfg.reflink,
            rmapbt: true,
        })
    }

    fn create_temp_file(&self, realtime: bool) -> io::Result<MemFile> {
        if realtime {
            return Err(errno(libc::EOPNOTSUPP));
        }
        let mut st = self.state.lock();
        let ino = st.new_inode(false);
        trace!("MemFs: temp file {}", ino);
        Ok(self.handle(&mut st, ino))
    }

    fn open_owner(&self, ino: u64) -> io::Result<MemFile> {
        let mut st = self.state.lock();
        st.fire(MemOp::Open)?;
        let linked = st.inodes.get(&ino).map(|i| i.linked).unwrap_or(false);
        if !linked {
            return Err(errno(libc::ESTALE));
        }
        Ok(self.handle(&mut st, ino))
    }

    fn stat(&self, file: &MemFile) -> io::Result<FileStat> {
        let st = self.state.lock();
        let inode = st.inode(file.ino)?;
        Ok(FileStat {
            ino: file.ino,
            size: inode.size,
            allocated: inode.map.len() as u64 * st.bs(),
        })
    }

    fn getfsmap(&self, keys: &[FsmapRecord; 2], max: usize) -> io::Result<Vec<FsmapRecord>> {
        let st = self.state.lock();
        if keys[0].device > MEM_DATA_DEV || keys[1].device < MEM_DATA_DEV || max == 0 {
            return Ok(Vec::new());
        }
        let bs = st.bs();
        let lo = keys[0].physical / bs;
        let hi = (keys[1].physical / bs + 1).min(st.total_blocks());

        // Group per-block owners into runs of contiguous physical and file blocks.
        let mut runs: Vec<FsmapRecord> = Vec::new();
        let mut open: HashMap<(u64, u32), usize> = HashMap::new();
        for pblk in lo..hi {
            for (owner, offset, flags) in st.owners_of(pblk) {
                let key = (owner, flags);
                let extend = open.get(&key).copied().filter(|idx| {
                    let r = &runs[*idx];
                    r.end() == pblk * bs
                        && (flags & FMR_OF_SPECIAL_OWNER != 0 || r.offset + r.length == offset)
                });
                match extend {
                    Some(idx) => runs[idx].length += bs,
                    None => {
                        open.insert(key, runs.len());
                        runs.push(FsmapRecord {
                            device: MEM_DATA_DEV,
                            flags,
                            physical: pblk * bs,
                            owner,
                            offset,
                            length: bs,
                        });
                    }
                }
            }
        }
        runs.sort_by_key(|r| (r.physical, r.owner, r.offset));

        let resume = keys[0].length > 0;
        let low = (keys[0].physical, keys[0].owner, keys[0].offset);
        let mut remaining: Vec<FsmapRecord> = runs
            .into_iter()
            .filter(|r| !resume || (r.physical, r.owner, r.offset) > low)
            .collect();
        let exhausted = remaining.len() <= max;
        remaining.truncate(max);
        if exhausted {
            if let Some(last) = remaining.last_mut() {
                last.flags |= FMR_OF_LAST;
            }
        }
        Ok(remaining)
    }

    fn getfsrefs(
        &self,
        keys: &[RefcountRecord; 2],
        max: usize,
    ) -> io::Result<Vec<RefcountRecord>> {
        let st = self.state.lock();
        if keys[0].device > MEM_DATA_DEV || keys[1].device < MEM_DATA_DEV || max == 0 {
            return Ok(Vec::new());
        }
        let bs = st.bs();
        let lo = (keys[0].physical + keys[0].length) / bs;
        let hi = (keys[1].physical / bs + 1).min(st.total_blocks());
        let mut recs: Vec<RefcountRecord> = Vec::new();
        for pblk in lo..hi {
            let owners = if st.metadata.contains_key(&pblk) {
                1
            } else {
                st.refcount(pblk) as u64
            };
            if owners == 0 {
                continue;
            }
            match recs.last_mut() {
                Some(r) if r.end() == pblk * bs && r.owners == owners => r.length += bs,
                _ => recs.push(RefcountRecord {
                    device: MEM_DATA_DEV,
                    flags: 0,
                    physical: pblk * bs,
                    owners,
                    length: bs,
                }),
            }
        }
        let exhausted = recs.len() <= max;
        recs.truncate(max);
        if exhausted {
            if let Some(last) = recs.last_mut() {
                last.flags |= FCR_OF_LAST;
            }
        }
        Ok(recs)
    }

    fn getbmapx(
        &self,
        file: &MemFile,
        req: &BmapRequest,
        max: usize,
    ) -> io::Result<Vec<BmapRecord>> {
        let st = self.state.lock();
        let inode = st.inode(file.ino)?;
        if req.fork != BmapFork::Data || max == 0 {
            return Ok(Vec::new());
        }
        let bs = st.bs();
        let end = req
            .offset
            .saturating_add(req.length)
            .min(inode.size.div_ceil(bs) * bs);
        let mut out: Vec<BmapRecord> = Vec::new();
        let mut fblk = req.offset / bs;
        while fblk * bs < end {
            let state = match inode.map.get(&fblk) {
                Some(m) => BmapState::Mapped(m.pblk * bs),
                None => BmapState::Hole,
            };
            let unwritten = inode.map.get(&fblk).map(|m| m.unwritten).unwrap_or(false);
            let shared = inode
                .map
                .get(&fblk)
                .map(|m| st.refcount(m.pblk) > 1)
                .unwrap_or(false);
            let merged = match out.last_mut() {
                Some(prev) if prev.unwritten == unwritten && prev.shared == shared => {
                    match (prev.state, state) {
                        (BmapState::Hole, BmapState::Hole) => {
                            prev.length += bs;
                            true
                        }
                        (BmapState::Mapped(p), BmapState::Mapped(q)) if p + prev.length == q => {
                            prev.length += bs;
                            true
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if !merged {
                if out.len() == max {
                    return Ok(out);
                }
                out.push(BmapRecord {
                    offset: fblk * bs,
                    length: bs,
                    state,
                    unwritten,
                    shared,
                    last: false,
                });
            }
            fblk += 1;
        }
        if let Some(last) = out.last_mut() {
            last.last = true;
        }
        Ok(out)
    }

    fn clone_range(
        &self,
        src: &MemFile,
        src_off: u64,
        len: u64,
        dst: &MemFile,
        dst_off: u64,
    ) -> io::Result<()> {
        let mut st = self.state.lock();
        st.fire(MemOp::Clone)?;
        if !st.cfg.reflink {
            return Err(errno(libc::EOPNOTSUPP));
        }
        let bs = st.bs();
        let len = if len == 0 {
            st.inode(src.ino)?.size.saturating_sub(src_off)
        } else {
            len
        };
        st.check_file_range(src.ino, src_off, len)?;
        st.inode(dst.ino)?;
        if dst_off % bs != 0 || (src.ino == dst.ino && src_off.abs_diff(dst_off) < len) {
            return Err(errno(libc::EINVAL));
        }
        for i in 0..len.div_ceil(bs) {
            let new = st
                .mapping(src.ino, src_off / bs + i)
                .filter(|m| !m.unwritten);
            st.set_mapping(dst.ino, dst_off / bs + i, new);
        }
        if let Some(inode) = st.inodes.get_mut(&dst.ino) {
            inode.size = inode.size.max(dst_off + len);
        }
        st.touch(dst.ino);
        st.stats.clones += 1;
        Ok(())
    }

    fn dedupe_range(
        &self,
        src: &MemFile,
        src_off: u64,
        len: u64,
        dst: &MemFile,
        dst_off: u64,
    ) -> io::Result<DedupeOutcome> {
        let mut st = self.state.lock();
        let limit = st.fire(MemOp::Dedupe)?;
        if !st.cfg.reflink {
            return Err(errno(libc::EOPNOTSUPP));
        }
        let bs = st.bs();
        let src_size = st.inode(src.ino)?.size;
        let dst_size = st.inode(dst.ino)?.size;
        if src_off % bs != 0 || dst_off % bs != 0 {
            return Err(errno(libc::EINVAL));
        }
        if src_off + len > src_size || dst_off + len > dst_size {
            return Err(errno(libc::EINVAL));
        }
        // An unaligned tail only dedupes when both ranges end at EOF; otherwise the
        // length is cut back to a block boundary.
        let len = if len % bs != 0 && (src_off + len != src_size || dst_off + len != dst_size) {
            len / bs * bs
        } else {
            len
        };
        if len == 0 {
            return Ok(DedupeOutcome::Same(0));
        }
        if st.read_range(src.ino, src_off, len) != st.read_range(dst.ino, dst_off, len) {
            return Ok(DedupeOutcome::Differs);
        }
        let done = match limit {
            Some(limit) => len.min(limit / bs * bs),
            None => len,
        };
        for i in 0..done.div_ceil(bs) {
            let new = st
                .mapping(src.ino, src_off / bs + i)
                .filter(|m| !m.unwritten);
            st.set_mapping(dst.ino, dst_off / bs + i, new);
        }
        st.stats.dedupes += 1;
        Ok(DedupeOutcome::Same(done))
    }

    fn start_exchange(&self, file2: &MemFile) -> io::Result<Freshness> {
        let st = self.state.lock();
        let inode = st.inode(file2.ino)?;
        Ok(Freshness {
            raw: [file2.ino, inode.change, 0, 0, 0, 0],
        })
    }

    fn exchange_range(
        &self,
        file1: &MemFile,
        off1: u64,
        file2: &MemFile,
        off2: u64,
        len: u64,
        guard: Option<&Freshness>,
    ) -> io::Result<()> {
        let mut st = self.state.lock();
        st.fire(MemOp::Exchange)?;
        let bs = st.bs();
        let change = st.inode(file2.ino)?.change;
        st.inode(file1.ino)?;
        if let Some(guard) = guard {
            if guard.raw[0] != file2.ino || guard.raw[1] != change {
                return Err(errno(libc::EBUSY));
            }
        }
        if file1.ino == file2.ino || off1 % bs != 0 || off2 % bs != 0 {
            return Err(errno(libc::EINVAL));
        }
        for i in 0..len.div_ceil(bs) {
            let a = st.mapping(file1.ino, off1 / bs + i);
            let b = st.mapping(file2.ino, off2 / bs + i);
            st.set_mapping(file1.ino, off1 / bs + i, b);
            st.set_mapping(file2.ino, off2 / bs + i, a);
        }
        st.touch(file1.ino);
        st.touch(file2.ino);
        st.stats.exchanges += 1;
        Ok(())
    }

    fn map_free_space(&self, file: &MemFile, physical: u64, len: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        st.fire(MemOp::MapFree)?;
        let bs = st.bs();
        st.inode(file.ino)?;
        let mut mapped = 0u64;
        for pblk in physical / bs..(physical + len).div_ceil(bs) {
            if st.is_free(pblk) && st.mapping(file.ino, pblk).is_none() {
                st.set_mapping(file.ino, pblk, Some(Mapping { pblk, unwritten: true }));
                mapped += 1;
            }
        }
        trace!("MemFs: mapped {} free blocks into inode {}", mapped, file.ino);
        Ok(())
    }

    fn scrub_metadata(&self, agno: u32, kind: ScrubKind) -> io::Result<ScrubOutcome> {
        let mut st = self.state.lock();
        st.fire(MemOp::Scrub)?;
        if !st.cfg.repair {
            return Err(errno(libc::EOPNOTSUPP));
        }
        if agno >= st.cfg.ag_count {
            return Err(errno(libc::ENOENT));
        }
        st.stats.scrubs.push((agno, kind));
        let owner = match kind {
            ScrubKind::Bnobt | ScrubKind::Cntbt | ScrubKind::Rmapbt => SpecialOwner::Ag,
            ScrubKind::Inobt | ScrubKind::Finobt => SpecialOwner::Inobt,
            ScrubKind::Refcntbt => SpecialOwner::Refc,
        };
        let ag_lo = agno as u64 * st.cfg.ag_blocks;
        let ag_hi = ag_lo + st.cfg.ag_blocks;
        let old: Vec<u64> = st
            .metadata
            .range(ag_lo..ag_hi)
            .filter(|(_, o)| **o == owner)
            .map(|(b, _)| *b)
            .collect();
        let mut fresh = Vec::with_capacity(old.len());
        for _ in &old {
            let pblk = st.alloc_in(ag_lo, ag_hi)?;
            st.metadata.insert(pblk, owner);
            fresh.push(pblk);
        }
        for pblk in old {
            if !fresh.contains(&pblk) {
                st.metadata.remove(&pblk);
            }
        }
        debug!("MemFs: rebuilt {:?} in AG {}", kind, agno);
        Ok(ScrubOutcome::Rebuilt)
    }

    fn sync_fs(&self) -> io::Result<()> {
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    fn free_eofblocks(&self) -> io::Result<()> {
        self.state.lock().stats.eofblock_sweeps += 1;
        Ok(())
    }

    fn set_len(&self, file: &MemFile, size: u64) -> io::Result<()> {
        self.state.lock().truncate(file.ino, size)
    }

    fn unshare_range(&self, file: &MemFile, offset: u64, len: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        st.fire(MemOp::Unshare)?;
        let bs = st.bs();
        st.inode(file.ino)?;
        for fblk in offset / bs..(offset + len).div_ceil(bs) {
            match st.mapping(file.ino, fblk) {
                Some(m) if !m.unwritten && st.refcount(m.pblk) > 1 => {
                    st.writable_block(file.ino, fblk)?;
                }
                _ => {}
            }
        }
        st.touch(file.ino);
        st.stats.unshares += 1;
        Ok(())
    }

    fn preallocate(&self, file: &MemFile, offset: u64, len: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        let bs = st.bs();
        st.inode(file.ino)?;
        for fblk in offset / bs..(offset + len).div_ceil(bs) {
            if st.mapping(file.ino, fblk).is_none() {
                let pblk = st.alloc()?;
                st.set_mapping(file.ino, fblk, Some(Mapping { pblk, unwritten: true }));
            }
        }
        st.touch(file.ino);
        Ok(())
    }

    fn read_at(&self, file: &MemFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let st = self.state.lock();
        let size = st.inode(file.ino)?.size;
        if offset >= size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - offset);
        let bytes = st.read_range(file.ino, offset, n);
        buf[..n as usize].copy_from_slice(&bytes);
        Ok(n as usize)
    }

    fn write_at(&self, file: &MemFile, buf: &[u8], offset: u64) -> io::Result<()> {
        self.state.lock().write_range(file.ino, offset, buf)
    }

    fn fsync(&self, file: &MemFile) -> io::Result<()> {
        self.state.lock().inode(file.ino).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = 4096;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn full_keys(lo: u64, hi: u64) -> [FsmapRecord; 2] {
        [
            FsmapRecord {
                device: MEM_DATA_DEV,
                physical: lo,
                ..Default::default()
            },
            FsmapRecord {
                device: MEM_DATA_DEV,
                physical: hi - 1,
                owner: u64::MAX,
                offset: u64::MAX,
                flags: u32::MAX,
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_place_and_read_file() {
        let fs = MemFs::new(MemFsConfig::default());
        let data = pattern(3 * BS as usize + 100, 7);
        let ino = fs.place_file(8 * BS, &data).unwrap();
        assert_eq!(fs.contents(ino).unwrap(), data);
        assert_eq!(fs.physical_of(ino, BS), Some(9 * BS));
        assert!(!fs.is_free(8 * BS, 4 * BS));
        assert!(fs.is_free(12 * BS, BS));
    }

    #[test]
    fn test_place_file_rejects_busy_blocks() {
        let fs = MemFs::new(MemFsConfig::default());
        fs.place_file(0, &pattern(BS as usize, 1)).unwrap();
        assert!(fs.place_file(0, &pattern(BS as usize, 2)).is_err());
    }

    #[test]
    fn test_getfsmap_merges_and_paginates() {
        let fs = MemFs::new(MemFsConfig::default());
        let a = fs.place_file(0, &pattern(4 * BS as usize, 1)).unwrap();
        let b = fs.place_file(4 * BS, &pattern(2 * BS as usize, 2)).unwrap();
        let keys = full_keys(0, 16 * BS);
        let recs = fs.getfsmap(&keys, 1).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].owner, a);
        assert_eq!(recs[0].length, 4 * BS);
        assert!(!recs[0].is_last());

        let mut next = keys;
        next[0] = recs[0];
        let recs = fs.getfsmap(&next, 8).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].owner, b);
        assert_eq!(recs[0].physical, 4 * BS);
        assert!(recs[0].is_last());
    }

    #[test]
    fn test_getfsrefs_counts_sharing() {
        let fs = MemFs::new(MemFsConfig::default());
        let a = fs.place_file(0, &pattern(2 * BS as usize, 1)).unwrap();
        fs.share_file(a).unwrap();
        fs.place_file(2 * BS, &pattern(BS as usize, 3)).unwrap();
        let keys = [
            RefcountRecord {
                device: MEM_DATA_DEV,
                physical: 0,
                ..Default::default()
            },
            RefcountRecord {
                device: MEM_DATA_DEV,
                physical: 8 * BS - 1,
                ..Default::default()
            },
        ];
        let recs = fs.getfsrefs(&keys, 16).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!((recs[0].owners, recs[0].length), (2, 2 * BS));
        assert_eq!((recs[1].owners, recs[1].length), (1, BS));
        assert!(recs[1].is_last());
    }

    #[test]
    fn test_clone_shares_blocks_and_write_unshares() {
        let fs = MemFs::new(MemFsConfig::default());
        let data = pattern(2 * BS as usize, 5);
        let ino = fs.place_file(0, &data).unwrap();
        let owner = fs.open_owner(ino).unwrap();
        let tmp = fs.create_temp_file(false).unwrap();
        fs.clone_range(&owner, 0, 2 * BS, &tmp, 0).unwrap();
        assert_eq!(fs.physical_of(tmp.ino(), 0), Some(0));

        fs.write_at(&owner, b"changed", 0).unwrap();
        assert_ne!(fs.physical_of(ino, 0), Some(0));
        assert_eq!(fs.physical_of(tmp.ino(), 0), Some(0));
        let mut buf = vec![0u8; 7];
        fs.read_at(&tmp, &mut buf, 0).unwrap();
        assert_eq!(&buf[..], &data[..7]);
    }

    #[test]
    fn test_clone_past_eof_is_invalid() {
        let fs = MemFs::new(MemFsConfig::default());
        let ino = fs.place_file(0, &pattern(BS as usize, 5)).unwrap();
        let owner = fs.open_owner(ino).unwrap();
        let tmp = fs.create_temp_file(false).unwrap();
        let err = fs.clone_range(&owner, 0, 2 * BS, &tmp, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_dedupe_detects_differences() {
        let fs = MemFs::new(MemFsConfig::default());
        let a = fs.place_file(0, &pattern(BS as usize, 1)).unwrap();
        let b = fs.place_file(BS, &pattern(BS as usize, 2)).unwrap();
        let c = fs.place_file(2 * BS, &pattern(BS as usize, 1)).unwrap();
        let (a, b, c) = (
            fs.open_owner(a).unwrap(),
            fs.open_owner(b).unwrap(),
            fs.open_owner(c).unwrap(),
        );
        assert_eq!(fs.dedupe_range(&a, 0, BS, &b, 0).unwrap(), DedupeOutcome::Differs);
        assert_eq!(fs.dedupe_range(&a, 0, BS, &c, 0).unwrap(), DedupeOutcome::Same(BS));
        assert_eq!(fs.physical_of(c.ino(), 0), Some(0));
        assert!(fs.is_free(2 * BS, BS));
    }

    #[test]
    fn test_dedupe_tail_needs_both_eofs() {
        let fs = MemFs::new(MemFsConfig::default());
        let data = pattern(BS as usize + 100, 3);
        let a = fs.place_file(0, &data).unwrap();
        let b = fs.place_file(2 * BS, &data).unwrap();
        let (a, b) = (fs.open_owner(a).unwrap(), fs.open_owner(b).unwrap());
        let scratch = fs.create_temp_file(false).unwrap();
        fs.clone_range(&a, 0, 0, &scratch, 0).unwrap();
        fs.set_len(&scratch, 4 * BS).unwrap();

        // the scratch copy runs past its EOF, so only the whole block is remapped
        let got = fs.dedupe_range(&scratch, 0, BS + 100, &b, 0).unwrap();
        assert_eq!(got, DedupeOutcome::Same(BS));
        assert_eq!(fs.physical_of(b.ino(), BS), Some(3 * BS));

        let got = fs.dedupe_range(&a, BS, 100, &b, BS).unwrap();
        assert_eq!(got, DedupeOutcome::Same(100));
        assert_eq!(fs.physical_of(b.ino(), BS), Some(BS));
        assert_eq!(fs.contents(b.ino()).unwrap(), data);
    }

    #[test]
    fn test_guarded_exchange_detects_change() {
        let fs = MemFs::new(MemFsConfig::default());
        let ino = fs.place_file(0, &pattern(BS as usize, 1)).unwrap();
        let owner = fs.open_owner(ino).unwrap();
        let tmp = fs.create_temp_file(false).unwrap();
        fs.write_at(&tmp, &pattern(BS as usize, 1), 0).unwrap();
        let guard = fs.start_exchange(&owner).unwrap();
        fs.write(ino, 0, b"racing writer").unwrap();
        let err = fs
            .exchange_range(&tmp, 0, &owner, 0, BS, Some(&guard))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        let guard = fs.start_exchange(&owner).unwrap();
        fs.exchange_range(&tmp, 0, &owner, 0, BS, Some(&guard)).unwrap();
        assert_eq!(fs.contents(ino).unwrap(), pattern(BS as usize, 1));
    }

    #[test]
    fn test_map_free_space_and_release_on_close() {
        let fs = MemFs::new(MemFsConfig::default());
        fs.place_file(BS, &pattern(BS as usize, 1)).unwrap();
        {
            let tmp = fs.create_temp_file(false).unwrap();
            fs.map_free_space(&tmp, 0, 4 * BS).unwrap();
            assert!(!fs.is_free(0, BS));
            assert_eq!(fs.physical_of(tmp.ino(), 2 * BS), Some(2 * BS));
            assert_eq!(fs.physical_of(tmp.ino(), BS), None);
            assert_eq!(fs.open_handles(), 1);
        }
        assert_eq!(fs.open_handles(), 0);
        assert!(fs.is_free(0, BS));
    }

    #[test]
    fn test_scrub_moves_metadata_within_ag() {
        let fs = MemFs::new(MemFsConfig::default());
        fs.place_metadata(4 * BS, 2 * BS, SpecialOwner::Ag).unwrap();
        let out = fs.scrub_metadata(0, ScrubKind::Bnobt).unwrap();
        assert_eq!(out, ScrubOutcome::Rebuilt);
        assert!(fs.is_free(4 * BS, 2 * BS));
        assert_eq!(fs.metadata_owners(0, 256 * BS), vec![SpecialOwner::Ag]);
        assert_eq!(fs.stats().scrubs, vec![(0, ScrubKind::Bnobt)]);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let fs = MemFs::new(MemFsConfig::default());
        let ino = fs.place_file(0, &pattern(BS as usize, 1)).unwrap();
        fs.inject(MemOp::Open, MemHook::Fail(libc::EIO));
        assert!(fs.open_owner(ino).is_err());
        assert!(fs.open_owner(ino).is_ok());

        fs.inject(MemOp::Open, MemHook::Proceed);
        fs.inject(MemOp::Open, MemHook::Fail(libc::EIO));
        assert_eq!(fs.pending_hooks(), 2);
        assert!(fs.open_owner(ino).is_ok());
        assert!(fs.open_owner(ino).is_err());
        assert_eq!(fs.pending_hooks(), 0);
    }

    #[test]
    fn test_bmap_reports_holes_and_unwritten() {
        let fs = MemFs::new(MemFsConfig::default());
        let ino = fs.place_unwritten(0, 2 * BS).unwrap();
        let file = fs.open_owner(ino).unwrap();
        fs.set_len(&file, 4 * BS).unwrap();
        let req = BmapRequest {
            offset: 0,
            length: 4 * BS,
            fork: BmapFork::Data,
        };
        let recs = fs.getbmapx(&file, &req, 16).unwrap();
        assert_eq!(recs.len(), 2);
        assert!(recs[0].unwritten);
        assert_eq!(recs[0].physical(), Some(0));
        assert_eq!(recs[1].state, BmapState::Hole);
        assert!(recs[1].last);
    }
}
