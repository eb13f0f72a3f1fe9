//! Filesystem primitives consumed by the clearing engine.
//!
//! This module provides the trait-based abstraction ([`FsOps`]) over the kernel
//! operations the engine drives, with a real XFS implementation in [`crate::xfs`] and an
//! in-memory simulation in [`crate::memfs`].
//!
//! Every fallible method returns the raw `io::Error` so callers can tell racing
//! writers (`EINVAL`, `EBUSY`) and space shortages (`ENOSPC`) apart from real failures.

use std::io;

use crate::geometry::Geometry;
use crate::records::{
    BmapRecord, BmapRequest, DedupeOutcome, FileStat, Freshness, FsmapRecord, RefcountRecord,
    ScrubKind, ScrubOutcome,
};

/// Kernel primitives used to move data and metadata out of a physical range.
pub trait FsOps {
    /// Owned file handle. Dropping it closes the file.
    type File;

    /// Returns the mount geometry.
    fn geometry(&self) -> io::Result<Geometry>;

    /// Creates an unlinked scratch file private to the caller.
    fn create_temp_file(&self, realtime: bool) -> io::Result<Self::File>;

    /// Opens a file by inode number.
    fn open_owner(&self, ino: u64) -> io::Result<Self::File>;

    /// Returns size and allocation of an open file.
    fn stat(&self, file: &Self::File) -> io::Result<FileStat>;

    /// Queries the physical-to-owner map.
    ///
    /// `keys[0]` is the low key and `keys[1]` the high key. When `keys[0].length` is
    /// nonzero the query resumes after that record.
    fn getfsmap(&self, keys: &[FsmapRecord; 2], max: usize) -> io::Result<Vec<FsmapRecord>>;

    /// Queries the physical-to-refcount map, with the same key contract as [`Self::getfsmap`].
    fn getfsrefs(&self, keys: &[RefcountRecord; 2], max: usize)
        -> io::Result<Vec<RefcountRecord>>;

    /// Queries the file-to-physical map.
    fn getbmapx(
        &self,
        file: &Self::File,
        req: &BmapRequest,
        max: usize,
    ) -> io::Result<Vec<BmapRecord>>;

    /// Reflinks `len` bytes of `src` into `dst`. A length ending at the source's EOF may be
    /// unaligned.
    fn clone_range(
        &self,
        src: &Self::File,
        src_off: u64,
        len: u64,
        dst: &Self::File,
        dst_off: u64,
    ) -> io::Result<()>;

    /// Remaps `dst` onto `src`'s blocks if the two ranges hold identical bytes.
    fn dedupe_range(
        &self,
        src: &Self::File,
        src_off: u64,
        len: u64,
        dst: &Self::File,
        dst_off: u64,
    ) -> io::Result<DedupeOutcome>;

    /// Samples the change state of `file2` before a guarded exchange.
    fn start_exchange(&self, file2: &Self::File) -> io::Result<Freshness>;

    /// Swaps the mappings of two ranges. With a guard, fails with `EBUSY` if `file2`
    /// changed since the guard was sampled.
    fn exchange_range(
        &self,
        file1: &Self::File,
        off1: u64,
        file2: &Self::File,
        off2: u64,
        len: u64,
        guard: Option<&Freshness>,
    ) -> io::Result<()>;

    /// Maps free physical space in `[physical, physical + len)` into `file` at file
    /// offsets equal to the physical addresses, as unwritten extents.
    fn map_free_space(&self, file: &Self::File, physical: u64, len: u64) -> io::Result<()>;

    /// Forces the online repair facility to rebuild one metadata structure of an AG.
    fn scrub_metadata(&self, agno: u32, kind: ScrubKind) -> io::Result<ScrubOutcome>;

    /// Flushes all dirty data of the filesystem.
    fn sync_fs(&self) -> io::Result<()>;

    /// Drops speculative post-EOF preallocations.
    fn free_eofblocks(&self) -> io::Result<()>;

    /// Sets the logical size, releasing blocks past the new EOF.
    fn set_len(&self, file: &Self::File, size: u64) -> io::Result<()>;

    /// Gives a range its own copy of any shared blocks.
    fn unshare_range(&self, file: &Self::File, offset: u64, len: u64) -> io::Result<()>;

    /// Allocates unwritten extents for a range without changing the size.
    fn preallocate(&self, file: &Self::File, offset: u64, len: u64) -> io::Result<()>;

    /// Buffered read. Returns the number of bytes read, short at EOF.
    fn read_at(&self, file: &Self::File, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Buffered write of the whole buffer.
    fn write_at(&self, file: &Self::File, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Flushes a file's dirty data.
    fn fsync(&self, file: &Self::File) -> io::Result<()>;
}
