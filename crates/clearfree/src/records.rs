//! Records returned by the space-map and block-map queries.
//!
//! Byte units throughout. Flag values match the kernel's `fsmap.h` and XFS headers so
//! the XFS backend can copy them through unchanged.

use serde::{Deserialize, Serialize};

/// Unwritten (preallocated) extent.
pub const FMR_OF_PREALLOC: u32 = 0x1;
/// Mapping belongs to an attribute fork.
pub const FMR_OF_ATTR_FORK: u32 = 0x2;
/// Mapping is a block of a file's extent map.
pub const FMR_OF_EXTENT_MAP: u32 = 0x4;
/// Extent is shared with other owners.
pub const FMR_OF_SHARED: u32 = 0x8;
/// Owner is filesystem metadata, not an inode.
pub const FMR_OF_SPECIAL_OWNER: u32 = 0x10;
/// Last record of the query.
pub const FMR_OF_LAST: u32 = 0x20;

/// Last record of a refcount query.
pub const FCR_OF_LAST: u32 = 0x1;

const XFS_OWNER_TYPE: u64 = b'X' as u64;

const fn fmr_owner(kind: u64, code: u64) -> u64 {
    (kind << 32) | (code & 0xFFFF_FFFF)
}

/// Filesystem-internal owner of a physical extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpecialOwner {
    /// Free space.
    Free,
    /// Owner could not be determined.
    Unknown,
    /// Static metadata: superblocks and allocation group headers.
    Fs,
    /// The journal.
    Log,
    /// Per-AG free space and reverse-mapping indexes.
    Ag,
    /// Inode indexes.
    Inobt,
    /// Inode records.
    Inodes,
    /// Reference count index.
    Refc,
    /// Copy-on-write staging extents.
    Cow,
    /// Known-bad blocks.
    Defective,
    /// A code this crate does not know about.
    Other(u64),
}

impl SpecialOwner {
    /// Decodes a raw owner value from a record carrying [`FMR_OF_SPECIAL_OWNER`].
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            r if r == fmr_owner(0, 1) || r == fmr_owner(XFS_OWNER_TYPE, 1) => SpecialOwner::Free,
            r if r == fmr_owner(0, 2) || r == fmr_owner(XFS_OWNER_TYPE, 2) => {
                SpecialOwner::Unknown
            }
            r if r == fmr_owner(0, 3) || r == fmr_owner(XFS_OWNER_TYPE, 3) => SpecialOwner::Fs,
            r if r == fmr_owner(XFS_OWNER_TYPE, 4) => SpecialOwner::Log,
            r if r == fmr_owner(XFS_OWNER_TYPE, 5) => SpecialOwner::Ag,
            r if r == fmr_owner(XFS_OWNER_TYPE, 6) => SpecialOwner::Inobt,
            r if r == fmr_owner(XFS_OWNER_TYPE, 7) => SpecialOwner::Inodes,
            r if r == fmr_owner(XFS_OWNER_TYPE, 8) => SpecialOwner::Refc,
            r if r == fmr_owner(XFS_OWNER_TYPE, 9) => SpecialOwner::Cow,
            r if r == fmr_owner(XFS_OWNER_TYPE, 10) => SpecialOwner::Defective,
            other => SpecialOwner::Other(other),
        }
    }

    /// Encodes the owner the way XFS reports it.
    pub fn to_raw(self) -> u64 {
        let code = match self {
            SpecialOwner::Free => 1,
            SpecialOwner::Unknown => 2,
            SpecialOwner::Fs => 3,
            SpecialOwner::Log => 4,
            SpecialOwner::Ag => 5,
            SpecialOwner::Inobt => 6,
            SpecialOwner::Inodes => 7,
            SpecialOwner::Refc => 8,
            SpecialOwner::Cow => 9,
            SpecialOwner::Defective => 10,
            SpecialOwner::Other(raw) => return raw,
        };
        fmr_owner(XFS_OWNER_TYPE, code)
    }
}

/// One record of the physical-to-owner map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmapRecord {
    /// Device number.
    pub device: u32,
    /// `FMR_OF_*` flags.
    pub flags: u32,
    /// Physical start in bytes.
    pub physical: u64,
    /// Inode number, or an encoded [`SpecialOwner`].
    pub owner: u64,
    /// File offset in bytes (meaningless for special owners).
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
}

impl FsmapRecord {
    /// Physical end (exclusive).
    pub fn end(&self) -> u64 {
        self.physical + self.length
    }

    /// Returns whether this is the final record of the query.
    pub fn is_last(&self) -> bool {
        self.flags & FMR_OF_LAST != 0
    }

    /// Returns whether the extent is unwritten.
    pub fn is_unwritten(&self) -> bool {
        self.flags & FMR_OF_PREALLOC != 0
    }

    /// Returns the internal owner, if the record is not owned by an inode.
    pub fn special_owner(&self) -> Option<SpecialOwner> {
        if self.flags & FMR_OF_SPECIAL_OWNER != 0 {
            Some(SpecialOwner::from_raw(self.owner))
        } else {
            None
        }
    }

    /// Returns whether the record maps regular file data that can be cloned or exchanged.
    pub fn is_file_data(&self) -> bool {
        self.flags & (FMR_OF_SPECIAL_OWNER | FMR_OF_ATTR_FORK | FMR_OF_EXTENT_MAP) == 0
    }

    /// Trims the record to the physical window `[lo, hi)`, shifting the file offset with it.
    pub fn clamp(&self, lo: u64, hi: u64) -> Option<FsmapRecord> {
        let start = self.physical.max(lo);
        let end = self.end().min(hi);
        if start >= end {
            return None;
        }
        let mut rec = *self;
        if self.special_owner().is_none() {
            rec.offset = self.offset + (start - self.physical);
        }
        rec.physical = start;
        rec.length = end - start;
        Some(rec)
    }
}

/// One record of the physical-to-refcount map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefcountRecord {
    /// Device number.
    pub device: u32,
    /// `FCR_OF_*` flags.
    pub flags: u32,
    /// Physical start in bytes.
    pub physical: u64,
    /// Number of owners.
    pub owners: u64,
    /// Length in bytes.
    pub length: u64,
}

impl RefcountRecord {
    /// Physical end (exclusive).
    pub fn end(&self) -> u64 {
        self.physical + self.length
    }

    /// Returns whether this is the final record of the query.
    pub fn is_last(&self) -> bool {
        self.flags & FCR_OF_LAST != 0
    }
}

/// Which fork of a file a block-map query walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BmapFork {
    /// Regular file data.
    Data,
    /// Extended attributes.
    Attr,
    /// Copy-on-write staging.
    Cow,
}

/// Parameters of a block-map query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapRequest {
    /// File offset in bytes.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Fork to walk.
    pub fork: BmapFork,
}

/// Where a file range lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BmapState {
    /// Nothing mapped.
    Hole,
    /// Reserved but not yet allocated.
    Delalloc,
    /// Mapped at a physical byte address.
    Mapped(u64),
}

/// One record of the file-to-physical map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmapRecord {
    /// File offset in bytes.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Mapping state.
    pub state: BmapState,
    /// Extent is unwritten.
    pub unwritten: bool,
    /// Extent is shared with another owner.
    pub shared: bool,
    /// Last record of the query.
    pub last: bool,
}

impl BmapRecord {
    /// File end offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Physical address, if mapped.
    pub fn physical(&self) -> Option<u64> {
        match self.state {
            BmapState::Mapped(p) => Some(p),
            _ => None,
        }
    }
}

/// Snapshot of a file's change state, checked by a guarded exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Freshness {
    /// Opaque words filled in by the backend.
    pub raw: [u64; 6],
}

/// Subset of `fstat` the engine needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    /// Inode number.
    pub ino: u64,
    /// Logical size in bytes.
    pub size: u64,
    /// Allocated space in bytes.
    pub allocated: u64,
}

/// Outcome of a dedupe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    /// Contents matched; this many bytes now share the source's blocks.
    Same(u64),
    /// Contents differ; nothing was remapped.
    Differs,
}

/// Metadata structures the online repair facility can rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScrubKind {
    /// Free space by block number.
    Bnobt,
    /// Free space by extent size.
    Cntbt,
    /// Inode index.
    Inobt,
    /// Free inode index.
    Finobt,
    /// Reverse mapping index.
    Rmapbt,
    /// Reference count index.
    Refcntbt,
}

impl ScrubKind {
    /// All kinds, in the order rebuilds are issued.
    pub const ALL: [ScrubKind; 6] = [
        ScrubKind::Bnobt,
        ScrubKind::Cntbt,
        ScrubKind::Inobt,
        ScrubKind::Finobt,
        ScrubKind::Rmapbt,
        ScrubKind::Refcntbt,
    ];

    /// The `XFS_SCRUB_TYPE_*` code.
    pub fn code(self) -> u32 {
        match self {
            ScrubKind::Bnobt => 5,
            ScrubKind::Cntbt => 6,
            ScrubKind::Inobt => 7,
            ScrubKind::Finobt => 8,
            ScrubKind::Rmapbt => 9,
            ScrubKind::Refcntbt => 10,
        }
    }
}

/// Outcome of a forced metadata rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubOutcome {
    /// The structure was rebuilt.
    Rebuilt,
    /// The kernel still considers the structure in need of repair.
    NeedsRepair,
}
