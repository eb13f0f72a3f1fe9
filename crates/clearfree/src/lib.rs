#![warn(missing_docs)]

//! Clearfree: evacuate file data and metadata out of a physical range of a live XFS filesystem
//!
//! This crate empties a byte range of a mounted filesystem's data or realtime device
//! while the filesystem stays in use. Free space in the range is captured into an
//! unlinked file, file data is frozen and then remapped elsewhere by dedupe or guarded
//! exchange, and metadata is moved by forcing online repair to rebuild it. When a run
//! finishes, the capture file owns as much of the range as could be cleared.

pub mod cli;
pub mod config;
pub mod cursor;
pub mod error;
pub mod evacuate;
pub mod freeze;
pub mod fsops;
pub mod geometry;
pub mod memfs;
pub mod metadata;
pub mod records;
pub mod request;
pub mod target;
pub mod visited;
pub mod xfs;

pub use config::ClearConfig;
pub use cursor::{Advance, BmapCursor, FsmapCursor, RefcountCursor};
pub use error::{ClearError, ClearResult, Errno};
pub use evacuate::{DedupeStrategy, EvacuationStrategy, ExchangeStrategy};
pub use fsops::FsOps;
pub use geometry::Geometry;
pub use memfs::{MemFile, MemFs, MemFsConfig, MemHook, MemOp, MemStats};
pub use metadata::{MetadataAction, MetadataRelocator, RebuildMask};
pub use records::{
    BmapFork, BmapRecord, BmapRequest, BmapState, DedupeOutcome, FileStat, Freshness,
    FsmapRecord, RefcountRecord, ScrubKind, ScrubOutcome, SpecialOwner,
};
pub use request::{ClearCtx, ClearRequest, Efficacy, Phase, RunReport};
pub use target::{EvacuationTarget, Priority, PriorityClass};
pub use visited::VisitedSet;
pub use xfs::{XfsFile, XfsFs};
