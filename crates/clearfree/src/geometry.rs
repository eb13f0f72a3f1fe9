//! Mount geometry and block arithmetic.

use serde::{Deserialize, Serialize};

/// Geometry of the mounted filesystem, as far as the clearing engine cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Filesystem block size in bytes.
    pub block_size: u64,
    /// Blocks per allocation group.
    pub ag_blocks: u64,
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Size of the data device in blocks.
    pub data_blocks: u64,
    /// Size of the realtime device in blocks (zero if absent).
    pub rt_blocks: u64,
    /// Realtime extent size in blocks.
    pub rt_extent_blocks: u64,
    /// Device number reported by space-map queries for the data device.
    pub data_dev: u32,
    /// Device number reported by space-map queries for the realtime device.
    pub rt_dev: Option<u32>,
    /// Whether copy-on-write cloning (reflink) is available.
    pub reflink: bool,
    /// Whether the reverse-mapping index (and therefore GETFSMAP) is present.
    pub rmapbt: bool,
}

impl Geometry {
    /// Returns the device size in bytes.
    pub fn device_bytes(&self, realtime: bool) -> u64 {
        let blocks = if realtime {
            self.rt_blocks
        } else {
            self.data_blocks
        };
        blocks.saturating_mul(self.block_size)
    }

    /// Returns the device number queries should use.
    pub fn device(&self, realtime: bool) -> Option<u32> {
        if realtime {
            self.rt_dev
        } else {
            Some(self.data_dev)
        }
    }

    /// Returns the allocation unit for the selected device, in bytes.
    pub fn alloc_unit(&self, realtime: bool) -> u64 {
        if realtime {
            self.block_size * self.rt_extent_blocks.max(1)
        } else {
            self.block_size
        }
    }

    /// Returns the allocation group number containing a data device byte address.
    pub fn agno_of(&self, physical: u64) -> u32 {
        let ag_bytes = self.ag_blocks.max(1) * self.block_size;
        (physical / ag_bytes) as u32
    }

    /// Returns the byte range `[start, end)` of an allocation group.
    pub fn ag_range(&self, agno: u32) -> (u64, u64) {
        let ag_bytes = self.ag_blocks * self.block_size;
        let start = agno as u64 * ag_bytes;
        (start, (start + ag_bytes).min(self.device_bytes(false)))
    }

    /// Rounds a byte count up to whole blocks.
    pub fn round_up(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.block_size) * self.block_size
    }

    /// Rounds a byte count down to whole blocks.
    pub fn round_down(&self, bytes: u64) -> u64 {
        bytes / self.block_size * self.block_size
    }

    /// Returns whether a byte count is block aligned.
    pub fn is_aligned(&self, bytes: u64) -> bool {
        bytes % self.block_size == 0
    }
}
