//! Shared fixtures for the clearing integration tests.

#![allow(dead_code)]

use clearfree::{ClearConfig, MemFs, MemFsConfig};

/// Block size of every simulated filesystem.
pub const BS: u64 = 4096;

/// Start of the range the tests clear: block 64 of AG 0.
pub const START: u64 = 64 * BS;

/// Length of the range the tests clear.
pub const LEN: u64 = 16 * BS;

/// Deterministic file contents.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed))
        .collect()
}

/// Filesystem with or without reflink support.
pub fn memfs(reflink: bool) -> MemFs {
    MemFs::new(MemFsConfig {
        reflink,
        ..Default::default()
    })
}

/// Configuration using the exchange strategy and no metadata relocation.
pub fn exchange_only() -> ClearConfig {
    ClearConfig {
        use_dedupe: Some(false),
        evacuate_metadata: false,
        ..Default::default()
    }
}

/// Asserts that no visible file maps any block of the range.
pub fn assert_no_file_owners(fs: &MemFs, start: u64, len: u64) {
    let owners = fs.linked_owners(start, len);
    assert!(
        owners.is_empty(),
        "range {:#x}+{:#x} still owned by {:?}",
        start,
        len,
        owners
    );
}

/// Asserts that the capture file only maps blocks at their own physical address.
pub fn assert_capture_identity(fs: &MemFs, capture_ino: u64, start: u64, len: u64) {
    let mut off = 0;
    while off < len {
        if let Some(phys) = fs.physical_of(capture_ino, off) {
            assert_eq!(phys, start + off, "capture offset {:#x} misplaced", off);
        }
        off += BS;
    }
}
