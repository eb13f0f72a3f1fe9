//! End-to-end clearing runs against the in-memory filesystem.
//!
//! These tests drive [`ClearRequest`] through whole passes and check the resulting block
//! ownership: what left the range, what the capture file holds, and that file contents
//! survived the move.

mod common;

use clearfree::{
    ClearConfig, ClearError, ClearRequest, MemFsConfig, MemHook, MemOp, MemFs, Phase, ScrubKind,
    SpecialOwner,
};
use common::{
    assert_capture_identity, assert_no_file_owners, exchange_only, memfs, pattern, BS, LEN, START,
};

#[test]
fn test_dedupe_clears_single_file() {
    let fs = memfs(true);
    let data = pattern(LEN as usize, 1);
    let ino = fs.place_file(START, &data).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    assert_eq!(req.strategy_name(), "dedupe");
    let report = req.run().unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.evacuated, 1);
    assert_eq!(report.newly_cleared, LEN);
    assert!(req.efficacy().unwrap().is_complete());
    assert_no_file_owners(&fs, START, LEN);
    assert_capture_identity(&fs, req.capture_ino(), START, LEN);
    assert_eq!(fs.contents(ino).unwrap(), data);
    assert!(fs.physical_of(ino, 0).unwrap() >= START + LEN);
    assert!(fs.stats().dedupes >= 1);
    assert!(fs.stats().syncs >= 1);
    assert!(fs.stats().eofblock_sweeps >= 1);
}

#[test]
fn test_exchange_clears_without_reflink() {
    let fs = memfs(false);
    let data = pattern(LEN as usize, 2);
    let ino = fs.place_file(START, &data).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    assert_eq!(req.strategy_name(), "exchange");
    let report = req.run().unwrap();

    assert_eq!(report.evacuated, 1);
    assert!(req.efficacy().unwrap().is_complete());
    assert_no_file_owners(&fs, START, LEN);
    assert_eq!(fs.contents(ino).unwrap(), data);
    assert_eq!(fs.stats().clones, 0);
    assert_eq!(fs.stats().dedupes, 0);
}

#[test]
fn test_shared_extent_selected_first() {
    let fs = memfs(true);
    let shared = fs.place_file(START, &pattern(4 * BS as usize, 3)).unwrap();
    fs.share_file(shared).unwrap();
    fs.place_file(START + 8 * BS, &pattern(4 * BS as usize, 4))
        .unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let first = req.next_target().unwrap();
    assert_eq!((first.start, first.length, first.owners), (START, 4 * BS, 2));

    let second = req.next_target().unwrap();
    assert_eq!((second.start, second.owners), (START + 8 * BS, 1));

    let done = req.next_target().unwrap();
    assert_eq!(done.length, 0);
    assert_eq!(req.visited().covered(), 8 * BS);
}

#[test]
fn test_equal_priority_prefers_longer_extent() {
    let fs = memfs(true);
    // 2 blocks x 2 owners scores the same as 4 blocks x 1 owner
    let shared = fs.place_file(START, &pattern(2 * BS as usize, 5)).unwrap();
    fs.share_file(shared).unwrap();
    fs.place_file(START + 8 * BS, &pattern(4 * BS as usize, 6))
        .unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let first = req.next_target().unwrap();
    assert_eq!((first.start, first.length), (START + 8 * BS, 4 * BS));
}

#[test]
fn test_unwritten_extent_selected_and_moved() {
    let fs = memfs(true);
    let big = fs.place_file(START, &pattern(8 * BS as usize, 7)).unwrap();
    fs.share_file(big).unwrap();
    let prealloc = fs.place_unwritten(START + 12 * BS, 2 * BS).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let first = req.next_target().unwrap();
    assert_eq!(first.start, START + 12 * BS);
    drop(req);

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    req.run().unwrap();
    assert_no_file_owners(&fs, START, LEN);
    assert!(req.efficacy().unwrap().is_complete());
    assert_eq!(fs.contents(prealloc).unwrap(), vec![0u8; 2 * BS as usize]);
    assert!(fs.physical_of(prealloc, 0).is_some());
}

#[test]
fn test_shared_file_both_owners_moved() {
    let fs = memfs(true);
    let data = pattern(6 * BS as usize, 8);
    let a = fs.place_file(START + 2 * BS, &data).unwrap();
    let b = fs.share_file(a).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();

    assert_eq!(report.evacuated, 2);
    assert_no_file_owners(&fs, START, LEN);
    assert_eq!(fs.contents(a).unwrap(), data);
    assert_eq!(fs.contents(b).unwrap(), data);
}

#[test]
fn test_truncated_owner_is_retried() {
    let fs = memfs(true);
    let ino = fs.place_file(START, &pattern(LEN as usize, 9)).unwrap();
    fs.inject(MemOp::Dedupe, MemHook::Truncate { ino, size: 0 });

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();

    assert_eq!(report.retries, 1);
    assert_eq!(report.evacuated, 0);
    assert_no_file_owners(&fs, START, LEN);
    assert_eq!(fs.contents(ino).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_concurrent_write_retried_next_pass() {
    let fs = memfs(true);
    let mut data = pattern(4 * BS as usize, 10);
    let ino = fs.place_file(START, &data).unwrap();
    let scribble = vec![0xab; BS as usize];
    fs.inject(
        MemOp::Dedupe,
        MemHook::Write {
            ino,
            offset: 0,
            data: scribble.clone(),
        },
    );

    let mut req = ClearRequest::init(&fs, START, 4 * BS, ClearConfig::default()).unwrap();
    let first = req.run().unwrap();
    assert_eq!(first.retries, 1);
    assert_eq!(first.evacuated, 0);
    assert_eq!(fs.linked_owners(START, 4 * BS), vec![ino]);
    // only the block the writer copied away is ours; the rest is still shared
    assert_eq!(first.newly_cleared, BS);
    let efficacy = req.efficacy().unwrap();
    assert_eq!(efficacy.cleared, BS);
    assert!(!efficacy.is_complete());

    let second = req.run().unwrap();
    assert_eq!(second.evacuated, 1);
    assert_eq!(second.retries, 0);
    assert_eq!(second.newly_cleared, 3 * BS);
    assert!(req.efficacy().unwrap().is_complete());
    assert_no_file_owners(&fs, START, 4 * BS);

    data[..BS as usize].copy_from_slice(&scribble);
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_exchange_race_retried_next_pass() {
    let fs = memfs(false);
    let mut data = pattern(LEN as usize, 11);
    let ino = fs.place_file(START, &data).unwrap();
    fs.inject(
        MemOp::Exchange,
        MemHook::Write {
            ino,
            offset: BS,
            data: b"racing".to_vec(),
        },
    );

    let mut req = ClearRequest::init(&fs, START, LEN, exchange_only()).unwrap();
    let first = req.run().unwrap();
    assert_eq!(first.retries, 1);
    assert_eq!(fs.linked_owners(START, LEN), vec![ino]);

    let second = req.run().unwrap();
    assert_eq!(second.evacuated, 1);
    assert_no_file_owners(&fs, START, LEN);
    data[BS as usize..BS as usize + 6].copy_from_slice(b"racing");
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_dedupe_enospc_unshares_and_retries() {
    let fs = memfs(true);
    let data = pattern(4 * BS as usize, 12);
    let ino = fs.place_file(START, &data).unwrap();
    fs.inject(MemOp::Dedupe, MemHook::Fail(libc::ENOSPC));

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();
    assert_eq!(report.evacuated, 1);
    assert_eq!(report.retries, 0);
    assert_no_file_owners(&fs, START, LEN);
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_short_dedupe_finished_block_by_block() {
    let fs = memfs(true);
    let data = pattern(4 * BS as usize, 13);
    let ino = fs.place_file(START, &data).unwrap();
    fs.inject(MemOp::Dedupe, MemHook::ShortDedupe(2 * BS));

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();
    assert_eq!(report.evacuated, 1);
    assert_eq!(fs.stats().dedupes, 3);
    assert_no_file_owners(&fs, START, LEN);
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_partial_tail_block_is_frozen() {
    let fs = memfs(true);
    let data = pattern(2 * BS as usize + 1808, 14);
    let ino = fs.place_file(START + 4 * BS, &data).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    req.run().unwrap();

    assert_no_file_owners(&fs, START, LEN);
    assert!(req.efficacy().unwrap().is_complete());
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_shared_tail_block_left_for_next_pass() {
    let fs = memfs(true);
    let data = pattern(2 * BS as usize + 1808, 22);
    let ino = fs.place_file(START + 4 * BS, &data).unwrap();
    // the owner cannot take a private copy of its tail in either freeze round
    fs.inject(MemOp::Unshare, MemHook::Fail(libc::ENOSPC));
    fs.inject(MemOp::Unshare, MemHook::Fail(libc::ENOSPC));

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let first = req.run().unwrap();
    assert_eq!(fs.pending_hooks(), 0);
    assert_eq!(first.evacuated, 1);
    assert_eq!(first.retries, 1);
    assert_eq!(fs.physical_of(req.capture_ino(), 6 * BS), None);
    assert_eq!(fs.linked_owners(START, LEN), vec![ino]);
    assert_eq!(fs.linked_owners(START + 6 * BS, BS), vec![ino]);
    assert_eq!(req.efficacy().unwrap().cleared, LEN - BS);

    req.run().unwrap();
    assert_no_file_owners(&fs, START, LEN);
    assert_capture_identity(&fs, req.capture_ino(), START, LEN);
    assert!(req.efficacy().unwrap().is_complete());
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_capture_clone_enospc_falls_back_to_exchange() {
    let fs = memfs(true);
    let data = pattern(4 * BS as usize, 23);
    let ino = fs.place_file(START, &data).unwrap();
    // the first clone stages the owner in the work file, the second fills the capture file
    fs.inject(MemOp::Clone, MemHook::Proceed);
    fs.inject(MemOp::Clone, MemHook::Fail(libc::ENOSPC));

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();

    assert_eq!(fs.pending_hooks(), 0);
    assert_eq!(report.evacuated, 1);
    assert_eq!(report.retries, 0);
    assert_no_file_owners(&fs, START, LEN);
    assert_capture_identity(&fs, req.capture_ino(), START, LEN);
    assert!(req.efficacy().unwrap().is_complete());
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_file_straddling_range_edge() {
    let fs = memfs(true);
    let data = pattern(6 * BS as usize, 15);
    let ino = fs.place_file(START - 2 * BS, &data).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    req.run().unwrap();

    assert_no_file_owners(&fs, START, LEN);
    assert_eq!(fs.physical_of(ino, 0), Some(START - 2 * BS));
    assert_eq!(fs.physical_of(ino, BS), Some(START - BS));
    assert_eq!(fs.contents(ino).unwrap(), data);
}

#[test]
fn test_second_run_is_idempotent() {
    let fs = memfs(true);
    fs.place_file(START + BS, &pattern(3 * BS as usize, 16))
        .unwrap();
    fs.place_file(START + 8 * BS, &pattern(5 * BS as usize, 17))
        .unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let first = req.run().unwrap();
    assert_eq!(first.evacuated, 2);

    let second = req.run().unwrap();
    assert_eq!(second.targets, 0);
    assert_eq!(second.evacuated, 0);
    assert_eq!(second.newly_cleared, 0);
    assert!(req.efficacy().unwrap().is_complete());
}

#[test]
fn test_free_range_without_dedupe_or_metadata() {
    let fs = memfs(false);
    let mut req = ClearRequest::init(&fs, START, LEN, exchange_only()).unwrap();
    let report = req.run().unwrap();

    assert_eq!(report.targets, 0);
    assert_eq!(report.evacuated, 0);
    assert_eq!(report.metadata_rebuilds, 0);
    let efficacy = req.efficacy().unwrap();
    assert_eq!(efficacy.cleared, LEN);
    assert!((efficacy.percent() - 100.0).abs() < 1e-9);
}

#[test]
fn test_metadata_rebuilt_out_of_range() {
    let fs = memfs(true);
    fs.place_metadata(START, 2 * BS, SpecialOwner::Ag).unwrap();
    fs.place_metadata(START + 2 * BS, BS, SpecialOwner::Inobt)
        .unwrap();
    fs.place_file(START + 4 * BS, &pattern(2 * BS as usize, 18))
        .unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();

    assert_eq!(report.metadata_rebuilds, 5);
    assert_eq!(
        fs.stats().scrubs,
        vec![
            (0, ScrubKind::Bnobt),
            (0, ScrubKind::Cntbt),
            (0, ScrubKind::Inobt),
            (0, ScrubKind::Finobt),
            (0, ScrubKind::Rmapbt),
        ]
    );
    assert!(fs.metadata_owners(START, LEN).is_empty());
    assert!(req.efficacy().unwrap().is_complete());
}

#[test]
fn test_static_metadata_left_in_place() {
    let fs = memfs(true);
    fs.place_metadata(START, BS, SpecialOwner::Fs).unwrap();
    fs.place_metadata(START + BS, BS, SpecialOwner::Defective)
        .unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let report = req.run().unwrap();

    assert_eq!(report.metadata_rebuilds, 0);
    assert!(fs.stats().scrubs.is_empty());
    assert_eq!(
        fs.metadata_owners(START, LEN),
        vec![SpecialOwner::Fs, SpecialOwner::Defective]
    );
    assert_eq!(req.efficacy().unwrap().cleared, LEN - 2 * BS);
}

#[test]
fn test_unsupported_repair_disables_metadata() {
    let fs = MemFs::new(MemFsConfig {
        repair: false,
        ..Default::default()
    });
    fs.place_metadata(START, BS, SpecialOwner::Refc).unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    assert!(req.evacuates_metadata());
    let report = req.run().unwrap();

    assert_eq!(report.metadata_rebuilds, 0);
    assert!(!req.evacuates_metadata());
    assert_eq!(fs.metadata_owners(START, LEN), vec![SpecialOwner::Refc]);
}

#[test]
fn test_failed_rebuild_is_skipped() {
    for code in [libc::ENOSPC, libc::ENOENT] {
        let fs = memfs(true);
        fs.place_metadata(START + 3 * BS, BS, SpecialOwner::Refc)
            .unwrap();
        fs.inject(MemOp::Scrub, MemHook::Fail(code));

        let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
        let first = req.run().unwrap();
        assert_eq!(fs.pending_hooks(), 0);
        assert_eq!(first.phase, Phase::Done);
        assert_eq!(first.metadata_rebuilds, 0);
        assert!(req.evacuates_metadata());
        assert_eq!(fs.metadata_owners(START, LEN), vec![SpecialOwner::Refc]);
        assert_eq!(req.efficacy().unwrap().cleared, LEN - BS);

        let second = req.run().unwrap();
        assert_eq!(second.metadata_rebuilds, 1);
        assert_eq!(fs.stats().scrubs, vec![(0, ScrubKind::Refcntbt)]);
        assert!(fs.metadata_owners(START, LEN).is_empty());
        assert!(req.efficacy().unwrap().is_complete());
    }
}

#[test]
fn test_handles_released_after_failure() {
    let fs = memfs(true);
    fs.place_file(START, &pattern(LEN as usize, 19)).unwrap();
    fs.inject(MemOp::Clone, MemHook::Fail(libc::EIO));

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    let err = req.run().unwrap_err();
    assert!(matches!(err, ClearError::Io { .. }));
    assert_eq!(req.phase(), Phase::Failed);
    assert_eq!(fs.open_handles(), 2);

    req.free();
    assert_eq!(fs.open_handles(), 0);
    assert!(!fs.is_free(START, LEN));
}

#[test]
fn test_dropping_request_releases_captured_space() {
    let fs = memfs(true);
    {
        let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
        req.run().unwrap();
        assert!(!fs.is_free(START, LEN));
    }
    assert_eq!(fs.open_handles(), 0);
    assert!(fs.is_free(START, LEN));
}

#[test]
fn test_mixed_layout_clears_completely() {
    let fs = memfs(true);
    let mut files = Vec::new();
    for (i, (blk, nblocks)) in [(0u64, 2u64), (3, 1), (5, 4), (11, 3)].iter().enumerate() {
        let data = pattern((nblocks * BS) as usize - 100, 20 + i as u8);
        let ino = fs.place_file(START + blk * BS, &data).unwrap();
        files.push((ino, data));
    }
    fs.share_file(files[2].0).unwrap();
    fs.place_metadata(START + 9 * BS, BS, SpecialOwner::Refc)
        .unwrap();

    let mut req = ClearRequest::init(&fs, START, LEN, ClearConfig::default()).unwrap();
    req.run().unwrap();

    assert_no_file_owners(&fs, START, LEN);
    assert!(fs.metadata_owners(START, LEN).is_empty());
    assert_capture_identity(&fs, req.capture_ino(), START, LEN);
    assert!(req.efficacy().unwrap().is_complete());
    for (ino, data) in files {
        assert_eq!(fs.contents(ino).unwrap(), data);
    }
}
