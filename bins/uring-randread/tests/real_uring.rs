//! End-to-end reads through the real kernel
//!
//! These tests need io_uring and a filesystem that accepts O_DIRECT. Containers
//! often block `io_uring_setup` and tmpfs may reject O_DIRECT, so each test
//! skips with a message instead of failing when the environment lacks either.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tempfile::NamedTempFile;
use uring_bench_core::{Engine, Error, ReadTarget, ReapMode, Sequential};
use uring_randread::{DriverConfig, RandomBlocks, StopReason};

const BLOCK: usize = 4096;

/// Cargo's per-target scratch dir lives on disk, unlike a tmpfs /tmp
fn scratch_dir() -> PathBuf {
    option_env!("CARGO_TARGET_TMPDIR").map_or_else(std::env::temp_dir, PathBuf::from)
}

/// Temp file where every byte of block `i` is `i as u8`
fn patterned_file(blocks: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new_in(scratch_dir()).unwrap();
    for i in 0..blocks {
        file.write_all(&[i as u8; BLOCK]).unwrap();
    }
    file.as_file().sync_all().unwrap();
    file
}

fn open_or_skip(file: &NamedTempFile) -> Option<ReadTarget> {
    match ReadTarget::open(file.path()) {
        Ok(target) => Some(target),
        Err(e) => {
            eprintln!("skipping: O_DIRECT open failed: {e}");
            None
        }
    }
}

fn engine_or_skip(capacity: u32) -> Option<Engine> {
    match Engine::new(capacity) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("skipping: io_uring unavailable: {e}");
            None
        }
    }
}

#[test]
fn test_batch_reads_return_file_contents() {
    let file = patterned_file(16);
    let Some(target) = open_or_skip(&file) else {
        return;
    };
    let Some(mut engine) = engine_or_skip(4) else {
        return;
    };

    let mut policy = Sequential::default();
    let queued = engine.submit_reads(&target, 4, &mut policy).unwrap();
    assert_eq!(queued, 4);

    let mut seen = 0;
    while engine.in_flight() > 0 {
        for done in engine.drain(ReapMode::Blocking).unwrap() {
            assert_eq!(done.bytes, BLOCK);
            let data = engine.data(&done.buffer).unwrap();
            // Fresh pool: buffer i was loaned for block i
            let expected = done.buffer.id().index() as u8;
            let intact = data.iter().all(|&b| b == expected);
            assert!(intact, "block {expected} mismatch");
            engine.release(done.buffer).unwrap();
            seen += 1;
        }
    }
    assert_eq!(seen, 4);
    assert_eq!(engine.pool().free_len(), 4);
}

#[test]
fn test_driver_random_reads() {
    let file = patterned_file(256);
    let Some(target) = open_or_skip(&file) else {
        return;
    };
    let Some(mut engine) = engine_or_skip(16) else {
        return;
    };

    let config = DriverConfig {
        queue_depth: 16,
        max_reads: Some(2000),
        ..Default::default()
    };
    let stop = AtomicBool::new(false);
    let mut policy = RandomBlocks::seeded(3);
    let result = uring_randread::run(&mut engine, &target, &config, &mut policy, &stop, |_| {});
    let summary = result.unwrap();

    assert_eq!(summary.reads, 2000);
    assert_eq!(summary.stopped_by, StopReason::ReadLimit);
    assert!(summary.pool_blocks <= 16);
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn test_file_smaller_than_block() {
    let mut file = NamedTempFile::new_in(scratch_dir()).unwrap();
    file.write_all(&[0u8; 100]).unwrap();
    let Some(target) = open_or_skip(&file) else {
        return;
    };
    let Some(mut engine) = engine_or_skip(2) else {
        return;
    };

    let mut policy = Sequential::default();
    let err = engine.submit_reads(&target, 1, &mut policy).unwrap_err();
    match err {
        Error::FileTooSmall { size, block_size } => {
            assert_eq!(size, 100);
            assert_eq!(block_size, BLOCK);
        }
        other => panic!("expected FileTooSmall, got {other:?}"),
    }
}
