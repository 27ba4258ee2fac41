#[path = "support/engine.rs"]
mod support;

use blocklog::{LogEngine, LogEntry, LogError, Lsn, MetaStore, Scn};
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use support::{config, payload, roomy_options, TestEngine, BLOCK_SIZE, META_BLOCK_SIZE};

const ENTRY_SIZE: u64 = 1500;

fn block_file(harness: &TestEngine, lsn: Lsn) -> std::fs::File {
    let path = harness
        .engine
        .paths()
        .data_dir
        .join(lsn.block_id(BLOCK_SIZE).to_string());
    OpenOptions::new().read(true).write(true).open(path).unwrap()
}

#[test]
fn partial_entry_past_tail_is_dropped_on_restart() {
    let harness = TestEngine::new(roomy_options());
    harness.append_all(1..=20, ENTRY_SIZE);
    harness.engine.flush().unwrap();
    let tail = harness.engine.tail();

    let torn = LogEntry::normal(Scn(21), payload(21, ENTRY_SIZE))
        .unwrap()
        .encode();
    let file = block_file(&harness, tail);
    file.write_all_at(&torn[..torn.len() / 2], tail.block_offset(BLOCK_SIZE))
        .unwrap();
    drop(file);

    let harness = harness.reopen();
    assert_eq!(harness.engine.tail(), tail);
    let resumed = harness
        .engine
        .append(Scn(21), &payload(21, ENTRY_SIZE))
        .unwrap();
    assert_eq!(resumed.lsn, tail);
    assert_eq!(harness.engine.read_entry(tail).unwrap().scn(), Scn(21));
}

#[test]
fn corrupt_last_entry_is_treated_as_the_end() {
    let harness = TestEngine::new(roomy_options());
    let lsns = harness.append_all(1..=10, ENTRY_SIZE);
    let last = *lsns.last().unwrap();

    let file = block_file(&harness, last);
    let offset = last.block_offset(BLOCK_SIZE) + ENTRY_SIZE - 1;
    file.write_all_at(&[0xFF], offset).unwrap();
    drop(file);

    let harness = harness.reopen();
    assert_eq!(harness.engine.tail(), last);
    assert!(matches!(
        harness.engine.append(Scn(8), b"late"),
        Err(LogError::ScnRegression { .. })
    ));
    harness.engine.append(Scn(10), b"retry").unwrap();
}

#[test]
fn restart_preserves_tail_for_random_histories() {
    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        let mut harness = TestEngine::new(roomy_options());
        let mut scn = 0;
        for _ in 0..rng.gen_range(1..4) {
            let count = rng.gen_range(1..80);
            for _ in 0..count {
                scn += rng.gen_range(0..3u64) + 1;
                let size = rng.gen_range(64..4096u64);
                harness.engine.append(Scn(scn), &payload(scn, size)).unwrap();
            }
            let tail = harness.engine.tail();
            let range = harness.engine.get_block_id_range();
            harness = harness.reopen();
            assert_eq!(harness.engine.tail(), tail);
            assert_eq!(harness.engine.get_block_id_range(), range);
            assert_eq!(harness.engine.data_stream().last_scn(), Some(Scn(scn)));
        }
    }
}

#[test]
fn short_block_file_is_reextended() {
    let harness = TestEngine::new(roomy_options());
    harness.append_all(1..=5, ENTRY_SIZE);
    let tail = harness.engine.tail();
    let file = block_file(&harness, tail);
    file.set_len(tail.block_offset(BLOCK_SIZE)).unwrap();
    drop(file);

    let harness = harness.reopen();
    assert_eq!(harness.engine.tail(), tail);
    let file = block_file(&harness, tail);
    assert_eq!(file.metadata().unwrap().len(), BLOCK_SIZE);
}

#[test]
fn data_without_metadata_fails_hard() {
    let harness = TestEngine::new(roomy_options());
    harness.append_all(1..=5, ENTRY_SIZE);
    let TestEngine {
        engine,
        registry,
        dir,
    } = harness;
    let meta_dir = engine.paths().meta_dir.clone();
    drop(engine);
    fs::remove_dir_all(&meta_dir).unwrap();

    let err = LogEngine::open(config(dir.path(), roomy_options()), &registry)
        .err()
        .expect("layout mismatch");
    assert!(matches!(err, LogError::LayoutMismatch(_)));
    assert!(!err.is_retryable());
    assert!(registry.is_empty());
}

#[test]
fn base_lsn_beyond_tail_fails_hard() {
    let harness = TestEngine::new(roomy_options());
    harness.append_all(1..=5, ENTRY_SIZE);
    let TestEngine {
        engine,
        registry,
        dir,
    } = harness;
    let meta_dir = engine.paths().meta_dir.clone();
    let tail = engine.tail();
    drop(engine);

    let store = MetaStore::open(&meta_dir, META_BLOCK_SIZE).unwrap();
    let mut meta = store.load().unwrap();
    meta.base_lsn = tail + BLOCK_SIZE;
    store.persist(&meta).unwrap();
    drop(store);

    let err = LogEngine::open(config(dir.path(), roomy_options()), &registry)
        .err()
        .expect("layout mismatch");
    assert!(matches!(err, LogError::LayoutMismatch(_)));
}

#[test]
fn gc_state_survives_restart() {
    let harness = TestEngine::new(blocklog::DiskOptions::new(8 * BLOCK_SIZE, 100, 10));
    harness.append_all(1..=200, 2048);
    harness
        .engine
        .advance_base_lsn(Lsn(3 * BLOCK_SIZE))
        .unwrap();
    assert_eq!(harness.engine.recycle_blocks().unwrap(), vec![0, 1, 2]);
    let tail = harness.engine.tail();

    let harness = harness.reopen();
    assert_eq!(harness.engine.tail(), tail);
    assert_eq!(harness.engine.base_lsn(), Lsn(3 * BLOCK_SIZE));
    assert_eq!(harness.engine.get_min_scn().unwrap(), Scn(97));
}
