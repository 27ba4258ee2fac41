#[path = "support/engine.rs"]
mod support;

use blocklog::{
    DiskOptions, DiskQuotaController, LogEngine, LogError, Lsn, QuotaRegistry, QuotaStatus, Scn,
};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use support::{payload, TestEngine, BLOCK_SIZE};

const ENTRY_SIZE: u64 = 2048;

fn blocks(count: u64) -> u64 {
    count * BLOCK_SIZE
}

#[test]
fn shrink_converges_after_blocks_are_recycled() {
    let harness = TestEngine::new(DiskOptions::new(blocks(10), 100, 80));
    let engine = &harness.engine;
    for block in 0..4 {
        harness.append_all((block * 32 + 1)..=(block * 32 + 32), ENTRY_SIZE);
    }
    assert_eq!(engine.tail(), Lsn(blocks(4)));
    assert_eq!(engine.usage().max_block_id, Some(4));

    let shrunk = DiskOptions::new(blocks(2), 100, 50);
    engine.update_disk_options(shrunk).unwrap();
    let quota = engine.quota();
    assert_eq!(quota.status(), QuotaStatus::Shrinking);
    assert!(matches!(
        engine.update_disk_options(DiskOptions::new(blocks(3), 100, 50)),
        Err(LogError::StateNotMatch(_))
    ));

    assert_eq!(engine.tick().unwrap(), QuotaStatus::Shrinking);
    assert_eq!(
        quota.opts_for_stopping_writes().usage_limit_size,
        blocks(5)
    );
    assert!(
        quota.opts_for_recycling_blocks().usage_limit_size
            <= quota.opts_for_stopping_writes().usage_limit_size
    );

    engine.advance_base_lsn(engine.tail()).unwrap();
    assert_eq!(engine.tick().unwrap(), QuotaStatus::Normal);
    assert_eq!(engine.usage().min_block_id, Some(4));
    assert_eq!(quota.opts_for_stopping_writes(), shrunk);
    assert_eq!(quota.opts_for_recycling_blocks(), shrunk);
}

#[test]
fn appends_stop_at_the_write_ceiling() {
    let harness = TestEngine::new(DiskOptions::new(blocks(2), 100, 50));
    let engine = &harness.engine;
    harness.append_all(1..=64, ENTRY_SIZE);
    assert_eq!(engine.tail(), Lsn(blocks(2)));
    let err = engine
        .append(Scn(65), &payload(65, ENTRY_SIZE))
        .expect_err("third block refused");
    assert!(matches!(err, LogError::DiskFull { .. }));
    assert!(err.is_retryable());
    assert_eq!(engine.usage().max_block_id, Some(1));

    engine.update_disk_options(DiskOptions::new(blocks(4), 100, 50)).unwrap();
    engine.append(Scn(65), &payload(65, ENTRY_SIZE)).unwrap();
    assert_eq!(engine.usage().max_block_id, Some(2));
}

#[test]
fn recycling_never_exceeds_stopping_while_shrinking() {
    let mut rng = rand::thread_rng();
    let controller = DiskQuotaController::new(7, DiskOptions::new(blocks(64), 90, 60)).unwrap();
    let mut used = blocks(30);
    for _ in 0..500 {
        match rng.gen_range(0..3) {
            0 => {
                let size = blocks(rng.gen_range(1..96));
                let _ = controller.update_options(DiskOptions::new(size, 90, 60));
            }
            1 => used = blocks(rng.gen_range(0..64)),
            _ => {
                controller.tick(used);
            }
        }
        let snapshot = controller.snapshot();
        if snapshot.status == QuotaStatus::Shrinking {
            assert!(
                snapshot.opts_for_recycling_blocks.usage_limit_size
                    <= snapshot.opts_for_stopping_writes.usage_limit_size
            );
        } else {
            assert_eq!(
                snapshot.opts_for_recycling_blocks,
                snapshot.opts_for_stopping_writes
            );
        }
    }
}

#[test]
fn registry_routes_admin_updates_and_ticks_persist_them() {
    let harness = TestEngine::new(DiskOptions::new(blocks(16), 100, 80));
    let expanded = DiskOptions::new(blocks(32), 100, 80);
    harness.registry.update_options(1, expanded).unwrap();
    assert_eq!(harness.engine.quota().opts_for_stopping_writes(), expanded);
    harness.engine.tick().unwrap();

    let harness = harness.reopen();
    assert_eq!(harness.engine.quota().opts_for_stopping_writes(), expanded);
    assert_eq!(harness.registry.len(), 1);
}

#[test]
fn background_ticker_recycles_and_converges() {
    support::init_logging();
    let dir = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(QuotaRegistry::new());
    let config = support::config(dir.path(), DiskOptions::new(blocks(10), 100, 80))
        .quota_tick_interval(Duration::from_millis(10));
    let engine = Arc::new(LogEngine::open(config, &registry).unwrap());
    for scn in 1..=(4 * 32) {
        engine.append(Scn(scn), &payload(scn, ENTRY_SIZE)).unwrap();
    }
    engine.advance_base_lsn(engine.tail()).unwrap();
    engine
        .update_disk_options(DiskOptions::new(blocks(2), 100, 50))
        .unwrap();

    let handle = engine.start_background().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while (engine.quota().status() != QuotaStatus::Normal || handle.ticks() == 0)
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.quota().status(), QuotaStatus::Normal);
    assert!(handle.ticks() >= 1);
    assert_eq!(engine.usage().used_bytes, blocks(1));
    drop(handle);
}
