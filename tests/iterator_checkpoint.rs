#[path = "support/engine.rs"]
mod support;

use blocklog::{BoundedLogIterator, IterError, LogEngine, Lsn, Scn};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::{payload, roomy_options, TestEngine};

/// Frontier and mode epoch the test moves by hand.
#[derive(Clone)]
struct Bounds {
    frontier: Arc<AtomicU64>,
    epoch: Arc<AtomicI64>,
}

impl Bounds {
    fn new(frontier: Lsn, epoch: i64) -> Self {
        Self {
            frontier: Arc::new(AtomicU64::new(frontier.value())),
            epoch: Arc::new(AtomicI64::new(epoch)),
        }
    }

    fn set_frontier(&self, lsn: Lsn) {
        self.frontier.store(lsn.value(), Ordering::SeqCst);
    }

    fn set_epoch(&self, epoch: i64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    fn iterator<'a>(&self, engine: &'a LogEngine, start: Lsn) -> BoundedLogIterator<'a> {
        let frontier = self.frontier.clone();
        let epoch = self.epoch.clone();
        engine.iterator(
            start,
            move || Lsn(frontier.load(Ordering::SeqCst)),
            move || epoch.load(Ordering::SeqCst),
        )
    }
}

fn need_more_data(result: Result<(Lsn, blocklog::LogEntry), IterError>) -> (Scn, bool) {
    match result {
        Err(IterError::NeedMoreData {
            next_min_scn,
            blocked_by_replay_point,
        }) => (next_min_scn, blocked_by_replay_point),
        other => panic!("expected NeedMoreData, got {other:?}"),
    }
}

#[test]
fn replays_every_entry_and_never_surfaces_padding() {
    let harness = TestEngine::new(roomy_options());
    let lsns = harness.append_all(1..=100, 2080);
    let bounds = Bounds::new(harness.engine.tail(), 0);
    let mut iter = bounds.iterator(&harness.engine, Lsn::ZERO);

    let mut replayed = Vec::new();
    loop {
        match iter.next(Scn::max_scn()) {
            Ok((lsn, entry)) => {
                assert!(!entry.is_padding());
                replayed.push((lsn, entry.scn()));
            }
            Err(IterError::NeedMoreData {
                next_min_scn,
                blocked_by_replay_point,
            }) => {
                assert_eq!(next_min_scn, Scn(101));
                assert!(!blocked_by_replay_point);
                break;
            }
            Err(err) => panic!("unexpected {err}"),
        }
    }
    let expected: Vec<_> = lsns.into_iter().zip((1..=100).map(Scn)).collect();
    assert_eq!(replayed, expected);
    assert_eq!(iter.start_lsn(), harness.engine.tail());
}

#[test]
fn low_replay_point_reports_the_same_next_min_scn() {
    let harness = TestEngine::new(roomy_options());
    harness.append_all(1..=10, 500);
    let bounds = Bounds::new(harness.engine.tail(), 0);
    let mut iter = bounds.iterator(&harness.engine, Lsn::ZERO);

    for scn in 1..=5 {
        assert_eq!(iter.next(Scn(5)).unwrap().1.scn(), Scn(scn));
    }
    assert_eq!(need_more_data(iter.next(Scn(5))), (Scn(6), true));
    assert_eq!(need_more_data(iter.next(Scn(5))), (Scn(6), true));
    assert_eq!(iter.prev_entry_scn(), Scn(5));
    assert_eq!(iter.next(Scn(10)).unwrap().1.scn(), Scn(6));
}

#[test]
fn next_min_scn_never_regresses() {
    let harness = TestEngine::new(roomy_options());
    for i in 1..=5 {
        harness
            .engine
            .append(Scn(i * 10), &payload(i, 300))
            .unwrap();
    }
    let bounds = Bounds::new(harness.engine.tail(), 0);
    let mut iter = bounds.iterator(&harness.engine, Lsn::ZERO);

    assert_eq!(need_more_data(iter.next(Scn(5))), (Scn(6), true));
    assert_eq!(need_more_data(iter.next(Scn(3))), (Scn(6), true));
    assert_eq!(need_more_data(iter.next(Scn(8))), (Scn(9), true));
    assert_eq!(iter.prev_entry_scn(), Scn(8));
    assert_eq!(iter.next(Scn(10)).unwrap().1.scn(), Scn(10));
}

#[test]
fn blocked_replay_point_advances_prev_scn_across_gaps() {
    let harness = TestEngine::new(roomy_options());
    harness.engine.append(Scn(10), b"ten").unwrap();
    let fifty = harness.engine.append(Scn(50), b"fifty").unwrap();
    let bounds = Bounds::new(fifty.end_lsn - 1, 0);
    let mut iter = bounds.iterator(&harness.engine, Lsn::ZERO);

    assert_eq!(iter.next(Scn::max_scn()).unwrap().1.scn(), Scn(10));
    assert_eq!(need_more_data(iter.next(Scn(30))), (Scn(31), true));
    assert_eq!(iter.prev_entry_scn(), Scn(30));
    assert_eq!(need_more_data(iter.next(Scn::max_scn())), (Scn(31), false));
    assert!(iter.has_cached_entry());

    bounds.set_frontier(fifty.end_lsn);
    let (lsn, entry) = iter.next(Scn::max_scn()).unwrap();
    assert_eq!(lsn, fifty.lsn);
    assert_eq!(entry.payload, b"fifty");
}

#[test]
fn only_a_strictly_higher_epoch_drops_the_cache() {
    let harness = TestEngine::new(roomy_options());
    harness.append_all(1..=3, 400);
    let bounds = Bounds::new(harness.engine.tail(), 1);
    let mut iter = bounds.iterator(&harness.engine, Lsn::ZERO);

    assert_eq!(iter.next(Scn(1)).unwrap().1.scn(), Scn(1));
    assert!(need_more_data(iter.next(Scn(1))).1);
    assert!(iter.has_cached_entry());
    assert_eq!(iter.cached_epoch(), 1);

    for epoch in [-1, 0, 1] {
        bounds.set_epoch(epoch);
        assert!(iter.next(Scn(1)).is_err());
        assert_eq!(iter.cached_epoch(), 1);
    }
    bounds.set_epoch(2);
    assert!(iter.next(Scn(1)).is_err());
    assert_eq!(iter.cached_epoch(), 2);
    assert_eq!(iter.next(Scn(3)).unwrap().1.scn(), Scn(2));
}

#[test]
fn epoch_bump_after_flashback_rereads_the_cut_point() {
    let harness = TestEngine::new(roomy_options());
    let engine = &harness.engine;
    for i in 1..=20 {
        engine.append(Scn(i * 10), &payload(i, 500)).unwrap();
    }
    let bounds = Bounds::new(engine.tail(), 1);
    let mut iter = bounds.iterator(engine, Lsn::ZERO);
    for i in 1..=10 {
        assert_eq!(iter.next(Scn(100)).unwrap().1.scn(), Scn(i * 10));
    }
    assert_eq!(need_more_data(iter.next(Scn(100))), (Scn(101), true));
    let cut = iter.start_lsn();

    engine.fence().fence(1).unwrap();
    let outcome = engine
        .flashback(1, Scn(105), Duration::from_secs(10))
        .unwrap();
    engine.fence().lift(1).unwrap();
    assert_eq!(outcome.new_tail, cut);
    let rewritten = engine.append(Scn(106), b"rewritten").unwrap();
    assert_eq!(rewritten.lsn, cut);
    bounds.set_frontier(engine.tail());
    bounds.set_epoch(2);

    let (lsn, entry) = iter.next(Scn(200)).unwrap();
    assert_eq!(lsn, cut);
    assert_eq!(entry.scn(), Scn(106));
    assert_eq!(entry.payload, b"rewritten");
}

#[test]
fn stop_lsn_ends_iteration() {
    let harness = TestEngine::new(roomy_options());
    let lsns = harness.append_all(1..=10, 600);
    let bounds = Bounds::new(harness.engine.tail(), 0);
    let mut iter = bounds
        .iterator(&harness.engine, lsns[2])
        .with_prev_entry_scn(Scn(2))
        .with_stop_lsn(lsns[6]);

    let scns: Vec<_> = (0..4)
        .map(|_| iter.next(Scn::max_scn()).unwrap().1.scn())
        .collect();
    assert_eq!(scns, vec![Scn(3), Scn(4), Scn(5), Scn(6)]);
    assert!(matches!(iter.next(Scn::max_scn()), Err(IterError::IterEnd)));
    assert!(matches!(iter.next(Scn::max_scn()), Err(IterError::IterEnd)));
}

#[test]
fn bounds_may_borrow_the_engine() {
    let harness = TestEngine::new(roomy_options());
    let engine = &harness.engine;
    harness.append_all(1..=5, 800);
    let mut iter = engine.iterator(Lsn::ZERO, move || engine.tail(), || 0);

    for scn in 1..=5 {
        assert_eq!(iter.next(Scn::max_scn()).unwrap().1.scn(), Scn(scn));
    }
    assert_eq!(need_more_data(iter.next(Scn::max_scn())), (Scn(6), false));
    engine.append(Scn(6), b"late").unwrap();
    assert_eq!(iter.next(Scn::max_scn()).unwrap().1.payload, b"late");
}
