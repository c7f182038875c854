//! Integration tests for concurrent marking.
//!
//! Marking results are compared against a single-threaded reference trace
//! for several worker counts and graph seeds, with and without mutators
//! rewriting the graph while marking runs.

#![allow(clippy::cast_sign_loss)]

mod common;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::{build_random_graph, build_rooted_chain, roomy_config, Rng, NODE};
use region_gc::{
    GcConfig, GcEngine, MarkOutcome, ObjectShape, OopClosure, RootClosures, RootEnumerator,
    RootKind, SoftRefPolicy,
};

fn run_cycle(engine: &GcEngine) {
    assert!(engine.start_marking_cycle().unwrap());
    engine.wait_for_marking();
    assert!(engine.is_cycle_complete());
}

#[test]
fn test_no_lost_marks_across_worker_counts() {
    for workers in [1, 2, 4, 8] {
        for seed in [1, 42, 1234] {
            let engine = GcEngine::create(roomy_config(workers)).unwrap();
            let nodes = build_random_graph(&engine, seed, 3000, 8);
            let reachable = engine.reachable_objects();

            run_cycle(&engine);
            let metrics = engine.last_mark_metrics().unwrap();
            assert_eq!(metrics.outcome, MarkOutcome::Completed);
            assert_eq!(metrics.marked_objects, reachable.len());

            for &node in &nodes {
                assert_eq!(
                    engine.is_marked_in_last_cycle(node),
                    reachable.contains(&node),
                    "workers {workers} seed {seed}: node {node} disagrees with reference trace"
                );
            }
        }
    }
}

#[test]
fn test_marking_without_local_finger() {
    let engine = GcEngine::create(roomy_config(4).with_local_finger(false)).unwrap();
    let nodes = build_random_graph(&engine, 7, 2000, 4);
    let reachable = engine.reachable_objects();
    run_cycle(&engine);
    let marked = nodes
        .iter()
        .filter(|&&n| engine.is_marked_in_last_cycle(n))
        .count();
    assert_eq!(marked, reachable.len());
}

#[test]
fn test_repeated_cycles_are_idempotent() {
    let engine = GcEngine::create(roomy_config(4)).unwrap();
    build_random_graph(&engine, 99, 1500, 6);
    let reachable = engine.reachable_objects().len();

    run_cycle(&engine);
    let first = engine.last_mark_metrics().unwrap();
    run_cycle(&engine);
    let second = engine.last_mark_metrics().unwrap();

    assert_eq!(first.marked_objects, reachable);
    assert_eq!(second.marked_objects, reachable);
    assert_eq!(first.live_bytes, second.live_bytes);
    assert_eq!(engine.global_metrics().marking_cycles(), 2);
}

#[test]
fn test_satb_preserves_objects_moved_during_marking() {
    let engine = Arc::new(GcEngine::create(roomy_config(2)).unwrap());
    let holders = 64;
    let holder_array = engine
        .allocate(ObjectShape::ObjArray { length: holders })
        .unwrap();
    engine.roots().add(RootKind::Static, Some(holder_array));
    for i in 0..holders {
        let chain = build_rooted_chain(&engine, 50);
        let head = engine.roots().get(chain);
        engine.write_ref(holder_array, i, head);
        engine.roots().remove(chain);
    }

    assert!(engine.start_marking_cycle().unwrap());
    let stop = Arc::new(AtomicBool::new(false));
    let mutators: Vec<_> = (0..2)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = Rng::new(17 + t);
                let mut moves = 0usize;
                while !stop.load(Ordering::Acquire) || moves < 1000 {
                    // Detach the tail of one chain and hang it off another.
                    let from = engine.read_ref(holder_array, rng.below(holders));
                    let to = engine.read_ref(holder_array, rng.below(holders));
                    if let (Some(from), Some(to)) = (from, to) {
                        if from != to {
                            let tail = engine.read_ref(from, 0);
                            engine.write_ref(from, 0, None);
                            let displaced = engine.read_ref(to, 1);
                            engine.write_ref(to, 1, tail);
                            engine.write_ref(from, 1, displaced);
                        }
                    }
                    moves += 1;
                }
            })
        })
        .collect();

    engine.wait_for_marking();
    stop.store(true, Ordering::Release);
    for m in mutators {
        m.join().unwrap();
    }

    let metrics = engine.last_mark_metrics().unwrap();
    assert_eq!(metrics.outcome, MarkOutcome::Completed);
    for obj in engine.reachable_objects() {
        assert!(
            engine.is_marked_in_last_cycle(obj),
            "object {obj} reachable after marking but unmarked"
        );
    }
}

#[test]
fn test_abort_leaves_engine_usable() {
    let engine = GcEngine::create(roomy_config(2)).unwrap();
    let nodes = build_random_graph(&engine, 5, 4000, 10);

    assert!(engine.start_marking_cycle().unwrap());
    engine.abort_marking();
    assert!(engine.is_cycle_complete());
    let metrics = engine.last_mark_metrics().unwrap();
    if metrics.outcome == MarkOutcome::Aborted {
        assert_eq!(engine.global_metrics().aborted_cycles(), 1);
        assert!(nodes.iter().all(|&n| !engine.is_marked_in_last_cycle(n)));
        assert!(!engine.concurrent_mark().satb().is_active());
    }

    let reachable = engine.reachable_objects();
    run_cycle(&engine);
    assert_eq!(
        engine.last_mark_metrics().unwrap().outcome,
        MarkOutcome::Completed
    );
    for &node in &nodes {
        assert_eq!(engine.is_marked_in_last_cycle(node), reachable.contains(&node));
    }
}

#[test]
fn test_overflow_restarts_with_tiny_mark_stack() {
    let config = GcConfig::default()
        .with_region_bytes(1 << 20)
        .with_heap_bytes(8 << 20, 16 << 20)
        .with_parallel_workers(1)
        .with_obj_array_stride(1 << 20)
        .with_mark_stack_limit(1)
        .with_verify_marking(true);
    let engine = GcEngine::create(config).unwrap();

    // Children sit below the array, so scanning it pushes every child.
    let fan_out = 40_000;
    let children: Vec<_> = (0..fan_out)
        .map(|_| engine.allocate(NODE).unwrap())
        .collect();
    let array = engine
        .allocate(ObjectShape::ObjArray { length: fan_out })
        .unwrap();
    for (i, &child) in children.iter().enumerate() {
        engine.write_ref(array, i, Some(child));
    }
    engine.roots().add(RootKind::Static, Some(array));

    run_cycle(&engine);
    let metrics = engine.last_mark_metrics().unwrap();
    assert_eq!(metrics.outcome, MarkOutcome::Completed);
    assert!(metrics.overflow_restarts > 0, "marking never overflowed");
    assert_eq!(metrics.marked_objects, fan_out + 1);
    assert!(children.iter().all(|&c| engine.is_marked_in_last_cycle(c)));
}

#[test]
fn test_sliced_arrays_are_fully_marked() {
    let engine = GcEngine::create(roomy_config(4).with_obj_array_stride(16)).unwrap();
    let length = 1000;
    let children: Vec<_> = (0..length)
        .map(|_| engine.allocate(NODE).unwrap())
        .collect();
    let array = engine.allocate(ObjectShape::ObjArray { length }).unwrap();
    for (i, &child) in children.iter().enumerate() {
        engine.write_ref(array, i, Some(child));
    }
    engine.roots().add(RootKind::ThreadStack, Some(array));

    run_cycle(&engine);
    assert_eq!(
        engine.last_mark_metrics().unwrap().marked_objects,
        length + 1
    );
    assert!(children.iter().all(|&c| engine.is_marked_in_last_cycle(c)));
}

#[test]
fn test_weak_roots_cleared_at_remark() {
    let engine = GcEngine::create(roomy_config(2)).unwrap();
    let live = engine.allocate(NODE).unwrap();
    let dead = engine.allocate(NODE).unwrap();
    engine.roots().add(RootKind::Static, Some(live));
    let weak_live = engine.roots().add(RootKind::StringTable, Some(live));
    let weak_dead = engine.roots().add(RootKind::StringTable, Some(dead));

    run_cycle(&engine);
    assert_eq!(engine.roots().get(weak_live), Some(live));
    assert_eq!(engine.roots().get(weak_dead), None);
}

#[test]
fn test_quiet_cycle_after_busy_cycle_counts_satb_per_cycle() {
    let engine = Arc::new(GcEngine::create(roomy_config(2)).unwrap());
    build_random_graph(&engine, 11, 3000, 8);
    let a = engine.allocate(NODE).unwrap();
    let b = engine.allocate(NODE).unwrap();
    let holder = engine.allocate(NODE).unwrap();
    engine.write_ref(holder, 0, Some(a));
    engine.roots().add(RootKind::Static, Some(holder));

    let stop = Arc::new(AtomicBool::new(false));
    let writes = Arc::new(AtomicUsize::new(0));
    let writer = thread::spawn({
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        let writes = Arc::clone(&writes);
        move || {
            // Every store overwrites a non-null value.
            while !stop.load(Ordering::Acquire) {
                let next = if engine.read_ref(holder, 0) == Some(a) { b } else { a };
                engine.write_ref(holder, 0, Some(next));
                writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
    while writes.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }
    run_cycle(&engine);
    stop.store(true, Ordering::Release);
    writer.join().unwrap();
    let busy = engine.last_mark_metrics().unwrap();
    assert!(busy.satb_entries <= writes.load(Ordering::Relaxed));

    run_cycle(&engine);
    let quiet = engine.last_mark_metrics().unwrap();
    assert_eq!(quiet.outcome, MarkOutcome::Completed);
    assert_eq!(quiet.satb_entries, 0);
    assert_ne!(quiet.gc_id, busy.gc_id);
    assert_eq!(engine.global_metrics().marking_cycles(), 2);
}

/// Roots whose enumeration fails an internal assertion.
struct BrokenRoots;

impl RootEnumerator for BrokenRoots {
    fn process_roots(&self, _parity: u32, _soft: SoftRefPolicy, _closures: &mut RootClosures<'_>) {
        panic!("root scan failed");
    }

    fn process_weak_roots(&self, _soft: SoftRefPolicy, _closure: &mut dyn OopClosure) {}
}

#[test]
fn test_mark_thread_panic_reaches_waiter() {
    let engine = GcEngine::with_roots(roomy_config(1), BrokenRoots).unwrap();
    assert!(engine.start_marking_cycle().unwrap());

    let result = panic::catch_unwind(AssertUnwindSafe(|| engine.wait_for_marking()));
    let payload = result.expect_err("mark thread panic was swallowed");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"root scan failed"));
    assert!(engine.is_cycle_complete());
    assert!(engine.last_mark_metrics().is_none());
}
