//! Liveness results of completed marking cycles: per-card and per-region
//! live data, dead-object queries and region reclamation at cleanup.

mod common;

use common::{build_rooted_chain, roomy_config, NODE};
use region_gc::{GcEngine, ObjectShape, RootKind};

fn run_cycle(engine: &GcEngine) {
    assert!(engine.start_marking_cycle().unwrap());
    engine.wait_for_marking();
}

/// A primitive array of exactly `words` heap words.
fn filler(words: usize) -> ObjectShape {
    let header = ObjectShape::TypeArray { length: 0 }.size_words();
    ObjectShape::TypeArray {
        length: words - header,
    }
}

#[test]
fn test_object_spanning_cards_marks_both() {
    let engine = GcEngine::create(roomy_config(2).with_card_bytes(512)).unwrap();
    // 62 words of garbage put the live node at byte 496 of the first card.
    let garbage = engine.allocate(filler(62)).unwrap();
    let live = engine.allocate(NODE).unwrap();
    engine.allocate(filler(200)).unwrap();
    engine.roots().add(RootKind::Static, Some(live));
    assert_eq!(live.bytes_since(garbage), 496);

    run_cycle(&engine);
    assert!(engine.is_card_live(garbage));
    assert!(engine.is_card_live(garbage.add_bytes(512)));
    assert!(!engine.is_card_live(garbage.add_bytes(1024)));
}

#[test]
fn test_dead_objects_reported_after_cycle() {
    let engine = GcEngine::create(roomy_config(2)).unwrap();
    let live = engine.allocate(NODE).unwrap();
    let dead = engine.allocate(NODE).unwrap();
    engine.roots().add(RootKind::ThreadStack, Some(live));

    // Nothing is known dead before a marking completes.
    assert!(!engine.is_obj_dead(dead));

    run_cycle(&engine);
    assert!(!engine.is_obj_dead(live));
    assert!(engine.is_obj_dead(dead));

    // Allocated after the snapshot, so implicitly live.
    let fresh = engine.allocate(NODE).unwrap();
    assert!(!engine.is_obj_dead(fresh));
}

#[test]
fn test_region_live_bytes_match_marked_objects() {
    let engine = GcEngine::create(roomy_config(4)).unwrap();
    let chain = build_rooted_chain(&engine, 100);
    for _ in 0..100 {
        engine.allocate(NODE).unwrap();
    }
    let head = engine.roots().get(chain).unwrap();
    let region = engine.region_containing(head).unwrap().index();

    run_cycle(&engine);
    let metrics = engine.last_mark_metrics().unwrap();
    let node_bytes = NODE.size_words() * 8;
    assert_eq!(metrics.live_bytes, 100 * node_bytes);
    assert_eq!(engine.region_live_bytes(region), Some(100 * node_bytes));
}

#[test]
fn test_cleanup_frees_all_garbage_regions() {
    let engine = GcEngine::create(roomy_config(2)).unwrap();
    let region_bytes = engine.config().region_bytes;
    let node_bytes = NODE.size_words() * 8;
    // Four regions' worth of garbage followed by a small live chain.
    for _ in 0..(4 * region_bytes / node_bytes) {
        engine.allocate(NODE).unwrap();
    }
    let chain = build_rooted_chain(&engine, 50);
    let free_before = engine.num_free_regions();

    run_cycle(&engine);
    let metrics = engine.last_mark_metrics().unwrap();
    assert!(metrics.regions_reclaimed >= 3, "{metrics:?}");
    assert_eq!(
        engine.num_free_regions(),
        free_before + metrics.regions_reclaimed
    );
    assert_eq!(
        engine.global_metrics().regions_reclaimed(),
        metrics.regions_reclaimed
    );

    // The chain's region survives with its objects intact.
    let head = engine.roots().get(chain).unwrap();
    assert!(!engine.region_containing(head).unwrap().is_free());
    assert_eq!(engine.read_prim(head, 0), 0);
}

#[test]
fn test_cleanup_frees_dead_humongous() {
    let engine = GcEngine::create(roomy_config(2)).unwrap();
    let shape = ObjectShape::TypeArray { length: 20_000 };
    let live = engine.allocate(shape).unwrap();
    let dead = engine.allocate(shape).unwrap();
    engine.roots().add(RootKind::Static, Some(live));
    let dead_region = engine.region_containing(dead).unwrap().index();

    run_cycle(&engine);
    assert!(engine.region_containing(live).unwrap().is_humongous());
    let region = engine.heap().regions().at(dead_region).unwrap();
    assert!(region.is_free());
}
