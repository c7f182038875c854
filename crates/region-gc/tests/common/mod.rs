//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use region_gc::gc::worklist::park_miller_random;
use region_gc::{Address, GcConfig, GcEngine, ObjectShape, RootHandle, RootKind};

/// Reference fields per graph node.
pub const NODE_REFS: u32 = 3;

/// Node shape: `NODE_REFS` references and one primitive holding the node id.
pub const NODE: ObjectShape = ObjectShape::Instance {
    refs: NODE_REFS,
    prims: 1,
};

/// A small heap that grows on demand without collecting.
pub fn roomy_config(workers: usize) -> GcConfig {
    GcConfig::default()
        .with_region_bytes(64 * 1024)
        .with_heap_bytes(256 * 1024, 16 << 20)
        .with_parallel_workers(workers)
        .with_verify_marking(true)
}

/// Deterministic generator over the collector's own Park-Miller sequence.
pub struct Rng(i32);

impl Rng {
    pub fn new(seed: i32) -> Self {
        Self(seed.max(1))
    }

    pub fn below(&mut self, n: usize) -> usize {
        park_miller_random(&mut self.0) as usize % n
    }
}

/// A random graph of `n` nodes, the first `roots` of which are rooted.
///
/// Returns node addresses in allocation order; the heap must be large
/// enough that no allocation compacts.
pub fn build_random_graph(engine: &GcEngine, seed: i32, n: usize, roots: usize) -> Vec<Address> {
    let mut rng = Rng::new(seed);
    let nodes: Vec<Address> = (0..n)
        .map(|id| {
            let node = engine.allocate(NODE).expect("graph fits the heap");
            engine.write_prim(node, 0, id);
            node
        })
        .collect();
    for &node in &nodes {
        for field in 0..NODE_REFS as usize {
            if rng.below(4) != 0 {
                let target = nodes[rng.below(n)];
                engine.write_ref(node, field, Some(target));
            }
        }
    }
    for _ in 0..roots {
        let kind = if rng.below(2) == 0 {
            RootKind::ThreadStack
        } else {
            RootKind::Static
        };
        engine.roots().add(kind, Some(nodes[rng.below(n)]));
    }
    nodes
}

/// A chain of `n` nodes held by one root; returns the root handle.
pub fn build_rooted_chain(engine: &GcEngine, n: usize) -> RootHandle {
    let root = engine.roots().add(RootKind::ThreadStack, None);
    for id in (0..n).rev() {
        let node = engine.allocate(NODE).expect("chain fits the heap");
        engine.write_prim(node, 0, id);
        engine.write_ref(node, 0, engine.roots().get(root));
        engine.roots().set(root, Some(node));
    }
    root
}

/// Node id to ids of its referents, for every reachable node.
pub fn id_graph(engine: &GcEngine) -> HashMap<usize, Vec<Option<usize>>> {
    engine
        .reachable_objects()
        .into_iter()
        .map(|node| {
            let targets = (0..NODE_REFS as usize)
                .map(|f| engine.read_ref(node, f).map(|t| engine.read_prim(t, 0)))
                .collect();
            (engine.read_prim(node, 0), targets)
        })
        .collect()
}
