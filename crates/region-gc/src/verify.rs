//! Marking verification against a single-threaded reference trace.

use std::collections::HashSet;

use crate::gc::mark::MarkBitmap;
use crate::heap::Heap;
use crate::oop::{Address, HeapWord};
use crate::roots::{RootClosures, RootEnumerator, RootParity, SoftRefPolicy};

/// Every object reachable from the strong roots, found by a depth-first
/// walk with an explicit stack.
///
/// Uses one root enumeration pass, so it advances `parity`.
pub fn reference_trace<R: RootEnumerator + ?Sized>(
    heap: &Heap,
    roots: &R,
    parity: &RootParity,
    soft: SoftRefPolicy,
) -> HashSet<Address> {
    let mut reachable = HashSet::new();
    let mut stack = Vec::new();
    let mut visit = |slot: &HeapWord| {
        if let Some(obj) = slot.load_ref() {
            stack.push(obj);
        }
    };
    roots.process_roots(parity.advance(), soft, &mut RootClosures::strong(&mut visit));

    while let Some(obj) = stack.pop() {
        if !reachable.insert(obj) {
            continue;
        }
        for slot in heap.obj(obj).all_ref_slots() {
            if let Some(referent) = slot.load_ref() {
                if !reachable.contains(&referent) {
                    stack.push(referent);
                }
            }
        }
    }
    reachable
}

/// Reachable objects a marking failed to account for.
///
/// An object counts as accounted for if it is marked in `bitmap` or lies at
/// or above its region's TAMS for the marking in progress.
#[must_use]
pub fn unmarked_reachable(
    heap: &Heap,
    bitmap: &MarkBitmap,
    reachable: &HashSet<Address>,
) -> Vec<Address> {
    let mut missing: Vec<Address> = reachable
        .iter()
        .copied()
        .filter(|&obj| {
            !heap.region_of(obj).obj_allocated_since_next_marking(obj) && !bitmap.is_marked(obj)
        })
        .collect();
    missing.sort_unstable();
    missing
}

/// Assert that every reachable object is accounted for.
///
/// # Panics
///
/// Panics, listing the first few offenders, if any reachable object below
/// TAMS is unmarked.
pub fn verify_marking(heap: &Heap, bitmap: &MarkBitmap, reachable: &HashSet<Address>) {
    let missing = unmarked_reachable(heap, bitmap, reachable);
    assert!(
        missing.is_empty(),
        "marking missed {} reachable objects, first: {:?}",
        missing.len(),
        &missing[..missing.len().min(8)]
    );
}
