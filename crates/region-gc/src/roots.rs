//! Root enumeration.
//!
//! Roots are slots outside the heap that hold references into it. The
//! collector visits them through a [`RootEnumerator`], possibly from several
//! workers at once; each root group is claimed by exactly one worker per
//! enumeration pass using a parity value that changes between passes.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::oop::{Address, HeapWord};

/// Visits one reference slot.
pub trait OopClosure {
    /// Process the slot. The closure may overwrite it.
    fn do_oop(&mut self, slot: &HeapWord);
}

impl<F: FnMut(&HeapWord)> OopClosure for F {
    fn do_oop(&mut self, slot: &HeapWord) {
        self(slot);
    }
}

/// How soft references are treated by a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftRefPolicy {
    /// Soft references keep their referents alive.
    KeepAlive,
    /// Soft references are weak and cleared when their referent dies.
    ClearAll,
}

/// Closures handed to a root enumeration pass.
pub struct RootClosures<'a> {
    /// Strong roots.
    pub strong: &'a mut dyn OopClosure,
    /// Code roots; visited with `strong` when `None`.
    pub code: Option<&'a mut dyn OopClosure>,
    /// Weak roots; skipped when `None`.
    pub weak: Option<&'a mut dyn OopClosure>,
}

impl<'a> RootClosures<'a> {
    /// Visit every strong root with `strong`, skipping weak roots.
    pub fn strong(strong: &'a mut dyn OopClosure) -> Self {
        Self {
            strong,
            code: None,
            weak: None,
        }
    }
}

/// Source of roots for the collector.
pub trait RootEnumerator: Send + Sync {
    /// Visit the root groups this caller claims for pass `parity`.
    ///
    /// Several workers may call this concurrently with the same parity;
    /// each group is visited by exactly one of them.
    fn process_roots(&self, parity: u32, soft: SoftRefPolicy, closures: &mut RootClosures<'_>);

    /// Visit every weak root serially.
    ///
    /// Under [`SoftRefPolicy::ClearAll`] soft references are included.
    fn process_weak_roots(&self, soft: SoftRefPolicy, closure: &mut dyn OopClosure);
}

/// Source of fresh parity values, cycling through `1, 2, 1, 2, ...`.
#[derive(Debug)]
pub struct RootParity {
    current: AtomicU32,
}

impl RootParity {
    /// Parity before the first pass.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(0),
        }
    }

    /// Start a new enumeration pass and return its parity.
    pub fn advance(&self) -> u32 {
        let next = if self.current.load(Ordering::Acquire) == 1 {
            2
        } else {
            1
        };
        self.current.store(next, Ordering::Release);
        next
    }

    /// Parity of the current pass.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }
}

impl Default for RootParity {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-group claim word. A group belongs to the worker whose CAS moves it
/// to the current parity.
#[derive(Debug, Default)]
pub struct ParityClaim {
    claimed: AtomicU32,
}

impl ParityClaim {
    /// Try to claim for `parity`; `true` for exactly one caller per pass.
    pub fn try_claim(&self, parity: u32) -> bool {
        let mut stored = self.claimed.load(Ordering::Acquire);
        loop {
            if stored == parity {
                return false;
            }
            match self.claimed.compare_exchange(
                stored,
                parity,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => stored = current,
            }
        }
    }
}

/// Root groups kept by [`RootSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// Thread stack slots.
    ThreadStack,
    /// Static fields.
    Static,
    /// References embedded in compiled code.
    CodeCache,
    /// Interned-string table; weak.
    StringTable,
    /// Soft references; strong or weak per [`SoftRefPolicy`].
    SoftReference,
}

impl RootKind {
    const ALL: [Self; 5] = [
        Self::ThreadStack,
        Self::Static,
        Self::CodeCache,
        Self::StringTable,
        Self::SoftReference,
    ];

    const fn slot(self) -> usize {
        match self {
            Self::ThreadStack => 0,
            Self::Static => 1,
            Self::CodeCache => 2,
            Self::StringTable => 3,
            Self::SoftReference => 4,
        }
    }
}

/// Identifies one root slot in a [`RootSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootHandle {
    kind: RootKind,
    index: usize,
}

impl RootHandle {
    /// Group of the slot.
    #[must_use]
    pub const fn kind(&self) -> RootKind {
        self.kind
    }
}

#[derive(Default)]
struct RootGroup {
    slots: RwLock<Vec<HeapWord>>,
    free: Mutex<Vec<usize>>,
    claim: ParityClaim,
}

impl RootGroup {
    fn visit(&self, closure: &mut dyn OopClosure) {
        for slot in self.slots.read().iter() {
            if slot.load_ref().is_some() {
                closure.do_oop(slot);
            }
        }
    }
}

/// A registry of root slots grouped by [`RootKind`].
///
/// The default root source of [`GcEngine`](crate::GcEngine).
#[derive(Default)]
pub struct RootSet {
    groups: [RootGroup; 5],
}

impl RootSet {
    /// An empty root set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, kind: RootKind) -> &RootGroup {
        &self.groups[kind.slot()]
    }

    /// Register a root slot holding `value`.
    pub fn add(&self, kind: RootKind, value: Option<Address>) -> RootHandle {
        let group = self.group(kind);
        let reused = group.free.lock().pop();
        let mut slots = group.slots.write();
        let index = if let Some(index) = reused {
            slots[index].store_ref(value);
            index
        } else {
            slots.push(HeapWord::new(value.map_or(0, Address::as_usize)));
            slots.len() - 1
        };
        RootHandle { kind, index }
    }

    /// Current value of a root.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Option<Address> {
        self.group(handle.kind).slots.read()[handle.index].load_ref()
    }

    /// Overwrite a root.
    pub fn set(&self, handle: RootHandle, value: Option<Address>) {
        self.group(handle.kind).slots.read()[handle.index].store_ref(value);
    }

    /// Unregister a root. The handle must not be used afterwards.
    pub fn remove(&self, handle: RootHandle) {
        let group = self.group(handle.kind);
        group.slots.read()[handle.index].store_ref(None);
        group.free.lock().push(handle.index);
    }

    /// Number of live (registered) slots in `kind`.
    #[must_use]
    pub fn len(&self, kind: RootKind) -> usize {
        let group = self.group(kind);
        group.slots.read().len() - group.free.lock().len()
    }

    /// Whether no slot is registered in any group.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        RootKind::ALL.iter().all(|&kind| self.len(kind) == 0)
    }
}

impl RootEnumerator for RootSet {
    fn process_roots(&self, parity: u32, soft: SoftRefPolicy, closures: &mut RootClosures<'_>) {
        for kind in RootKind::ALL {
            let group = self.group(kind);
            let weak_soft = kind == RootKind::SoftReference && soft == SoftRefPolicy::ClearAll;
            if (kind == RootKind::StringTable || weak_soft) && closures.weak.is_none() {
                continue;
            }
            if !group.claim.try_claim(parity) {
                continue;
            }
            match kind {
                RootKind::ThreadStack | RootKind::Static => group.visit(closures.strong),
                RootKind::CodeCache => match closures.code.as_mut() {
                    Some(code) => group.visit(&mut **code),
                    None => group.visit(closures.strong),
                },
                RootKind::SoftReference if !weak_soft => group.visit(closures.strong),
                RootKind::StringTable | RootKind::SoftReference => {
                    if let Some(weak) = closures.weak.as_mut() {
                        group.visit(&mut **weak);
                    }
                }
            }
        }
    }

    fn process_weak_roots(&self, soft: SoftRefPolicy, closure: &mut dyn OopClosure) {
        self.group(RootKind::StringTable).visit(closure);
        if soft == SoftRefPolicy::ClearAll {
            self.group(RootKind::SoftReference).visit(closure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn addr(n: usize) -> Option<Address> {
        Some(Address::new(n * 8))
    }

    #[test]
    fn test_parity_cycles() {
        let p = RootParity::new();
        assert_eq!(p.advance(), 1);
        assert_eq!(p.advance(), 2);
        assert_eq!(p.advance(), 1);
        assert_eq!(p.current(), 1);
    }

    #[test]
    fn test_claim_once_per_parity() {
        let claim = ParityClaim::default();
        assert!(claim.try_claim(1));
        assert!(!claim.try_claim(1));
        assert!(claim.try_claim(2));
        assert!(!claim.try_claim(2));
    }

    #[test]
    fn test_handles_add_get_set_remove() {
        let roots = RootSet::new();
        let h = roots.add(RootKind::Static, addr(1));
        assert_eq!(roots.get(h), addr(1));
        roots.set(h, addr(2));
        assert_eq!(roots.get(h), addr(2));
        roots.remove(h);
        assert_eq!(roots.len(RootKind::Static), 0);
        let h2 = roots.add(RootKind::Static, addr(3));
        assert_eq!(h2, h, "freed slot is reused");
        assert!(!roots.is_empty());
    }

    #[test]
    fn test_soft_policy_routes_soft_roots() {
        let roots = RootSet::new();
        roots.add(RootKind::ThreadStack, addr(1));
        roots.add(RootKind::StringTable, addr(2));
        roots.add(RootKind::SoftReference, addr(3));
        let parity = RootParity::new();

        let mut strong = Vec::new();
        let mut weak = Vec::new();
        let mut s = |slot: &HeapWord| strong.push(slot.load_ref());
        let mut w = |slot: &HeapWord| weak.push(slot.load_ref());
        roots.process_roots(
            parity.advance(),
            SoftRefPolicy::KeepAlive,
            &mut RootClosures {
                strong: &mut s,
                code: None,
                weak: Some(&mut w),
            },
        );
        assert_eq!(strong, vec![addr(1), addr(3)]);
        assert_eq!(weak, vec![addr(2)]);

        let mut seen = Vec::new();
        roots.process_weak_roots(SoftRefPolicy::ClearAll, &mut |slot: &HeapWord| {
            seen.push(slot.load_ref());
        });
        assert_eq!(seen, vec![addr(2), addr(3)]);
    }

    #[test]
    fn test_parallel_enumeration_visits_each_root_once() {
        let roots = Arc::new(RootSet::new());
        for i in 1..=100 {
            roots.add(RootKind::ThreadStack, addr(i));
            roots.add(RootKind::Static, addr(i + 1000));
            roots.add(RootKind::CodeCache, addr(i + 2000));
        }
        let parity = RootParity::new();
        for _ in 0..3 {
            let p = parity.advance();
            let visited = Arc::new(AtomicUsize::new(0));
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let roots = Arc::clone(&roots);
                    let visited = Arc::clone(&visited);
                    thread::spawn(move || {
                        let mut count = |_: &HeapWord| {
                            visited.fetch_add(1, Ordering::Relaxed);
                        };
                        roots.process_roots(
                            p,
                            SoftRefPolicy::KeepAlive,
                            &mut RootClosures::strong(&mut count),
                        );
                    })
                })
                .collect();
            for w in workers {
                w.join().unwrap();
            }
            assert_eq!(visited.load(Ordering::Relaxed), 300);
        }
    }
}
