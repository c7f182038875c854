//! Work-stealing task queues for parallel marking.
//!
//! [`GenericTaskQueue`] is a bounded ring buffer owned by one worker. The
//! owner pushes and pops at `bottom` (LIFO); thieves take from `top` (FIFO).
//! `top` lives inside an [`Age`] together with a tag that is bumped whenever
//! the owner resets or `top` wraps, so a thief that read a stale age can
//! never win its compare-and-swap (the ABA problem).
//!
//! The buffer keeps two slots unused: with `N` slots the queue holds at most
//! `N - 2` elements, and a computed size of `N - 1` means "empty" (the
//! transient state after the owner and a thief race for the last element).

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::oop::Address;

/// Queue slots hold elements encoded as `u64`.
pub trait TaskElement: Copy + Send + Sync + 'static {
    /// Encode into a slot.
    fn encode(self) -> u64;
    /// Decode a slot written by [`TaskElement::encode`].
    fn decode(bits: u64) -> Self;
}

macro_rules! impl_task_element {
    ($($ty:ty),*) => {
        $(
            impl TaskElement for $ty {
                #[inline]
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                fn encode(self) -> u64 {
                    self as u64
                }

                #[inline]
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                fn decode(bits: u64) -> Self {
                    bits as $ty
                }
            }
        )*
    };
}

impl_task_element!(u32, u64, usize, i32, i64);

/// A unit of marking work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarkTaskEntry {
    /// A marked object whose fields still have to be scanned.
    Object(Address),
    /// Continuation of a reference array: the address of the first element
    /// still to be scanned.
    ArraySlice(Address),
}

impl TaskElement for MarkTaskEntry {
    #[inline]
    fn encode(self) -> u64 {
        match self {
            Self::Object(addr) => addr.as_usize() as u64,
            Self::ArraySlice(addr) => addr.as_usize() as u64 | 1,
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn decode(bits: u64) -> Self {
        let addr = Address::new((bits & !1) as usize);
        if bits & 1 == 0 {
            Self::Object(addr)
        } else {
            Self::ArraySlice(addr)
        }
    }
}

/// `top` index plus ABA tag, packed into one `u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Age {
    top: u32,
    tag: u32,
}

impl Age {
    const fn new(top: u32, tag: u32) -> Self {
        Self { top, tag }
    }

    const fn pack(self) -> u64 {
        (self.tag as u64) << 32 | self.top as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn unpack(bits: u64) -> Self {
        Self {
            top: bits as u32,
            tag: (bits >> 32) as u32,
        }
    }

    /// Current top index.
    #[must_use]
    pub const fn top(self) -> u32 {
        self.top
    }

    /// Current tag.
    #[must_use]
    pub const fn tag(self) -> u32 {
        self.tag
    }

    /// Advance `top` by one in a ring of `n` slots, bumping the tag on wrap.
    #[allow(clippy::cast_possible_truncation)]
    const fn increment(self, n: usize) -> Self {
        let top = ((self.top as usize + 1) & (n - 1)) as u32;
        let tag = if top == 0 {
            self.tag.wrapping_add(1)
        } else {
            self.tag
        };
        Self { top, tag }
    }
}

/// Bounded single-owner work-stealing queue with `N` slots.
pub struct GenericTaskQueue<E: TaskElement, const N: usize> {
    bottom: CachePadded<AtomicUsize>,
    age: CachePadded<AtomicU64>,
    elems: Box<[AtomicU64]>,
    _marker: std::marker::PhantomData<E>,
}

impl<E: TaskElement, const N: usize> GenericTaskQueue<E, N> {
    const MOD_N_MASK: usize = N - 1;

    /// Create an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of two of at least 4, or exceeds `u32` range.
    #[must_use]
    pub fn new() -> Self {
        assert!(
            N.is_power_of_two() && N >= 4,
            "task queue size must be a power of two >= 4"
        );
        assert!(u32::try_from(N).is_ok(), "task queue size exceeds u32 range");
        Self {
            bottom: CachePadded::new(AtomicUsize::new(0)),
            age: CachePadded::new(AtomicU64::new(0)),
            elems: (0..N).map(|_| AtomicU64::new(0)).collect(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Maximum number of elements the queue holds.
    #[must_use]
    pub const fn max_elems() -> usize {
        N - 2
    }

    #[inline]
    const fn increment_index(index: usize) -> usize {
        (index + 1) & Self::MOD_N_MASK
    }

    #[inline]
    const fn decrement_index(index: usize) -> usize {
        index.wrapping_sub(1) & Self::MOD_N_MASK
    }

    /// Distance from `top` to `bot`, including the "empty" value `N - 1`.
    #[inline]
    const fn dirty_size(bot: usize, top: usize) -> usize {
        bot.wrapping_sub(top) & Self::MOD_N_MASK
    }

    /// Real size: a dirty size of `N - 1` is folded to zero.
    #[inline]
    const fn size_of(bot: usize, top: usize) -> usize {
        let n = Self::dirty_size(bot, top);
        if n == N - 1 {
            0
        } else {
            n
        }
    }

    #[inline]
    fn load_age(&self) -> Age {
        Age::unpack(self.age.load(Ordering::Acquire))
    }

    #[inline]
    fn cas_age(&self, old: Age, new: Age) -> Age {
        match self.age.compare_exchange(
            old.pack(),
            new.pack(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => old,
            Err(current) => Age::unpack(current),
        }
    }

    /// Current age; exposed for inspection in tests.
    #[must_use]
    pub fn age(&self) -> Age {
        self.load_age()
    }

    /// Approximate number of elements; exact when called by the owner with
    /// no thief active.
    #[must_use]
    pub fn size(&self) -> usize {
        Self::size_of(
            self.bottom.load(Ordering::Acquire),
            self.load_age().top as usize,
        )
    }

    /// Whether the queue appears empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Push onto the bottom. Owner only.
    ///
    /// Returns `false` if the queue already holds `N - 2` elements.
    pub fn push(&self, t: E) -> bool {
        let local_bot = self.bottom.load(Ordering::Relaxed);
        let top = self.load_age().top as usize;
        let dirty_n = Self::dirty_size(local_bot, top);
        debug_assert!(dirty_n < N, "queue index out of range");
        if dirty_n < Self::max_elems() {
            self.elems[local_bot].store(t.encode(), Ordering::Relaxed);
            self.bottom
                .store(Self::increment_index(local_bot), Ordering::Release);
            return true;
        }
        self.push_slow(t, dirty_n)
    }

    fn push_slow(&self, t: E, dirty_n: usize) -> bool {
        if dirty_n == N - 1 {
            // Actually empty: an owner pop and a thief raced for the last
            // element and left bottom one below top.
            let local_bot = self.bottom.load(Ordering::Relaxed);
            self.elems[local_bot].store(t.encode(), Ordering::Relaxed);
            self.bottom
                .store(Self::increment_index(local_bot), Ordering::Release);
            return true;
        }
        false
    }

    /// Pop from the bottom. Owner only.
    pub fn pop_local(&self) -> Option<E> {
        let mut local_bot = self.bottom.load(Ordering::Relaxed);
        let dirty_n = Self::dirty_size(local_bot, self.load_age().top as usize);
        debug_assert!(dirty_n != N - 1, "owner sees a transiently empty queue");
        if dirty_n == 0 {
            return None;
        }
        local_bot = Self::decrement_index(local_bot);
        self.bottom.store(local_bot, Ordering::Relaxed);
        // The decremented bottom must be visible before top is read, or a
        // thief and the owner could both take the last element.
        fence(Ordering::SeqCst);
        let t = E::decode(self.elems[local_bot].load(Ordering::Relaxed));
        let top = self.load_age().top as usize;
        if Self::size_of(local_bot, top) > 0 {
            debug_assert!(Self::dirty_size(local_bot, top) != N - 1);
            return Some(t);
        }
        // Zero or one element left: race thieves for it.
        if self.pop_local_slow(local_bot, self.load_age()) {
            Some(t)
        } else {
            None
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn pop_local_slow(&self, local_bot: usize, old_age: Age) -> bool {
        // Either this pop takes the last element, or a thief already did.
        // In both cases the queue ends up empty with top == bottom, and the
        // tag is bumped so in-flight thieves fail their CAS.
        let new_age = Age::new(local_bot as u32, old_age.tag.wrapping_add(1));
        if local_bot == old_age.top as usize && self.cas_age(old_age, new_age) == old_age {
            return true;
        }
        self.age.store(new_age.pack(), Ordering::Release);
        false
    }

    /// Steal from the top. Any thread.
    pub fn pop_global(&self) -> Option<E> {
        let old_age = self.load_age();
        fence(Ordering::SeqCst);
        let local_bot = self.bottom.load(Ordering::Acquire);
        if Self::size_of(local_bot, old_age.top as usize) == 0 {
            return None;
        }
        let t = E::decode(self.elems[old_age.top as usize].load(Ordering::Relaxed));
        let new_age = old_age.increment(N);
        if self.cas_age(old_age, new_age) == old_age {
            Some(t)
        } else {
            None
        }
    }

    /// Reset to empty. Owner only, with no thief active.
    pub fn set_empty(&self) {
        self.bottom.store(0, Ordering::Relaxed);
        self.age.store(0, Ordering::Release);
    }
}

impl<E: TaskElement, const N: usize> Default for GenericTaskQueue<E, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TaskElement, const N: usize> std::fmt::Debug for GenericTaskQueue<E, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericTaskQueue")
            .field("capacity", &N)
            .field("size", &self.size())
            .field("age", &self.load_age())
            .finish_non_exhaustive()
    }
}

/// A task queue backed by an unbounded owner-private overflow stack.
///
/// `push` never fails: elements that do not fit in the bounded queue go to
/// the overflow stack. Overflow entries cannot be stolen.
pub struct OverflowTaskQueue<E: TaskElement, const N: usize> {
    queue: GenericTaskQueue<E, N>,
    overflow: Mutex<Vec<E>>,
    overflow_len: AtomicUsize,
}

impl<E: TaskElement, const N: usize> OverflowTaskQueue<E, N> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: GenericTaskQueue::new(),
            overflow: Mutex::new(Vec::new()),
            overflow_len: AtomicUsize::new(0),
        }
    }

    /// The bounded part of the queue.
    #[must_use]
    pub const fn taskqueue(&self) -> &GenericTaskQueue<E, N> {
        &self.queue
    }

    /// Push, spilling to the overflow stack when the bounded queue is full.
    pub fn push(&self, t: E) {
        if !self.queue.push(t) {
            self.push_overflow(t);
        }
    }

    /// Push directly onto the overflow stack.
    pub fn push_overflow(&self, t: E) {
        self.overflow.lock().push(t);
        self.overflow_len.fetch_add(1, Ordering::Release);
    }

    /// Pop from the overflow stack.
    pub fn pop_overflow(&self) -> Option<E> {
        let t = self.overflow.lock().pop();
        if t.is_some() {
            self.overflow_len.fetch_sub(1, Ordering::Release);
        }
        t
    }

    /// Pop from the bounded queue. Owner only.
    pub fn pop_local(&self) -> Option<E> {
        self.queue.pop_local()
    }

    /// Steal from the bounded queue.
    pub fn pop_global(&self) -> Option<E> {
        self.queue.pop_global()
    }

    /// Number of entries on the overflow stack.
    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.overflow_len.load(Ordering::Acquire)
    }

    /// Whether the overflow stack is empty.
    #[must_use]
    pub fn overflow_empty(&self) -> bool {
        self.overflow_len() == 0
    }

    /// Whether both parts are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.overflow_empty()
    }

    /// Discard everything. Owner only, with no thief active.
    ///
    /// Returns the number of overflow entries dropped.
    pub fn clear(&self) -> usize {
        self.queue.set_empty();
        let dropped = {
            let mut overflow = self.overflow.lock();
            let n = overflow.len();
            overflow.clear();
            n
        };
        self.overflow_len.store(0, Ordering::Release);
        dropped
    }
}

impl<E: TaskElement, const N: usize> Default for OverflowTaskQueue<E, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A queue that thieves can take from.
pub trait StealableQueue: Send + Sync {
    /// Element type.
    type Element: TaskElement;

    /// Number of stealable elements.
    fn size(&self) -> usize;

    /// Steal one element.
    fn pop_global(&self) -> Option<Self::Element>;
}

impl<E: TaskElement, const N: usize> StealableQueue for GenericTaskQueue<E, N> {
    type Element = E;

    fn size(&self) -> usize {
        Self::size(self)
    }

    fn pop_global(&self) -> Option<E> {
        Self::pop_global(self)
    }
}

impl<E: TaskElement, const N: usize> StealableQueue for OverflowTaskQueue<E, N> {
    type Element = E;

    fn size(&self) -> usize {
        self.queue.size()
    }

    fn pop_global(&self) -> Option<E> {
        self.queue.pop_global()
    }
}

/// Anything the terminator can peek for outstanding work.
pub trait PeekableQueues: Send + Sync {
    /// Whether any queue holds stealable work.
    fn peek(&self) -> bool;
}

/// Park-Miller minimal standard generator (Schrage's method).
///
/// Updates `seed` and returns the new value, always in `1..=2^31-2`.
pub fn park_miller_random(seed: &mut i32) -> i32 {
    const A: i64 = 16807;
    const M: i64 = 2_147_483_647;
    const Q: i64 = 127_773;
    const R: i64 = 2836;

    let s = i64::from(*seed);
    let hi = s / Q;
    let lo = s % Q;
    let mut next = A * lo - R * hi;
    if next <= 0 {
        next += M;
    }
    #[allow(clippy::cast_possible_truncation)]
    let next = next as i32;
    *seed = next;
    next
}

/// Initial steal seed for every worker.
pub const INITIAL_STEAL_SEED: i32 = 17;

/// The per-worker queues of one parallel phase.
pub struct TaskQueueSet<Q> {
    queues: Vec<Q>,
}

impl<Q: StealableQueue> TaskQueueSet<Q> {
    /// Build a set of `n` queues.
    pub fn new(n: usize, mut make: impl FnMut() -> Q) -> Self {
        Self {
            queues: (0..n).map(|_| make()).collect(),
        }
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether the set has no queues.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue `index`.
    #[must_use]
    pub fn queue(&self, index: usize) -> &Q {
        &self.queues[index]
    }

    /// All queues.
    pub fn iter(&self) -> std::slice::Iter<'_, Q> {
        self.queues.iter()
    }

    /// Total stealable elements across the set.
    #[must_use]
    pub fn tasks(&self) -> usize {
        self.queues.iter().map(StealableQueue::size).sum()
    }

    /// Try to steal for worker `queue_num`, making up to `2 * n` attempts.
    pub fn steal(&self, queue_num: usize, seed: &mut i32) -> Option<Q::Element> {
        let attempts = 2 * self.queues.len();
        (0..attempts).find_map(|_| self.steal_best_of_2(queue_num, seed))
    }

    /// Pick two random victims other than `queue_num` and steal from the
    /// fuller one.
    #[allow(clippy::cast_sign_loss)]
    pub fn steal_best_of_2(&self, queue_num: usize, seed: &mut i32) -> Option<Q::Element> {
        let n = self.queues.len();
        match n {
            0 | 1 => None,
            2 => self.queues[(queue_num + 1) % 2].pop_global(),
            _ => {
                let mut k1 = queue_num;
                while k1 == queue_num {
                    k1 = park_miller_random(seed) as usize % n;
                }
                let mut k2 = queue_num;
                while k2 == queue_num || k2 == k1 {
                    k2 = park_miller_random(seed) as usize % n;
                }
                let victim = if self.queues[k2].size() > self.queues[k1].size() {
                    k2
                } else {
                    k1
                };
                self.queues[victim].pop_global()
            }
        }
    }
}

impl<Q: StealableQueue> PeekableQueues for TaskQueueSet<Q> {
    fn peek(&self) -> bool {
        self.queues.iter().any(|q| q.size() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    type SmallQueue = GenericTaskQueue<u64, 16>;

    #[test]
    fn test_owner_pops_lifo() {
        let q = SmallQueue::new();
        for i in 1..=5 {
            assert!(q.push(i));
        }
        assert_eq!(q.size(), 5);
        let popped: Vec<_> = std::iter::from_fn(|| q.pop_local()).collect();
        assert_eq!(popped, vec![5, 4, 3, 2, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_thief_steals_fifo() {
        let q = SmallQueue::new();
        for i in 1..=5 {
            assert!(q.push(i));
        }
        let stolen: Vec<_> = std::iter::from_fn(|| q.pop_global()).collect();
        assert_eq!(stolen, vec![1, 2, 3, 4, 5]);
        assert_eq!(q.pop_local(), None);
    }

    #[test]
    fn test_capacity_is_n_minus_two() {
        let q = SmallQueue::new();
        for i in 0..SmallQueue::max_elems() as u64 {
            assert!(q.push(i), "push {i} should fit");
        }
        assert!(!q.push(99));
        assert_eq!(q.size(), 14);
    }

    #[test]
    fn test_pop_last_element_bumps_tag() {
        let q = SmallQueue::new();
        q.push(7);
        let before = q.age();
        assert_eq!(q.pop_local(), Some(7));
        let after = q.age();
        assert_eq!(after.tag(), before.tag() + 1);
        assert!(q.is_empty());
        // The queue is reusable after the reset.
        q.push(8);
        assert_eq!(q.pop_global(), Some(8));
    }

    #[test]
    fn test_top_wrap_bumps_tag() {
        let q = SmallQueue::new();
        for round in 0..3u64 {
            for i in 0..10 {
                assert!(q.push(round * 100 + i));
            }
            for i in 0..10 {
                assert_eq!(q.pop_global(), Some(round * 100 + i));
            }
        }
        // 30 steals over a 16-slot ring wrapped top once.
        assert!(q.age().tag() >= 1);
    }

    #[test]
    fn test_overflow_queue_never_loses_elements() {
        let q: OverflowTaskQueue<u64, 16> = OverflowTaskQueue::new();
        let count = GenericTaskQueue::<u64, 16>::max_elems() as u64 + 5;
        for i in 0..count {
            q.push(i);
        }
        assert_eq!(q.overflow_len(), 5);

        let mut seen = HashSet::new();
        while let Some(t) = q.pop_local().or_else(|| q.pop_overflow()) {
            assert!(seen.insert(t));
        }
        assert_eq!(seen.len() as u64, count);
        assert!(q.is_empty());
    }

    #[test]
    fn test_mark_task_entry_encoding() {
        let addr = Address::new(0x7f00_0000_1000);
        for entry in [MarkTaskEntry::Object(addr), MarkTaskEntry::ArraySlice(addr)] {
            assert_eq!(MarkTaskEntry::decode(entry.encode()), entry);
        }
    }

    #[test]
    fn test_park_miller_sequence() {
        let mut seed = INITIAL_STEAL_SEED;
        assert_eq!(park_miller_random(&mut seed), 16807 * 17);
        for _ in 0..1000 {
            let v = park_miller_random(&mut seed);
            assert!(v > 0);
        }
    }

    #[test]
    fn test_steal_with_one_queue_fails() {
        let set = TaskQueueSet::new(1, SmallQueue::new);
        set.queue(0).push(1);
        let mut seed = INITIAL_STEAL_SEED;
        assert_eq!(set.steal(0, &mut seed), None);
    }

    #[test]
    fn test_steal_with_two_queues_takes_other() {
        let set = TaskQueueSet::new(2, SmallQueue::new);
        set.queue(1).push(42);
        let mut seed = INITIAL_STEAL_SEED;
        assert_eq!(set.steal(0, &mut seed), Some(42));
        assert_eq!(set.steal(0, &mut seed), None);
        assert!(!set.peek());
    }

    #[test]
    fn test_steal_never_picks_own_queue() {
        let set = TaskQueueSet::new(4, SmallQueue::new);
        set.queue(2).push(5);
        let mut seed = INITIAL_STEAL_SEED;
        assert_eq!(set.steal(2, &mut seed), None);
        assert_eq!(set.steal(0, &mut seed), Some(5));
    }

    #[test]
    fn test_concurrent_owner_and_thieves_take_each_element_once() {
        const ITEMS: u64 = 20_000;
        let q = Arc::new(GenericTaskQueue::<u64, 64>::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while !done.load(Ordering::Acquire) || !q.is_empty() {
                        if let Some(t) = q.pop_global() {
                            got.push(t);
                        }
                    }
                    got
                })
            })
            .collect();

        let mut mine = Vec::new();
        let mut next = 0;
        while next < ITEMS {
            if q.push(next) {
                next += 1;
            } else if let Some(t) = q.pop_local() {
                mine.push(t);
            }
        }
        while let Some(t) = q.pop_local() {
            mine.push(t);
        }
        done.store(true, Ordering::Release);

        let mut all: Vec<u64> = mine;
        for t in thieves {
            all.extend(t.join().unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
    }
}
