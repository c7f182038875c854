//! Mark and card bitmaps.
//!
//! [`AtomicBitmap`] is a fixed-size bit vector over atomic words. Every
//! mutation goes through an atomic primitive, so concurrent markers may set
//! bits in the same word. [`MarkBitmap`] maps heap addresses onto an
//! `AtomicBitmap` with one bit per heap word.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::oop::{Address, LOG_WORD_SIZE};

const BITS_PER_WORD: usize = 64;

/// Ranges of at most this many bits are set bit-by-bit.
pub const SMALL_RANGE_BITS: usize = 8;

#[inline]
const fn word_index(bit: usize) -> usize {
    bit / BITS_PER_WORD
}

#[inline]
const fn bit_mask(bit: usize) -> u64 {
    1u64 << (bit % BITS_PER_WORD)
}

/// Mask of bits `[from, to)` within a single word (`to` may be 64).
#[inline]
const fn inner_mask(from: usize, to: usize) -> u64 {
    let high = if to == BITS_PER_WORD {
        u64::MAX
    } else {
        (1u64 << to) - 1
    };
    high & !((1u64 << from) - 1)
}

/// A fixed-size bitmap with atomic bit operations.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    size: usize,
}

impl AtomicBitmap {
    /// Create a cleared bitmap of `size` bits.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let words = (0..size.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, size }
    }

    /// Number of bits.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn check_index(&self, bit: usize) {
        assert!(bit < self.size, "bit {bit} out of bounds ({})", self.size);
    }

    #[inline]
    fn check_range(&self, start: usize, end: usize) {
        assert!(
            start <= end && end <= self.size,
            "bit range {start}..{end} out of bounds ({})",
            self.size
        );
    }

    /// Whether bit `bit` is set.
    #[must_use]
    pub fn at(&self, bit: usize) -> bool {
        self.check_index(bit);
        self.words[word_index(bit)].load(Ordering::Acquire) & bit_mask(bit) != 0
    }

    /// Set bit `bit`.
    pub fn set_bit(&self, bit: usize) {
        self.check_index(bit);
        self.words[word_index(bit)].fetch_or(bit_mask(bit), Ordering::AcqRel);
    }

    /// Clear bit `bit`.
    pub fn clear_bit(&self, bit: usize) {
        self.check_index(bit);
        self.words[word_index(bit)].fetch_and(!bit_mask(bit), Ordering::AcqRel);
    }

    /// Atomically set bit `bit`.
    ///
    /// Returns `true` only for the single caller that changed the bit from
    /// clear to set.
    pub fn par_set_bit(&self, bit: usize) -> bool {
        self.check_index(bit);
        let word = &self.words[word_index(bit)];
        let mask = bit_mask(bit);
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if old & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(old, old | mask, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// Atomically clear bit `bit`. Returns `true` if this call cleared it.
    pub fn par_clear_bit(&self, bit: usize) -> bool {
        self.check_index(bit);
        let mask = bit_mask(bit);
        self.words[word_index(bit)].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Set bits `[start, end)`.
    ///
    /// Ranges of at most [`SMALL_RANGE_BITS`] bits take a per-bit loop; longer
    /// ranges take the word-wise path. `atomic` selects read-modify-write on
    /// the edge words; interior words are stored whole either way.
    pub fn set_range(&self, start: usize, end: usize, atomic: bool) {
        self.check_range(start, end);
        if end - start <= SMALL_RANGE_BITS {
            for bit in start..end {
                if atomic {
                    self.par_set_bit(bit);
                } else {
                    self.set_bit(bit);
                }
            }
        } else {
            self.set_range_bulk(start, end, atomic);
        }
    }

    fn set_range_bulk(&self, start: usize, end: usize, atomic: bool) {
        if start == end {
            return;
        }
        let first = word_index(start);
        let last = word_index(end - 1);
        let or_into = |index: usize, mask: u64| {
            if atomic {
                self.words[index].fetch_or(mask, Ordering::AcqRel);
            } else {
                let word = &self.words[index];
                word.store(word.load(Ordering::Relaxed) | mask, Ordering::Release);
            }
        };

        if first == last {
            or_into(first, inner_mask(start % BITS_PER_WORD, (end - 1) % BITS_PER_WORD + 1));
            return;
        }
        or_into(first, inner_mask(start % BITS_PER_WORD, BITS_PER_WORD));
        for word in &self.words[first + 1..last] {
            word.store(u64::MAX, Ordering::Release);
        }
        or_into(last, inner_mask(0, (end - 1) % BITS_PER_WORD + 1));
    }

    /// Clear bits `[start, end)`.
    pub fn clear_range(&self, start: usize, end: usize) {
        self.check_range(start, end);
        if start == end {
            return;
        }
        let first = word_index(start);
        let last = word_index(end - 1);
        if first == last {
            let mask = inner_mask(start % BITS_PER_WORD, (end - 1) % BITS_PER_WORD + 1);
            self.words[first].fetch_and(!mask, Ordering::AcqRel);
            return;
        }
        self.words[first].fetch_and(
            !inner_mask(start % BITS_PER_WORD, BITS_PER_WORD),
            Ordering::AcqRel,
        );
        for word in &self.words[first + 1..last] {
            word.store(0, Ordering::Release);
        }
        self.words[last].fetch_and(
            !inner_mask(0, (end - 1) % BITS_PER_WORD + 1),
            Ordering::AcqRel,
        );
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Release);
        }
    }

    /// First set bit in `[from, to)`, or `to` if there is none.
    #[must_use]
    pub fn next_set_bit(&self, from: usize, to: usize) -> usize {
        self.check_range(from.min(to), to);
        if from >= to {
            return to;
        }
        let mut index = word_index(from);
        let mut bits = self.words[index].load(Ordering::Acquire) & !((1u64 << (from % BITS_PER_WORD)) - 1);
        let last = word_index(to - 1);
        loop {
            if bits != 0 {
                let found = index * BITS_PER_WORD + bits.trailing_zeros() as usize;
                return found.min(to);
            }
            if index == last {
                return to;
            }
            index += 1;
            bits = self.words[index].load(Ordering::Acquire);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Whether no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Set every bit that is set in `other`.
    ///
    /// # Panics
    ///
    /// Panics if the bitmaps differ in size.
    pub fn union_with(&self, other: &Self) {
        assert_eq!(self.size, other.size, "bitmap size mismatch");
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            let bits = src.load(Ordering::Acquire);
            if bits != 0 {
                dst.fetch_or(bits, Ordering::AcqRel);
            }
        }
    }

    /// Iterate the set bits in `[from, to)` in ascending order.
    pub fn iter_set(&self, from: usize, to: usize) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = from;
        std::iter::from_fn(move || {
            let bit = self.next_set_bit(cursor, to);
            if bit >= to {
                cursor = to;
                None
            } else {
                cursor = bit + 1;
                Some(bit)
            }
        })
    }
}

/// One mark bit per heap word over a contiguous covered range.
#[derive(Debug)]
pub struct MarkBitmap {
    bits: AtomicBitmap,
    covered_start: Address,
    covered_end: Address,
}

impl MarkBitmap {
    /// A cleared bitmap covering `[start, end)`.
    #[must_use]
    pub fn new(start: Address, end: Address) -> Self {
        Self {
            bits: AtomicBitmap::new(end.words_since(start)),
            covered_start: start,
            covered_end: end,
        }
    }

    /// Start of the covered range.
    #[must_use]
    pub const fn covered_start(&self) -> Address {
        self.covered_start
    }

    /// End of the covered range.
    #[must_use]
    pub const fn covered_end(&self) -> Address {
        self.covered_end
    }

    #[inline]
    fn addr_to_offset(&self, addr: Address) -> usize {
        assert!(
            addr >= self.covered_start && addr <= self.covered_end,
            "address {addr} outside bitmap range {}..{}",
            self.covered_start,
            self.covered_end
        );
        (addr.as_usize() - self.covered_start.as_usize()) >> LOG_WORD_SIZE
    }

    #[inline]
    const fn offset_to_addr(&self, offset: usize) -> Address {
        self.covered_start.add_words(offset)
    }

    /// Whether `addr` is marked.
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.bits.at(self.addr_to_offset(addr))
    }

    /// Mark `addr`. Used by single-threaded marking.
    pub fn mark(&self, addr: Address) {
        self.bits.set_bit(self.addr_to_offset(addr));
    }

    /// Atomically mark `addr`; `true` if this call set the bit.
    pub fn try_mark(&self, addr: Address) -> bool {
        self.bits.par_set_bit(self.addr_to_offset(addr))
    }

    /// Clear the mark on `addr`.
    pub fn clear(&self, addr: Address) {
        self.bits.clear_bit(self.addr_to_offset(addr));
    }

    /// Clear all marks in `[start, end)`.
    pub fn clear_range(&self, start: Address, end: Address) {
        self.bits
            .clear_range(self.addr_to_offset(start), self.addr_to_offset(end));
    }

    /// Clear the whole bitmap.
    pub fn clear_all(&self) {
        self.bits.clear_all();
    }

    /// First marked address in `[from, limit)`, or `limit`.
    #[must_use]
    pub fn next_marked(&self, from: Address, limit: Address) -> Address {
        let to = self.addr_to_offset(limit);
        let found = self.bits.next_set_bit(self.addr_to_offset(from).min(to), to);
        self.offset_to_addr(found)
    }

    /// Number of marked words.
    #[must_use]
    pub fn count_marked(&self) -> usize {
        self.bits.count_ones()
    }

    /// Iterate the marked addresses in `[start, end)`.
    ///
    /// `next_object` maps a marked address to the end of that object; the
    /// scan resumes there, so interior bits of an object are never reported.
    /// The iterator searches lazily and sees marks set after it was created
    /// as long as they lie ahead of the cursor.
    pub fn iter<F>(&self, start: Address, end: Address, next_object: F) -> MarkedObjects<'_, F>
    where
        F: FnMut(Address) -> Address,
    {
        MarkedObjects {
            bitmap: self,
            cursor: start,
            end,
            next_object,
        }
    }
}

/// Lazy iterator over marked objects, see [`MarkBitmap::iter`].
pub struct MarkedObjects<'a, F> {
    bitmap: &'a MarkBitmap,
    cursor: Address,
    end: Address,
    next_object: F,
}

impl<F> Iterator for MarkedObjects<'_, F>
where
    F: FnMut(Address) -> Address,
{
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        if self.cursor >= self.end {
            return None;
        }
        let addr = self.bitmap.next_marked(self.cursor, self.end);
        if addr >= self.end {
            self.cursor = self.end;
            return None;
        }
        let next = (self.next_object)(addr);
        assert!(next > addr, "object at {addr} has no extent");
        self.cursor = next;
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oop::WORD_SIZE;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_par_set_bit_single_winner() {
        let bitmap = Arc::new(AtomicBitmap::new(256));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || (0..256).filter(|&i| bitmap.par_set_bit(i)).count())
            })
            .collect();

        let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(wins, 256);
        assert_eq!(bitmap.count_ones(), 256);
    }

    #[test]
    fn test_set_range_small_and_bulk_agree() {
        for (start, end) in [(3, 9), (0, 64), (5, 200), (63, 65), (64, 128), (10, 10)] {
            let small = AtomicBitmap::new(256);
            for bit in start..end {
                small.set_bit(bit);
            }
            for atomic in [true, false] {
                let bulk = AtomicBitmap::new(256);
                bulk.set_range(start, end, atomic);
                for bit in 0..256 {
                    assert_eq!(bulk.at(bit), small.at(bit), "bit {bit} of {start}..{end}");
                }
            }
        }
    }

    #[test]
    fn test_clear_range() {
        let bitmap = AtomicBitmap::new(300);
        bitmap.set_range(0, 300, false);
        bitmap.clear_range(10, 250);
        assert_eq!(bitmap.count_ones(), 10 + 50);
        assert!(bitmap.at(9));
        assert!(!bitmap.at(10));
        assert!(!bitmap.at(249));
        assert!(bitmap.at(250));
    }

    #[test]
    fn test_next_set_bit() {
        let bitmap = AtomicBitmap::new(200);
        assert_eq!(bitmap.next_set_bit(0, 200), 200);
        bitmap.set_bit(70);
        bitmap.set_bit(130);
        assert_eq!(bitmap.next_set_bit(0, 200), 70);
        assert_eq!(bitmap.next_set_bit(70, 200), 70);
        assert_eq!(bitmap.next_set_bit(71, 200), 130);
        assert_eq!(bitmap.next_set_bit(71, 100), 100);
        assert_eq!(bitmap.iter_set(0, 200).collect::<Vec<_>>(), vec![70, 130]);
    }

    #[test]
    fn test_union_with() {
        let a = AtomicBitmap::new(128);
        let b = AtomicBitmap::new(128);
        a.set_bit(1);
        b.set_bit(100);
        a.union_with(&b);
        assert!(a.at(1) && a.at(100));
        assert_eq!(a.count_ones(), 2);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_bit_panics() {
        let bitmap = AtomicBitmap::new(64);
        bitmap.set_bit(64);
    }

    #[test]
    fn test_mark_bitmap_iter_skips_object_interiors() {
        let start = Address::new(0x10000);
        let end = start.add_words(256);
        let bitmap = MarkBitmap::new(start, end);

        let a = start.add_words(4);
        let b = start.add_words(10);
        bitmap.mark(a);
        bitmap.mark(b);
        // Interior of `a`, which is 8 words long.
        bitmap.mark(start.add_words(6));

        let found: Vec<_> = bitmap.iter(start, end, |addr| addr.add_words(8)).collect();
        assert_eq!(found, vec![a, b]);
    }

    #[test]
    fn test_mark_bitmap_iter_sees_marks_ahead_of_cursor() {
        let start = Address::new(0x10000);
        let end = start.add_words(64);
        let bitmap = MarkBitmap::new(start, end);
        bitmap.mark(start);

        let late = start.add_words(40);
        let mut iter = bitmap.iter(start, end, |addr| addr.add_words(2));
        assert_eq!(iter.next(), Some(start));
        bitmap.mark(late);
        assert_eq!(iter.next(), Some(late));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_mark_bitmap_try_mark_and_clear_range() {
        let start = Address::new(0x4000);
        let bitmap = MarkBitmap::new(start, start.add_bytes(64 * WORD_SIZE));
        let addr = start.add_words(3);
        assert!(bitmap.try_mark(addr));
        assert!(!bitmap.try_mark(addr));
        assert_eq!(bitmap.next_marked(start, start.add_words(64)), addr);

        bitmap.clear_range(start, start.add_words(64));
        assert!(!bitmap.is_marked(addr));
        assert_eq!(bitmap.count_marked(), 0);
    }
}
