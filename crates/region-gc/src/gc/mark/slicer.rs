//! Splitting large reference arrays into bounded scan units.
//!
//! Scanning an array of `len` elements with stride `S` pushes a
//! continuation entry for the rest of the array before scanning the first
//! `S` elements, so the remainder can be stolen while this worker scans.
//! A continuation entry is the address of its first unscanned element; the
//! array header is recovered with [`Heap::block_start`].

use std::ops::Range;

use crate::gc::worklist::MarkTaskEntry;
use crate::heap::Heap;
use crate::oop::Address;

/// Slices reference arrays by a fixed element stride.
#[derive(Debug, Clone, Copy)]
pub struct ObjArraySlicer {
    stride: usize,
}

impl ObjArraySlicer {
    /// A slicer with `stride` elements per slice.
    #[must_use]
    pub const fn new(stride: usize) -> Self {
        assert!(stride > 0, "stride must be positive");
        Self { stride }
    }

    /// Elements per slice.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Whether an array of `len` elements is scanned in more than one slice.
    #[must_use]
    pub const fn should_be_sliced(&self, len: usize) -> bool {
        len > self.stride
    }

    /// Elements to scan now when starting at `start` in an array of `len`,
    /// and the index of the continuation, if any.
    #[must_use]
    pub const fn next_slice(&self, start: usize, len: usize) -> (Range<usize>, Option<usize>) {
        let remaining = len - start;
        if remaining > self.stride {
            (start..start + self.stride, Some(start + self.stride))
        } else {
            (start..len, None)
        }
    }

    /// Every slice an array of `len` elements is split into, in order.
    #[must_use]
    pub fn plan(&self, len: usize) -> Vec<Range<usize>> {
        let mut slices = Vec::with_capacity(len.div_ceil(self.stride).max(1));
        let mut start = 0;
        loop {
            let (range, next) = self.next_slice(start, len);
            slices.push(range);
            match next {
                Some(n) => start = n,
                None => return slices,
            }
        }
    }

    /// Begin scanning the array at `obj`. Pushes the continuation (if any)
    /// and returns the element range to scan now.
    pub fn process_obj(
        &self,
        heap: &Heap,
        obj: Address,
        push: impl FnOnce(MarkTaskEntry),
    ) -> Range<usize> {
        let array = heap.obj(obj);
        debug_assert!(array.is_obj_array());
        self.push_continuation(heap, obj, 0, array.array_length(), push)
    }

    /// Continue scanning at the element address `slice`. Pushes the next
    /// continuation (if any) and returns the array and the range to scan.
    pub fn process_slice(
        &self,
        heap: &Heap,
        slice: Address,
        push: impl FnOnce(MarkTaskEntry),
    ) -> (Address, Range<usize>) {
        let obj = heap.block_start(slice);
        let array = heap.obj(obj);
        assert!(
            array.is_obj_array(),
            "array slice {slice} does not point into a reference array"
        );
        let start = slice.words_since(array.element_addr(0));
        let range = self.push_continuation(heap, obj, start, array.array_length(), push);
        (obj, range)
    }

    fn push_continuation(
        &self,
        heap: &Heap,
        obj: Address,
        start: usize,
        len: usize,
        push: impl FnOnce(MarkTaskEntry),
    ) -> Range<usize> {
        let (range, next) = self.next_slice(start, len);
        if let Some(next) = next {
            push(MarkTaskEntry::ArraySlice(heap.obj(obj).element_addr(next)));
        }
        range
    }
}
