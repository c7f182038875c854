//! Heap addresses, heap words and the object layout.
//!
//! Every heap object is a run of 8-byte [`HeapWord`]s:
//!
//! ```text
//! word 0   mark word   (neutral, or forwarded during compaction)
//! word 1   klass word  (instance / object array / primitive array)
//! word 2.. instance:   `refs` reference words, then `prims` primitive words
//!          arrays:     length word, then `length` element words
//! ```
//!
//! A reference is the raw [`Address`] of the referenced object's header,
//! `0` meaning null.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a heap word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Log2 of [`WORD_SIZE`].
pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();

/// Minimum object alignment in words. Also the mark bitmap granularity.
pub const MIN_OBJ_ALIGNMENT_WORDS: usize = 1;

/// Header words of an instance (mark + klass).
pub const INSTANCE_HEADER_WORDS: usize = 2;

/// Header words of an array (mark + klass + length).
pub const ARRAY_HEADER_WORDS: usize = 3;

const MAX_INSTANCE_FIELDS: u32 = (1 << 28) - 1;

// ============================================================================
// Address
// ============================================================================

/// A byte address in the reserved heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw address.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `words` heap words above this one.
    #[must_use]
    pub const fn add_words(self, words: usize) -> Self {
        Self(self.0 + words * WORD_SIZE)
    }

    /// Address `bytes` above this one.
    #[must_use]
    pub const fn add_bytes(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Number of heap words in `[earlier, self)`.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is above `self`.
    #[must_use]
    pub const fn words_since(self, earlier: Self) -> usize {
        assert!(earlier.0 <= self.0, "address range is inverted");
        (self.0 - earlier.0) >> LOG_WORD_SIZE
    }

    /// Number of bytes in `[earlier, self)`.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is above `self`.
    #[must_use]
    pub const fn bytes_since(self, earlier: Self) -> usize {
        assert!(earlier.0 <= self.0, "address range is inverted");
        self.0 - earlier.0
    }

    /// Whether the address is aligned to a heap word.
    #[must_use]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }

    /// Whether the address is aligned to `alignment` bytes (a power of two).
    #[must_use]
    pub const fn is_aligned(self, alignment: usize) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// HeapWord
// ============================================================================

/// One word of heap (or root) storage.
///
/// All access is atomic so that marking threads may read reference fields
/// while mutators update them. Reference stores use release ordering and
/// reference loads acquire ordering, which publishes an object's header
/// words together with the reference to it.
#[derive(Default)]
#[repr(transparent)]
pub struct HeapWord(AtomicUsize);

impl HeapWord {
    /// A word holding `value`.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }

    /// Raw load.
    #[inline]
    pub fn load(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Raw store.
    #[inline]
    pub fn store(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Load the word as a reference.
    #[inline]
    pub fn load_ref(&self) -> Option<Address> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Address(raw)),
        }
    }

    /// Store a reference into the word.
    #[inline]
    pub fn store_ref(&self, value: Option<Address>) {
        self.0
            .store(value.map_or(0, Address::as_usize), Ordering::Release);
    }
}

impl fmt::Debug for HeapWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapWord({:#x})", self.load())
    }
}

// ============================================================================
// MarkWord
// ============================================================================

/// State held in an object's first word.
///
/// Liveness lives in the mark bitmap, so the mark word only distinguishes a
/// plain object from one that has been assigned a compaction destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkWord {
    /// Not forwarded.
    Neutral,
    /// Forwarded to a new address by compaction phase 2.
    Forwarded(Address),
}

impl MarkWord {
    const NEUTRAL_BITS: usize = 0b01;
    const FORWARDED_TAG: usize = 0b11;
    const TAG_MASK: usize = 0b11;

    /// Encode into a raw word.
    #[must_use]
    pub fn encode(self) -> usize {
        match self {
            Self::Neutral => Self::NEUTRAL_BITS,
            Self::Forwarded(dest) => {
                debug_assert!(dest.is_word_aligned());
                dest.as_usize() | Self::FORWARDED_TAG
            }
        }
    }

    /// Decode a raw word.
    ///
    /// # Panics
    ///
    /// Panics if the word is not a valid mark word; that means the address
    /// did not point at an object header.
    #[must_use]
    pub fn decode(bits: usize) -> Self {
        match bits & Self::TAG_MASK {
            Self::FORWARDED_TAG => Self::Forwarded(Address(bits & !Self::TAG_MASK)),
            Self::NEUTRAL_BITS if bits == Self::NEUTRAL_BITS => Self::Neutral,
            _ => panic!("corrupt mark word {bits:#x}"),
        }
    }

    /// Destination if forwarded.
    #[must_use]
    pub const fn forwardee(self) -> Option<Address> {
        match self {
            Self::Neutral => None,
            Self::Forwarded(dest) => Some(dest),
        }
    }
}

// ============================================================================
// Klass / ObjectShape
// ============================================================================

/// Object kind as stored in the klass word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Klass {
    /// Fixed-layout object with `refs` reference fields and `prims` primitive words.
    Instance {
        /// Number of reference fields.
        refs: u32,
        /// Number of primitive words.
        prims: u32,
    },
    /// Array of references.
    ObjArray,
    /// Array of primitive words; holds no references.
    TypeArray,
}

impl Klass {
    const KIND_INSTANCE: usize = 1;
    const KIND_OBJ_ARRAY: usize = 2;
    const KIND_TYPE_ARRAY: usize = 3;
    const KIND_MASK: usize = 0xff;
    const REFS_SHIFT: u32 = 8;
    const PRIMS_SHIFT: u32 = 36;
    const FIELD_MASK: usize = (1 << 28) - 1;

    /// Encode into a raw klass word.
    #[must_use]
    pub const fn encode(self) -> usize {
        match self {
            Self::Instance { refs, prims } => {
                Self::KIND_INSTANCE
                    | ((refs as usize) << Self::REFS_SHIFT)
                    | ((prims as usize) << Self::PRIMS_SHIFT)
            }
            Self::ObjArray => Self::KIND_OBJ_ARRAY,
            Self::TypeArray => Self::KIND_TYPE_ARRAY,
        }
    }

    /// Decode a raw klass word.
    ///
    /// # Panics
    ///
    /// Panics on an unknown kind, which means the heap is not parsable at
    /// this address.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(bits: usize) -> Self {
        match bits & Self::KIND_MASK {
            Self::KIND_INSTANCE => Self::Instance {
                refs: ((bits >> Self::REFS_SHIFT) & Self::FIELD_MASK) as u32,
                prims: ((bits >> Self::PRIMS_SHIFT) & Self::FIELD_MASK) as u32,
            },
            Self::KIND_OBJ_ARRAY => Self::ObjArray,
            Self::KIND_TYPE_ARRAY => Self::TypeArray,
            _ => panic!("corrupt klass word {bits:#x}"),
        }
    }

    /// Whether objects of this klass are arrays.
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::ObjArray | Self::TypeArray)
    }
}

/// The shape requested when allocating an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectShape {
    /// Fixed-layout object.
    Instance {
        /// Number of reference fields.
        refs: u32,
        /// Number of primitive words.
        prims: u32,
    },
    /// Array of `length` references.
    ObjArray {
        /// Element count.
        length: usize,
    },
    /// Array of `length` primitive words.
    TypeArray {
        /// Element count.
        length: usize,
    },
}

impl ObjectShape {
    /// Total size in heap words, header included.
    #[must_use]
    pub const fn size_words(self) -> usize {
        match self {
            Self::Instance { refs, prims } => INSTANCE_HEADER_WORDS + refs as usize + prims as usize,
            Self::ObjArray { length } | Self::TypeArray { length } => ARRAY_HEADER_WORDS + length,
        }
    }

    /// The klass for this shape.
    #[must_use]
    pub const fn klass(self) -> Klass {
        match self {
            Self::Instance { refs, prims } => Klass::Instance { refs, prims },
            Self::ObjArray { .. } => Klass::ObjArray,
            Self::TypeArray { .. } => Klass::TypeArray,
        }
    }

    /// Whether the shape can be encoded in a klass word.
    #[must_use]
    pub const fn is_encodable(self) -> bool {
        match self {
            Self::Instance { refs, prims } => {
                refs <= MAX_INSTANCE_FIELDS && prims <= MAX_INSTANCE_FIELDS
            }
            Self::ObjArray { .. } | Self::TypeArray { .. } => true,
        }
    }
}

// ============================================================================
// ObjRef - a view of one object
// ============================================================================

/// A borrowed view of the object whose header is at `addr`.
///
/// `words` starts at the object's header and runs to the end of the
/// reserved heap, so every accessor is a plain bounds-checked index.
#[derive(Clone, Copy)]
pub struct ObjRef<'h> {
    addr: Address,
    words: &'h [HeapWord],
}

impl<'h> ObjRef<'h> {
    pub(crate) const fn new(addr: Address, words: &'h [HeapWord]) -> Self {
        Self { addr, words }
    }

    /// Header address.
    #[must_use]
    pub const fn addr(&self) -> Address {
        self.addr
    }

    /// Decoded mark word.
    #[must_use]
    pub fn mark_word(&self) -> MarkWord {
        MarkWord::decode(self.words[0].load())
    }

    /// Overwrite the mark word.
    pub fn set_mark_word(&self, mark: MarkWord) {
        self.words[0].store(mark.encode());
    }

    /// Compaction destination, if any.
    #[must_use]
    pub fn forwardee(&self) -> Option<Address> {
        self.mark_word().forwardee()
    }

    /// Decoded klass.
    #[must_use]
    pub fn klass(&self) -> Klass {
        Klass::decode(self.words[1].load())
    }

    /// Array length; `0` for instances.
    #[must_use]
    pub fn array_length(&self) -> usize {
        if self.klass().is_array() {
            self.words[2].load()
        } else {
            0
        }
    }

    /// The object's shape.
    #[must_use]
    pub fn shape(&self) -> ObjectShape {
        match self.klass() {
            Klass::Instance { refs, prims } => ObjectShape::Instance { refs, prims },
            Klass::ObjArray => ObjectShape::ObjArray {
                length: self.words[2].load(),
            },
            Klass::TypeArray => ObjectShape::TypeArray {
                length: self.words[2].load(),
            },
        }
    }

    /// Size in heap words, header included.
    #[must_use]
    pub fn size_words(&self) -> usize {
        self.shape().size_words()
    }

    /// Size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_words() * WORD_SIZE
    }

    /// Address just past the object.
    #[must_use]
    pub fn end(&self) -> Address {
        self.addr.add_words(self.size_words())
    }

    /// Whether this is a reference array.
    #[must_use]
    pub fn is_obj_array(&self) -> bool {
        self.klass() == Klass::ObjArray
    }

    /// Whether this object holds no references at all.
    #[must_use]
    pub fn is_ref_free(&self) -> bool {
        match self.klass() {
            Klass::Instance { refs, .. } => refs == 0,
            Klass::ObjArray => false,
            Klass::TypeArray => true,
        }
    }

    /// Number of reference slots.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        match self.klass() {
            Klass::Instance { refs, .. } => refs as usize,
            Klass::ObjArray => self.words[2].load(),
            Klass::TypeArray => 0,
        }
    }

    fn first_ref_word(&self) -> usize {
        match self.klass() {
            Klass::Instance { .. } => INSTANCE_HEADER_WORDS,
            Klass::ObjArray | Klass::TypeArray => ARRAY_HEADER_WORDS,
        }
    }

    /// Reference slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference slot of this object.
    #[must_use]
    pub fn ref_slot(&self, index: usize) -> &'h HeapWord {
        assert!(
            index < self.ref_count(),
            "reference index {index} out of bounds for object at {}",
            self.addr
        );
        &self.words[self.first_ref_word() + index]
    }

    /// Reference slots `range`, in ascending order.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the object's reference slots.
    #[must_use]
    pub fn ref_slots(&self, range: std::ops::Range<usize>) -> &'h [HeapWord] {
        assert!(range.end <= self.ref_count(), "reference range out of bounds");
        let first = self.first_ref_word();
        &self.words[first + range.start..first + range.end]
    }

    /// All reference slots.
    #[must_use]
    pub fn all_ref_slots(&self) -> &'h [HeapWord] {
        self.ref_slots(0..self.ref_count())
    }

    /// Address of element `index` of an array (or reference slot of an instance).
    #[must_use]
    pub fn element_addr(&self, index: usize) -> Address {
        self.addr.add_words(self.first_ref_word() + index)
    }

    /// Primitive slot `index`: instance primitive words, or type-array elements.
    ///
    /// # Panics
    ///
    /// Panics if the object has no such primitive slot.
    #[must_use]
    pub fn prim_slot(&self, index: usize) -> &'h HeapWord {
        match self.klass() {
            Klass::Instance { refs, prims } => {
                assert!(index < prims as usize, "primitive index {index} out of bounds");
                &self.words[INSTANCE_HEADER_WORDS + refs as usize + index]
            }
            Klass::TypeArray => {
                assert!(index < self.words[2].load(), "array index {index} out of bounds");
                &self.words[ARRAY_HEADER_WORDS + index]
            }
            Klass::ObjArray => panic!("object array at {} has no primitive slots", self.addr),
        }
    }

    /// Raw words of the whole object.
    #[must_use]
    pub fn words(&self) -> &'h [HeapWord] {
        &self.words[..self.size_words()]
    }
}

impl fmt::Debug for ObjRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjRef")
            .field("addr", &self.addr)
            .field("shape", &self.shape())
            .finish()
    }
}

/// Write a fresh object header plus zeroed body into `words`.
pub(crate) fn initialize_object(words: &[HeapWord], shape: ObjectShape) {
    words[0].store(MarkWord::Neutral.encode());
    words[1].store(shape.klass().encode());
    let body_start = match shape {
        ObjectShape::Instance { .. } => INSTANCE_HEADER_WORDS,
        ObjectShape::ObjArray { length } | ObjectShape::TypeArray { length } => {
            words[2].store(length);
            ARRAY_HEADER_WORDS
        }
    };
    for word in &words[body_start..shape.size_words()] {
        word.store(0);
    }
}
