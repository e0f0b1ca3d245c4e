//! Mark tasks that carry either a plain object reference or an array chunk.
//!
//! The common case is a plain reference, so that path must stay as cheap as a
//! bare pointer. Large arrays are split into chunks so several workers can
//! scan them in parallel. A chunk `<C, P>` covers the slot interval
//! `[(C - 1) * 2^P, C * 2^P)`, and splits into `<2C - 1, P - 1>` (lower half)
//! and `<2C, P - 1>` (upper half). Scanning can start from the root chunk
//! `<1, ceil(log2(len))>` and split down inside the workers.
//!
//! On 64-bit targets the chunk data is stolen from the top bits of the
//! reference word:
//!
//! ```text
//! |---------reference---------|-exponent-|---chunk---|
//! 0                          49         54          64
//! ```
//!
//! A plain reference therefore encodes with all upper bits zero, and testing
//! for "chunked" is one mask test. The bit budget limits the encoding to
//! 1024 chunks per array, arrays of at most 2^32 slots and 512 TiB of
//! addressable heap.
//!
//! Other targets, and builds with the `plain-task` feature, use a plain
//! three-field layout with identical accessors.

use std::fmt;
use std::ops::Range;

/// Number of bits holding the chunk index.
pub const CHUNK_BITS: u32 = 10;

/// Number of bits holding the block size exponent.
pub const EXPONENT_BITS: u32 = 5;

/// Exclusive upper bound for chunk indices.
pub const CHUNK_LIMIT: usize = 1 << CHUNK_BITS;

/// Exclusive upper bound for block size exponents.
pub const EXPONENT_LIMIT: u32 = 1 << EXPONENT_BITS;

/// Longest array [`ChunkedTask::root_chunk`] accepts: `2^(EXPONENT_LIMIT - 1)`
/// slots, saturated to the word size on narrower targets.
pub const MAX_CHUNKED_LEN: usize = match 1usize.checked_shl(EXPONENT_LIMIT - 1) {
    Some(len) => len,
    None => usize::MAX,
};

#[cfg(all(target_pointer_width = "64", not(feature = "plain-task")))]
mod repr {
    use super::{CHUNK_BITS, CHUNK_LIMIT, EXPONENT_BITS, EXPONENT_LIMIT};

    pub const REFERENCE_BITS: u32 = usize::BITS - CHUNK_BITS - EXPONENT_BITS;

    const EXPONENT_SHIFT: u32 = REFERENCE_BITS;
    const CHUNK_SHIFT: u32 = EXPONENT_SHIFT + EXPONENT_BITS;

    const REFERENCE_MASK: usize = (1 << REFERENCE_BITS) - 1;
    const EXPONENT_MASK: usize = (1 << EXPONENT_BITS) - 1;
    const CHUNK_MASK: usize = (1 << CHUNK_BITS) - 1;
    const CHUNK_MASK_UNSHIFTED: usize = CHUNK_MASK << CHUNK_SHIFT;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct Repr(usize);

    impl Repr {
        #[inline]
        pub const fn plain(reference: usize) -> Self {
            debug_assert!(
                reference <= REFERENCE_MASK,
                "reference does not fit the packed task word"
            );
            Self(reference)
        }

        #[inline]
        pub const fn chunked(reference: usize, chunk: usize, exponent: u32) -> Self {
            debug_assert!(chunk < CHUNK_LIMIT, "chunk index out of range");
            debug_assert!(exponent < EXPONENT_LIMIT, "chunk exponent out of range");
            debug_assert!(
                reference <= REFERENCE_MASK,
                "reference does not fit the packed task word"
            );
            Self(reference | ((exponent as usize) << EXPONENT_SHIFT) | (chunk << CHUNK_SHIFT))
        }

        #[inline]
        pub const fn reference(self) -> usize {
            self.0 & REFERENCE_MASK
        }

        #[inline]
        pub const fn chunk(self) -> usize {
            (self.0 >> CHUNK_SHIFT) & CHUNK_MASK
        }

        #[inline]
        #[allow(clippy::cast_possible_truncation)]
        pub const fn exponent(self) -> u32 {
            ((self.0 >> EXPONENT_SHIFT) & EXPONENT_MASK) as u32
        }

        #[inline]
        pub const fn is_plain(self) -> bool {
            self.0 & CHUNK_MASK_UNSHIFTED == 0
        }
    }
}

#[cfg(not(all(target_pointer_width = "64", not(feature = "plain-task"))))]
mod repr {
    use super::{CHUNK_LIMIT, EXPONENT_LIMIT};

    pub const REFERENCE_BITS: u32 = usize::BITS;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Repr {
        reference: usize,
        chunk: u16,
        exponent: u8,
    }

    impl Repr {
        #[inline]
        pub const fn plain(reference: usize) -> Self {
            Self {
                reference,
                chunk: 0,
                exponent: 0,
            }
        }

        #[inline]
        #[allow(clippy::cast_possible_truncation)]
        pub const fn chunked(reference: usize, chunk: usize, exponent: u32) -> Self {
            debug_assert!(chunk < CHUNK_LIMIT, "chunk index out of range");
            debug_assert!(exponent < EXPONENT_LIMIT, "chunk exponent out of range");
            Self {
                reference,
                chunk: chunk as u16,
                exponent: exponent as u8,
            }
        }

        #[inline]
        pub const fn reference(self) -> usize {
            self.reference
        }

        #[inline]
        pub const fn chunk(self) -> usize {
            self.chunk as usize
        }

        #[inline]
        pub const fn exponent(self) -> u32 {
            self.exponent as u32
        }

        #[inline]
        pub const fn is_plain(self) -> bool {
            self.chunk == 0
        }
    }
}

/// Number of address bits a task reference may use.
///
/// This is 49 for the packed layout and the full word width otherwise.
pub const REFERENCE_BITS: u32 = repr::REFERENCE_BITS;

/// A unit of mark work: an object reference, optionally narrowed to a chunk
/// of the array it points to.
///
/// Tasks are immutable values. Equality compares the encoded word, so two
/// tasks are equal only if reference, chunk and exponent all match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ChunkedTask(repr::Repr);

impl ChunkedTask {
    /// Create a plain (unchunked) task for `reference`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the packed layout is in use and `reference`
    /// does not fit in [`REFERENCE_BITS`] bits.
    #[inline]
    #[must_use]
    pub const fn new(reference: usize) -> Self {
        Self(repr::Repr::plain(reference))
    }

    /// Create a task covering chunk `chunk` of size `2^exponent` of the array
    /// at `reference`.
    ///
    /// A `chunk` of zero produces a plain task.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `chunk >= CHUNK_LIMIT`,
    /// `exponent >= EXPONENT_LIMIT`, or `reference` does not fit the packed
    /// layout.
    #[inline]
    #[must_use]
    pub const fn chunked(reference: usize, chunk: usize, exponent: u32) -> Self {
        Self(repr::Repr::chunked(reference, chunk, exponent))
    }

    /// Create a plain task from an object pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr.expose_provenance())
    }

    /// The root chunk for an array of `len` slots: `<1, ceil(log2(len))>`.
    ///
    /// Arrays of zero or one slot get exponent 0. The chunk may extend past
    /// `len`; scanners clamp [`slot_range`](Self::slot_range) to the array
    /// length.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`MAX_CHUNKED_LEN`]; the exponent would not
    /// fit its field.
    #[must_use]
    pub const fn root_chunk(reference: usize, len: usize) -> Self {
        assert!(len <= MAX_CHUNKED_LEN, "array too long for a chunked task");
        let exponent = if len <= 1 { 0 } else { (len - 1).ilog2() + 1 };
        Self::chunked(reference, 1, exponent)
    }

    /// Address of the referenced object.
    #[inline]
    #[must_use]
    pub const fn reference(self) -> usize {
        self.0.reference()
    }

    /// The referenced object as a raw pointer.
    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        std::ptr::with_exposed_provenance(self.reference())
    }

    /// Chunk index, `0` for plain tasks.
    #[inline]
    #[must_use]
    pub const fn chunk(self) -> usize {
        self.0.chunk()
    }

    /// Block size exponent. Meaningless for plain tasks.
    #[inline]
    #[must_use]
    pub const fn exponent(self) -> u32 {
        self.0.exponent()
    }

    /// Whether this task covers the whole object rather than a chunk.
    #[inline]
    #[must_use]
    pub const fn is_plain(self) -> bool {
        self.0.is_plain()
    }

    /// Array slots covered by this chunk, or `None` for plain tasks.
    #[must_use]
    pub const fn slot_range(self) -> Option<Range<usize>> {
        if self.is_plain() {
            return None;
        }
        let block = 1usize << self.exponent();
        let chunk = self.chunk();
        Some((chunk - 1).saturating_mul(block)..chunk.saturating_mul(block))
    }

    /// Split a chunk into its lower and upper halves.
    ///
    /// Returns `None` for plain tasks, single-slot chunks, and chunks whose
    /// children would not fit the chunk index field.
    #[must_use]
    pub const fn split(self) -> Option<(Self, Self)> {
        let chunk = self.chunk();
        let exponent = self.exponent();
        if self.is_plain() || exponent == 0 || 2 * chunk >= CHUNK_LIMIT {
            return None;
        }
        let reference = self.reference();
        Some((
            Self::chunked(reference, 2 * chunk - 1, exponent - 1),
            Self::chunked(reference, 2 * chunk, exponent - 1),
        ))
    }
}

impl fmt::Debug for ChunkedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_plain() {
            write!(f, "ChunkedTask({:#x})", self.reference())
        } else {
            write!(
                f,
                "ChunkedTask({:#x}, chunk: {}, exponent: {})",
                self.reference(),
                self.chunk(),
                self.exponent()
            )
        }
    }
}
