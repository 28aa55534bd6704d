//! Half-open interval value type shared by every free-structure in the engine.
//!
//! A [`Range`] is generic over its unit: heap offsets are measured in bytes
//! and must be granule aligned, backing indices are measured in index counts.
//! Ranges are plain `Copy` values; ownership of the memory they describe lives
//! in whichever container currently holds them.

use std::fmt;

/// log2 of the granule size.
pub const GRANULE_SIZE_SHIFT: usize = 21;

/// Fixed unit of address and backing-memory accounting (2 MiB).
pub const GRANULE_SIZE: usize = 1 << GRANULE_SIZE_SHIFT;

/// Smallest page the collector hands out; one granule.
pub const SMALL_PAGE_SIZE: usize = GRANULE_SIZE;

#[inline]
#[must_use]
pub const fn is_granule_aligned(value: usize) -> bool {
    value & (GRANULE_SIZE - 1) == 0
}

#[inline]
#[must_use]
pub const fn align_down_granule(value: usize) -> usize {
    value & !(GRANULE_SIZE - 1)
}

#[inline]
#[must_use]
pub const fn align_up_granule(value: usize) -> usize {
    (value + GRANULE_SIZE - 1) & !(GRANULE_SIZE - 1)
}

/// Coordinate type a [`Range`] is measured in.
pub trait RangeUnit: Copy + Ord + fmt::Debug {
    /// Every start and size must be a multiple of this.
    const ALIGNMENT: usize;
    /// Start value reserved for the null range.
    const NULL: Self;

    fn to_raw(self) -> usize;
    fn from_raw(raw: usize) -> Self;
}

/// Byte offset into the heap's offset space. Views translate an offset into
/// an address by adding their base.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapOffset(usize);

impl HeapOffset {
    #[inline]
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Granule number of this offset.
    #[inline]
    #[must_use]
    pub const fn granule(self) -> usize {
        self.0 >> GRANULE_SIZE_SHIFT
    }
}

impl RangeUnit for HeapOffset {
    const ALIGNMENT: usize = GRANULE_SIZE;
    const NULL: Self = Self(usize::MAX);

    #[inline]
    fn to_raw(self) -> usize {
        self.0
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for HeapOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifies one granule of physical backing storage. The backing store
/// byte offset is `index * GRANULE_SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackingIndex(u32);

impl BackingIndex {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Byte offset of this index in the backing store.
    #[inline]
    #[must_use]
    pub const fn backing_offset(self) -> usize {
        (self.0 as usize) << GRANULE_SIZE_SHIFT
    }
}

impl RangeUnit for BackingIndex {
    const ALIGNMENT: usize = 1;
    const NULL: Self = Self(u32::MAX);

    #[inline]
    fn to_raw(self) -> usize {
        self.0 as usize
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        assert!(
            u32::try_from(raw).is_ok(),
            "backing index {raw} does not fit the index type"
        );
        #[allow(clippy::cast_possible_truncation)]
        Self(raw as u32)
    }
}

impl fmt::Debug for BackingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Half-open interval `[start, start + size)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range<U: RangeUnit> {
    start: U,
    size: usize,
}

pub type OffsetRange = Range<HeapOffset>;
pub type IndexRange = Range<BackingIndex>;

impl<U: RangeUnit> Range<U> {
    /// # Panics
    ///
    /// Panics if `start` or `size` is not aligned to the unit's alignment.
    #[inline]
    #[must_use]
    pub fn new(start: U, size: usize) -> Self {
        assert!(
            start.to_raw().is_multiple_of(U::ALIGNMENT) && size.is_multiple_of(U::ALIGNMENT),
            "misaligned range {start:?}+{size:#x} (alignment {:#x})",
            U::ALIGNMENT
        );
        Self { start, size }
    }

    #[inline]
    #[must_use]
    pub fn from_raw(start: usize, size: usize) -> Self {
        Self::new(U::from_raw(start), size)
    }

    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self {
            start: U::NULL,
            size: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.start == U::NULL
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub fn start(&self) -> U {
        debug_assert!(!self.is_null(), "start() on null range");
        self.start
    }

    #[inline]
    #[must_use]
    pub fn start_raw(&self) -> usize {
        self.start().to_raw()
    }

    #[inline]
    #[must_use]
    pub fn end(&self) -> U {
        U::from_raw(self.end_raw())
    }

    #[inline]
    #[must_use]
    pub fn end_raw(&self) -> usize {
        self.start_raw() + self.size
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Removes `size` units from the front and returns them.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the range or breaks alignment.
    pub fn shrink_from_front(&mut self, size: usize) -> Self {
        assert!(size <= self.size, "shrink {size:#x} beyond {self:?}");
        let front = Self::new(self.start, size);
        *self = Self::from_raw(self.start_raw() + size, self.size - size);
        front
    }

    /// Removes `size` units from the back and returns them.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the range or breaks alignment.
    pub fn shrink_from_back(&mut self, size: usize) -> Self {
        assert!(size <= self.size, "shrink {size:#x} beyond {self:?}");
        self.size -= size;
        Self::from_raw(self.end_raw(), size)
    }

    /// # Panics
    ///
    /// Panics if the range would grow below zero.
    pub fn grow_from_front(&mut self, size: usize) {
        assert!(size <= self.start_raw(), "grow {size:#x} below zero for {self:?}");
        *self = Self::from_raw(self.start_raw() - size, self.size + size);
    }

    pub fn grow_from_back(&mut self, size: usize) {
        *self = Self::new(self.start, self.size + size);
    }

    /// Sub-range `[start + offset, start + offset + size)`.
    ///
    /// # Panics
    ///
    /// Panics if the sub-range is not contained in `self`.
    #[must_use]
    pub fn partition(&self, offset: usize, size: usize) -> Self {
        assert!(
            offset + size <= self.size,
            "partition {offset:#x}+{size:#x} outside {self:?}"
        );
        Self::from_raw(self.start_raw() + offset, size)
    }

    #[must_use]
    pub fn first_part(&self, size: usize) -> Self {
        self.partition(0, size)
    }

    #[must_use]
    pub fn last_part(&self, offset: usize) -> Self {
        self.partition(offset, self.size - offset)
    }

    #[inline]
    #[must_use]
    pub fn adjacent_to(&self, other: &Self) -> bool {
        self.end_raw() == other.start_raw() || other.end_raw() == self.start_raw()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.start_raw() >= self.start_raw() && other.end_raw() <= self.end_raw()
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start_raw() < other.end_raw() && other.start_raw() < self.end_raw()
    }
}

impl<U: RangeUnit> fmt::Debug for Range<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "[null]");
        }
        write!(f, "[{:?}, +{:#x})", self.start, self.size)
    }
}

/// Builds a heap offset range; shorthand used throughout tests.
#[inline]
#[must_use]
pub fn offset_range(start: usize, size: usize) -> OffsetRange {
    OffsetRange::from_raw(start, size)
}
