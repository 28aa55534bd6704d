//! Cache of committed, mapped ranges ready for reuse.
//!
//! Entries live in an address-ordered map and, when at least two granules
//! large, in exactly one power-of-two size-class list. Each list is ordered
//! by address so equally good candidates resolve to the lowest address.
//! Adjacent entries are merged on insert.

use super::range::{GRANULE_SIZE, GRANULE_SIZE_SHIFT, OffsetRange, SMALL_PAGE_SIZE, is_granule_aligned};
use std::collections::{BTreeMap, BTreeSet};

/// Size classes cover `2^1 ..= 2^14` granules; the last one is open-ended.
pub const NUM_SIZE_CLASSES: usize = 14;

fn granules(size: usize) -> usize {
    size >> GRANULE_SIZE_SHIFT
}

/// Size class an entry of `size` bytes is filed under, if any.
#[must_use]
pub fn size_class_index(size: usize) -> Option<usize> {
    let g = granules(size);
    if g < 2 {
        return None;
    }
    let floor_log2 = (usize::BITS - 1 - g.leading_zeros()) as usize;
    Some((floor_log2 - 1).min(NUM_SIZE_CLASSES - 1))
}

/// Lowest size class whose every entry holds at least `size` bytes.
#[must_use]
pub fn guaranteed_size_class_index(size: usize) -> Option<usize> {
    let g = granules(size);
    let ceil_log2 = if g <= 1 {
        0
    } else {
        (usize::BITS - (g - 1).leading_zeros()) as usize
    };
    let index = ceil_log2.saturating_sub(1);
    (index < NUM_SIZE_CLASSES).then_some(index)
}

pub struct RangeCache {
    /// start -> size
    entries: BTreeMap<usize, usize>,
    classes: [BTreeSet<usize>; NUM_SIZE_CLASSES],
    size: usize,
    min_size_watermark: usize,
}

impl Default for RangeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            classes: std::array::from_fn(|_| BTreeSet::new()),
            size: 0,
            min_size_watermark: 0,
        }
    }

    /// Adds a mapped range, merging it with adjacent entries.
    ///
    /// # Panics
    ///
    /// Panics if `range` overlaps a cached entry.
    pub fn insert(&mut self, range: OffsetRange) {
        assert!(!range.is_null() && !range.is_empty(), "caching {range:?}");
        let mut start = range.start_raw();
        let mut end = range.end_raw();

        if let Some((&s, &sz)) = self.entries.range(..start).next_back() {
            assert!(s + sz <= start, "{range:?} overlaps cached [{s:#x}, +{sz:#x})");
            if s + sz == start {
                self.unlink(s);
                start = s;
            }
        }
        if let Some((&s, &sz)) = self.entries.range(range.start_raw()..).next() {
            assert!(end <= s, "{range:?} overlaps cached [{s:#x}, +{sz:#x})");
            if s == end {
                self.unlink(s);
                end = s + sz;
            }
        }

        self.link(start, end - start);
        self.size += range.size();
        self.debug_verify();
    }

    /// A range of exactly `size` bytes, or null.
    pub fn remove_contiguous(&mut self, size: usize) -> OffsetRange {
        assert!(size > 0 && is_granule_aligned(size), "bad request size {size:#x}");

        match self.find(size) {
            Some(start) => self.take_front(start, size),
            None => OffsetRange::null(),
        }
    }

    /// Start of the entry a contiguous request of `size` is carved from.
    fn find(&self, size: usize) -> Option<usize> {
        if size == SMALL_PAGE_SIZE {
            self.entries.first_key_value().map(|(&s, _)| s)
        } else {
            self.find_in_classes(size).or_else(|| self.scan_tree(size))
        }
    }

    fn find_in_classes(&self, size: usize) -> Option<usize> {
        let guaranteed = guaranteed_size_class_index(size);
        if let Some(g) = guaranteed {
            for class in &self.classes[g..] {
                if let Some(&start) = class.first() {
                    return Some(start);
                }
            }
        }

        let own = size_class_index(size)?;
        let upper = guaranteed.unwrap_or(NUM_SIZE_CLASSES);
        for class in self.classes[own..upper].iter().rev() {
            if let Some(&start) = class.iter().find(|&&s| self.entries[&s] >= size) {
                return Some(start);
            }
        }
        None
    }

    fn scan_tree(&self, size: usize) -> Option<usize> {
        self.entries
            .iter()
            .find(|&(_, &sz)| sz >= size)
            .map(|(&s, _)| s)
    }

    /// A power-of-two range in `[min, max]`, found the way
    /// [`Self::remove_contiguous`] finds `min` and then grown as far as the
    /// chosen entry allows. Null if nothing holds `min`.
    pub fn remove_contiguous_power_of_2(&mut self, min: usize, max: usize) -> OffsetRange {
        assert!(
            min.is_power_of_two() && max.is_power_of_two() && min >= GRANULE_SIZE && min <= max,
            "bad power-of-two bounds [{min:#x}, {max:#x}]"
        );

        let Some(start) = self.find(min) else {
            return OffsetRange::null();
        };

        let available = self.entries[&start].min(max);
        let take = 1usize << (usize::BITS - 1 - available.leading_zeros());
        self.take_front(start, take)
    }

    /// Collects up to `size` bytes, preferring few large pieces. Returns the
    /// bytes collected.
    pub fn remove_discontiguous(&mut self, size: usize, out: &mut Vec<OffsetRange>) -> usize {
        let mut collected = 0;
        while collected < size {
            let remaining = size - collected;
            let mut r = self.remove_contiguous(remaining);
            if r.is_null() {
                let Some(start) = self.largest_entry() else {
                    break;
                };
                let whole = self.entries[&start];
                r = self.take_front(start, whole);
            }
            collected += r.size();
            out.push(r);
        }
        collected
    }

    fn largest_entry(&self) -> Option<usize> {
        let candidates = self.classes.iter().rev().find(|c| !c.is_empty());
        match candidates {
            Some(class) => class.iter().copied().max_by_key(|s| (self.entries[s], std::cmp::Reverse(*s))),
            None => self.entries.first_key_value().map(|(&s, _)| s),
        }
    }

    /// Removes up to `size` bytes from the highest addresses. Returns the
    /// bytes collected.
    pub fn remove_for_uncommit(&mut self, size: usize, out: &mut Vec<OffsetRange>) -> usize {
        let mut collected = 0;
        while collected < size {
            let Some((&start, &esize)) = self.entries.last_key_value() else {
                break;
            };
            let take = esize.min(size - collected);
            out.push(self.take_back(start, take));
            collected += take;
        }
        collected
    }

    /// Total cached bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Smallest `size()` seen since the last reset.
    #[must_use]
    pub fn min_size_watermark(&self) -> usize {
        self.min_size_watermark
    }

    pub fn reset_min_size_watermark(&mut self) {
        self.min_size_watermark = self.size;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = OffsetRange> + '_ {
        self.entries
            .iter()
            .map(|(&s, &sz)| OffsetRange::from_raw(s, sz))
    }

    /// # Panics
    ///
    /// Panics if the address index and the size-class lists disagree, two
    /// entries touch, or the running total is off.
    pub fn verify(&self) {
        let mut sum = 0;
        let mut prev_end: Option<usize> = None;
        for (&s, &sz) in &self.entries {
            assert!(sz > 0 && is_granule_aligned(s) && is_granule_aligned(sz));
            if let Some(end) = prev_end {
                assert!(end < s, "cached entry at {s:#x} touches previous end {end:#x}");
            }
            prev_end = Some(s + sz);
            sum += sz;
            for (i, class) in self.classes.iter().enumerate() {
                assert_eq!(
                    class.contains(&s),
                    size_class_index(sz) == Some(i),
                    "entry [{s:#x}, +{sz:#x}) misfiled in class {i}"
                );
            }
        }
        let filed: usize = self.classes.iter().map(BTreeSet::len).sum();
        let classed = self
            .entries
            .values()
            .filter(|&&sz| size_class_index(sz).is_some())
            .count();
        assert_eq!(filed, classed, "size-class lists hold stale entries");
        assert_eq!(sum, self.size, "cache size out of sync");
    }

    #[inline]
    fn debug_verify(&self) {
        #[cfg(debug_assertions)]
        self.verify();
    }

    fn link(&mut self, start: usize, size: usize) {
        self.entries.insert(start, size);
        if let Some(class) = size_class_index(size) {
            self.classes[class].insert(start);
        }
    }

    fn unlink(&mut self, start: usize) -> usize {
        let Some(size) = self.entries.remove(&start) else {
            panic!("no cached entry at {start:#x}");
        };
        if let Some(class) = size_class_index(size) {
            self.classes[class].remove(&start);
        }
        size
    }

    fn take_front(&mut self, start: usize, size: usize) -> OffsetRange {
        let esize = self.unlink(start);
        assert!(size <= esize);
        if esize > size {
            self.link(start + size, esize - size);
        }
        self.removed(size);
        OffsetRange::from_raw(start, size)
    }

    fn take_back(&mut self, start: usize, size: usize) -> OffsetRange {
        let esize = self.unlink(start);
        assert!(size <= esize);
        if esize > size {
            self.link(start, esize - size);
        }
        self.removed(size);
        OffsetRange::from_raw(start + esize - size, size)
    }

    fn removed(&mut self, size: usize) {
        self.size -= size;
        self.min_size_watermark = self.min_size_watermark.min(self.size);
        self.debug_verify();
    }
}
