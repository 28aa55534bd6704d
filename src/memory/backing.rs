use super::range::{BackingIndex, IndexRange, Range};
use super::registry::RangeRegistry;
use fixedbitset::FixedBitSet;

/// Free backing indices of one partition.
///
/// Indices are globally unique: each partition owns the slice
/// `[first, first + count)`. Handing out prefers the lowest indices so the
/// backing store stays dense.
pub struct BackingIndexPool {
    free: RangeRegistry<BackingIndex>,
    /// Set bit == index is free. Offset by `first`.
    free_mask: FixedBitSet,
    first: usize,
    count: usize,
}

impl BackingIndexPool {
    #[must_use]
    pub fn new(first: u32, count: usize) -> Self {
        let first = first as usize;
        let mut free = RangeRegistry::new();
        let mut free_mask = FixedBitSet::with_capacity(count);
        if count > 0 {
            free.register_range(IndexRange::from_raw(first, count));
            free_mask.insert_range(..);
        }
        Self {
            free,
            free_mask,
            first,
            count,
        }
    }

    /// Draws up to `count` indices from the low end. Returns how many were
    /// drawn; they are appended to `out` as runs.
    pub fn alloc(&mut self, count: usize, out: &mut Vec<IndexRange>) -> usize {
        let start = out.len();
        let drawn = self.free.remove_from_low_many_at_most(count, out);
        for r in &out[start..] {
            self.mark(*r, false);
        }
        drawn
    }

    /// # Panics
    ///
    /// Panics if any index in `range` is already free or outside the pool.
    pub fn free(&mut self, range: IndexRange) {
        if range.is_empty() {
            return;
        }
        self.mark(range, true);
        self.free.insert(range);
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.total_size()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_free(&self, index: BackingIndex) -> bool {
        let raw = index.raw() as usize;
        raw >= self.first && self.free_mask.contains(raw - self.first)
    }

    fn mark(&mut self, range: Range<BackingIndex>, free: bool) {
        assert!(
            range.start_raw() >= self.first && range.end_raw() <= self.first + self.count,
            "index range {range:?} outside pool [{}, +{})",
            self.first,
            self.count
        );
        let lo = range.start_raw() - self.first;
        let hi = range.end_raw() - self.first;
        if free {
            assert!(
                self.free_mask.count_ones(lo..hi) == 0,
                "double free of backing indices in {range:?}"
            );
        } else {
            debug_assert!(
                self.free_mask.count_ones(lo..hi) == hi - lo,
                "handing out busy backing indices {range:?}"
            );
        }
        self.free_mask.set_range(lo..hi, free);
    }
}
