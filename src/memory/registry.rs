//! Address-ordered free list of unused ranges.
//!
//! The registry owns every range it holds. Adjacent ranges are always merged,
//! so no two entries ever touch. Platforms that keep OS-level bookkeeping for
//! reserved-but-unused address space (placeholders) install a
//! [`RangeCallbacks`] strategy; the callbacks run before the logical
//! structure changes so the platform can split or coalesce its own records
//! first. Everywhere else the callbacks are no-ops.
//!
//! The registry is not internally synchronized. Each partition keeps its
//! registry behind the partition lock.

use super::range::{Range, RangeUnit};
use std::collections::BTreeMap;

/// Platform hooks kept in lock-step with the registry.
pub trait RangeCallbacks<U: RangeUnit>: Send {
    /// `range` is about to leave the registry.
    fn prepare_for_hand_out(&self, _range: Range<U>) {}

    /// `range` is about to be folded back into the registry.
    fn prepare_for_hand_back(&self, _range: Range<U>) {}

    /// The entry `from` is about to become `to`, a superset of it.
    fn grow(&self, _from: Range<U>, _to: Range<U>) {}

    /// The entry `from` is about to become `to`, a subset sharing one end.
    fn shrink(&self, _from: Range<U>, _to: Range<U>) {}
}

/// Callbacks for platforms with plain demand-paged virtual memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCallbacks;

impl<U: RangeUnit> RangeCallbacks<U> for NoopCallbacks {}

pub struct RangeRegistry<U: RangeUnit> {
    /// start -> size, both in raw units.
    entries: BTreeMap<usize, usize>,
    total: usize,
    /// Lowest start and highest end ever registered.
    limits: Option<(usize, usize)>,
    callbacks: Box<dyn RangeCallbacks<U>>,
}

impl<U: RangeUnit> Default for RangeRegistry<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: RangeUnit> RangeRegistry<U> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_callbacks(Box::new(NoopCallbacks))
    }

    #[must_use]
    pub fn with_callbacks(callbacks: Box<dyn RangeCallbacks<U>>) -> Self {
        Self {
            entries: BTreeMap::new(),
            total: 0,
            limits: None,
            callbacks,
        }
    }

    /// Seeds free space. The platform is not notified, including for merges
    /// with previously registered neighbours.
    pub fn register_range(&mut self, range: Range<U>) {
        assert!(!range.is_null() && !range.is_empty(), "registering {range:?}");
        let (lo, hi) = self
            .limits
            .map_or((range.start_raw(), range.end_raw()), |(lo, hi)| {
                (lo.min(range.start_raw()), hi.max(range.end_raw()))
            });
        self.limits = Some((lo, hi));
        self.insert_inner(range, false);
    }

    /// Returns `range` to the free pool, merging with adjacent entries.
    ///
    /// # Panics
    ///
    /// Panics if `range` overlaps an entry already in the registry.
    pub fn insert(&mut self, range: Range<U>) {
        assert!(!range.is_null() && !range.is_empty(), "inserting {range:?}");
        self.callbacks.prepare_for_hand_back(range);
        self.insert_inner(range, true);
    }

    fn insert_inner(&mut self, range: Range<U>, notify: bool) {
        let start = range.start_raw();
        let end = range.end_raw();

        let prev = self
            .entries
            .range(..start)
            .next_back()
            .map(|(&s, &sz)| Range::<U>::from_raw(s, sz));
        let next = self
            .entries
            .range(start..)
            .next()
            .map(|(&s, &sz)| Range::<U>::from_raw(s, sz));

        if let Some(p) = prev {
            assert!(p.end_raw() <= start, "{range:?} overlaps free {p:?}");
        }
        if let Some(n) = next {
            assert!(end <= n.start_raw(), "{range:?} overlaps free {n:?}");
        }

        let merge_prev = prev.filter(|p| p.end_raw() == start);
        let merge_next = next.filter(|n| n.start_raw() == end);

        match (merge_prev, merge_next) {
            (Some(p), Some(n)) => {
                let to = Range::from_raw(p.start_raw(), p.size() + range.size() + n.size());
                if notify {
                    self.callbacks.grow(p, to);
                }
                self.entries.remove(&n.start_raw());
                self.entries.insert(p.start_raw(), to.size());
            }
            (Some(p), None) => {
                let mut to = p;
                to.grow_from_back(range.size());
                if notify {
                    self.callbacks.grow(p, to);
                }
                self.entries.insert(p.start_raw(), to.size());
            }
            (None, Some(n)) => {
                let mut to = n;
                to.grow_from_front(range.size());
                if notify {
                    self.callbacks.grow(n, to);
                }
                self.entries.remove(&n.start_raw());
                self.entries.insert(to.start_raw(), to.size());
            }
            (None, None) => {
                self.entries.insert(start, range.size());
            }
        }

        self.total += range.size();
    }

    /// Lowest-addressed range of exactly `size`, carved from the first entry
    /// large enough. Null if no entry fits.
    pub fn remove_from_low(&mut self, size: usize) -> Range<U> {
        let found = self
            .entries
            .iter()
            .find(|&(_, &sz)| sz >= size)
            .map(|(&s, &sz)| Range::<U>::from_raw(s, sz));
        match found {
            Some(entry) => self.take_front(entry, size),
            None => Range::null(),
        }
    }

    /// Highest-addressed range of exactly `size`, carved from the last entry
    /// large enough. Null if no entry fits.
    pub fn remove_from_high(&mut self, size: usize) -> Range<U> {
        let found = self
            .entries
            .iter()
            .rev()
            .find(|&(_, &sz)| sz >= size)
            .map(|(&s, &sz)| Range::<U>::from_raw(s, sz));
        match found {
            Some(entry) => self.take_back(entry, size),
            None => Range::null(),
        }
    }

    /// Up to `size` units from the lowest entry. Null if empty.
    pub fn remove_from_low_at_most(&mut self, size: usize) -> Range<U> {
        let first = self
            .entries
            .iter()
            .next()
            .map(|(&s, &sz)| Range::<U>::from_raw(s, sz));
        match first {
            Some(entry) => {
                let take = entry.size().min(size);
                self.take_front(entry, take)
            }
            None => Range::null(),
        }
    }

    /// Collects ranges from the low end until `size` units are gathered or
    /// the registry runs dry. Returns the units collected.
    pub fn remove_from_low_many_at_most(&mut self, size: usize, out: &mut Vec<Range<U>>) -> usize {
        let mut collected = 0;
        while collected < size {
            let r = self.remove_from_low_at_most(size - collected);
            if r.is_null() {
                break;
            }
            collected += r.size();
            out.push(r);
        }
        collected
    }

    /// A single range of `size` if one fits, otherwise several. Nothing is
    /// removed unless the whole `size` can be satisfied.
    pub fn remove_from_low_exact_or_many(&mut self, size: usize, out: &mut Vec<Range<U>>) -> bool {
        let single = self.remove_from_low(size);
        if !single.is_null() {
            out.push(single);
            return true;
        }

        let mut many = Vec::new();
        let collected = self.remove_from_low_many_at_most(size, &mut many);
        if collected < size {
            for r in many {
                self.insert(r);
            }
            return false;
        }
        out.extend(many);
        true
    }

    /// Swaps the ranges in `in_out` for a `size`-unit request, preferring a
    /// single range.
    pub fn insert_and_remove_from_low_exact_or_many(
        &mut self,
        size: usize,
        in_out: &mut Vec<Range<U>>,
    ) -> bool {
        for r in in_out.drain(..) {
            self.insert(r);
        }
        self.remove_from_low_exact_or_many(size, in_out)
    }

    /// Removes the lowest entry without notifying the platform. Used when
    /// the address space behind it is being released.
    pub fn unregister_first(&mut self) -> Range<U> {
        match self.entries.pop_first() {
            Some((s, sz)) => {
                self.total -= sz;
                Range::from_raw(s, sz)
            }
            None => Range::null(),
        }
    }

    #[must_use]
    pub fn peek_low(&self) -> Range<U> {
        self.entries
            .iter()
            .next()
            .map_or(Range::null(), |(&s, &sz)| Range::from_raw(s, sz))
    }

    /// Span from the lowest registered start to the highest registered end.
    #[must_use]
    pub fn limits(&self) -> Range<U> {
        self.limits
            .map_or(Range::null(), |(lo, hi)| Range::from_raw(lo, hi - lo))
    }

    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<U>> + '_ {
        self.entries.iter().map(|(&s, &sz)| Range::from_raw(s, sz))
    }

    /// Checks ordering, disjointness, maximal merging and the size total.
    ///
    /// # Panics
    ///
    /// Panics on the first violated invariant.
    pub fn verify(&self) {
        let mut sum = 0;
        let mut prev_end: Option<usize> = None;
        for r in self.iter() {
            assert!(!r.is_empty(), "empty entry {r:?}");
            if let Some(end) = prev_end {
                assert!(end < r.start_raw(), "entry {r:?} touches or overlaps previous end {end:#x}");
            }
            prev_end = Some(r.end_raw());
            sum += r.size();
        }
        assert_eq!(sum, self.total, "registry total out of sync");
    }

    fn take_front(&mut self, entry: Range<U>, size: usize) -> Range<U> {
        let handed = if entry.size() == size {
            self.entries.remove(&entry.start_raw());
            entry
        } else {
            let mut to = entry;
            let front = to.shrink_from_front(size);
            self.callbacks.shrink(entry, to);
            self.entries.remove(&entry.start_raw());
            self.entries.insert(to.start_raw(), to.size());
            front
        };
        self.total -= size;
        self.callbacks.prepare_for_hand_out(handed);
        handed
    }

    fn take_back(&mut self, entry: Range<U>, size: usize) -> Range<U> {
        let handed = if entry.size() == size {
            self.entries.remove(&entry.start_raw());
            entry
        } else {
            let mut to = entry;
            let back = to.shrink_from_back(size);
            self.callbacks.shrink(entry, to);
            self.entries.insert(to.start_raw(), to.size());
            back
        };
        self.total -= size;
        self.callbacks.prepare_for_hand_out(handed);
        handed
    }
}
