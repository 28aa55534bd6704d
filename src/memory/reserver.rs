use super::range::{GRANULE_SIZE, OffsetRange, align_down_granule, align_up_granule};
use super::stats;
use super::vm::VmOps;

/// Start offsets tried when looking for one contiguous reservation.
const CONTIGUOUS_PROBES: usize = 8192;

/// Reservations are split no finer than this share of the request.
const MIN_RANGE_DIVISOR: usize = 100;

/// Reserves heap offset ranges in every view.
///
/// An offset range `[s, s + n)` stands for the address ranges
/// `[base + s, base + s + n)` of all view bases at once: it is only
/// considered reserved when every view could be reserved.
pub struct Reserver<'a> {
    vm: &'a dyn VmOps,
    views: &'a [usize],
    offset_max: usize,
}

impl<'a> Reserver<'a> {
    #[must_use]
    pub fn new(vm: &'a dyn VmOps, views: &'a [usize], offset_max: usize) -> Self {
        Self {
            vm,
            views,
            offset_max: align_down_granule(offset_max),
        }
    }

    /// Reserves up to `size` bytes of offset space, contiguously if possible.
    /// Returns the reserved ranges in address order; their total may fall
    /// short of `size`.
    pub fn reserve(&self, size: usize) -> Vec<OffsetRange> {
        let size = align_down_granule(size).min(self.offset_max);
        if size == 0 {
            return Vec::new();
        }

        let contiguous = self.reserve_contiguous(size);
        if !contiguous.is_null() {
            log::debug!("reserved contiguous {contiguous:?}");
            return vec![contiguous];
        }

        let mut out = Vec::new();
        let reserved = self.reserve_discontiguous(size, &mut out);
        log::debug!(
            "reserved {reserved:#x} of {size:#x} bytes in {} discontiguous ranges",
            out.len()
        );
        out
    }

    fn reserve_contiguous(&self, size: usize) -> OffsetRange {
        let span = self.offset_max - size;
        let increment = align_up_granule(span / CONTIGUOUS_PROBES).max(GRANULE_SIZE);
        (0..=span)
            .step_by(increment)
            .take(CONTIGUOUS_PROBES)
            .map(|start| OffsetRange::from_raw(start, size))
            .find(|&r| self.reserve_range(r))
            .unwrap_or(OffsetRange::null())
    }

    fn reserve_discontiguous(&self, size: usize, out: &mut Vec<OffsetRange>) -> usize {
        let min_range = align_up_granule(size / MIN_RANGE_DIVISOR).max(GRANULE_SIZE);
        let mut reserved = 0;
        let mut start = 0;
        while reserved < size && start < self.offset_max {
            let remaining = (size - reserved).min(self.offset_max - start);
            reserved += self.reserve_bisect(OffsetRange::from_raw(start, remaining), min_range, out);
            start += remaining;
        }
        reserved
    }

    fn reserve_bisect(&self, range: OffsetRange, min_range: usize, out: &mut Vec<OffsetRange>) -> usize {
        if range.size() < min_range {
            return 0;
        }
        if self.reserve_range(range) {
            out.push(range);
            return range.size();
        }
        let half = align_down_granule(range.size() / 2);
        if half < min_range {
            return 0;
        }
        let (low, high) = (range.first_part(half), range.last_part(half));
        self.reserve_bisect(low, min_range, out) + self.reserve_bisect(high, min_range, out)
    }

    /// Reserves `range` in every view, or in none.
    pub fn reserve_range(&self, range: OffsetRange) -> bool {
        for (i, &base) in self.views.iter().enumerate() {
            if !self.vm.reserve(base + range.start_raw(), range.size()) {
                for &done in &self.views[..i] {
                    self.vm.unreserve(done + range.start_raw(), range.size());
                }
                return false;
            }
        }
        stats::TOTAL_RESERVED.add(range.size() * self.views.len());
        true
    }

    pub fn unreserve(&self, range: OffsetRange) {
        for &base in self.views {
            self.vm.unreserve(base + range.start_raw(), range.size());
        }
        stats::TOTAL_RESERVED.sub(range.size() * self.views.len());
    }
}
