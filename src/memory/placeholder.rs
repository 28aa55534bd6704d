//! Simulated placeholder ledger.
//!
//! Some platforms track reserved-but-unused address space as OS objects
//! ("placeholders") that must be split before part of them can be mapped and
//! coalesced again afterwards. [`PlaceholderMap`] keeps that ledger in memory
//! for every view and implements [`RangeCallbacks`] so a registry drives it
//! exactly like it would drive the real thing. Every operation asserts that
//! the ranges it touches are tiled by existing placeholders, so a callback
//! issued in the wrong order or with the wrong range panics.

use super::range::{GRANULE_SIZE, HeapOffset, OffsetRange};
use super::registry::RangeCallbacks;
use crate::sync::{Arc, Mutex, lock};
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct PlaceholderMap {
    inner: Arc<Mutex<Ledger>>,
}

struct Ledger {
    view_bases: Vec<usize>,
    /// address -> size
    placeholders: BTreeMap<usize, usize>,
}

impl Ledger {
    /// Removes the placeholders tiling `[addr, addr + size)`.
    fn take_tiling(&mut self, addr: usize, size: usize) {
        let end = addr + size;
        let mut cursor = addr;
        while cursor < end {
            let Some(sz) = self.placeholders.remove(&cursor) else {
                panic!("no placeholder at {cursor:#x} while tiling [{addr:#x}, {end:#x})");
            };
            assert!(
                cursor + sz <= end,
                "placeholder [{cursor:#x}, +{sz:#x}) crosses the end of [{addr:#x}, {end:#x})"
            );
            cursor += sz;
        }
    }

    fn put(&mut self, addr: usize, size: usize) {
        if size > 0 {
            self.placeholders.insert(addr, size);
        }
    }

    fn addresses(&self, range: OffsetRange) -> Vec<usize> {
        self.view_bases
            .iter()
            .map(|base| base + range.start_raw())
            .collect()
    }
}

impl PlaceholderMap {
    #[must_use]
    pub fn new(view_bases: &[usize]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ledger {
                view_bases: view_bases.to_vec(),
                placeholders: BTreeMap::new(),
            })),
        }
    }

    /// Records a freshly reserved address range as one placeholder.
    pub fn create(&self, addr: usize, size: usize) {
        let mut ledger = lock(&self.inner);
        if let Some((&s, &sz)) = ledger.placeholders.range(..addr + size).next_back() {
            assert!(s + sz <= addr, "placeholder [{addr:#x}, +{size:#x}) overlaps [{s:#x}, +{sz:#x})");
        }
        ledger.put(addr, size);
    }

    /// Drops every placeholder inside `[addr, addr + size)`, splitting any
    /// that straddle the boundaries.
    pub fn release(&self, addr: usize, size: usize) {
        let mut ledger = lock(&self.inner);
        let end = addr + size;
        let inside: Vec<(usize, usize)> = ledger
            .placeholders
            .range(..end)
            .filter(|&(&s, &sz)| s + sz > addr)
            .map(|(&s, &sz)| (s, sz))
            .collect();
        for (s, sz) in inside {
            ledger.placeholders.remove(&s);
            if s < addr {
                ledger.put(s, addr - s);
            }
            if s + sz > end {
                ledger.put(end, s + sz - end);
            }
        }
    }

    /// Placeholders of the first view, as heap offsets.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OffsetRange> {
        let ledger = lock(&self.inner);
        let Some(&base) = ledger.view_bases.first() else {
            return Vec::new();
        };
        ledger
            .placeholders
            .range(base..)
            .take_while(|&(&s, _)| {
                ledger
                    .view_bases
                    .iter()
                    .filter(|&&b| b > base)
                    .all(|&b| s < b)
            })
            .map(|(&s, &sz)| OffsetRange::from_raw(s - base, sz))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).placeholders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RangeCallbacks<HeapOffset> for PlaceholderMap {
    fn prepare_for_hand_out(&self, range: OffsetRange) {
        let mut ledger = lock(&self.inner);
        for addr in ledger.addresses(range) {
            ledger.take_tiling(addr, range.size());
            for g in (0..range.size()).step_by(GRANULE_SIZE) {
                ledger.put(addr + g, GRANULE_SIZE);
            }
        }
    }

    fn prepare_for_hand_back(&self, range: OffsetRange) {
        let mut ledger = lock(&self.inner);
        for addr in ledger.addresses(range) {
            ledger.take_tiling(addr, range.size());
            ledger.put(addr, range.size());
        }
    }

    fn grow(&self, from: OffsetRange, to: OffsetRange) {
        assert!(to.contains(&from), "grow {from:?} -> {to:?}");
        let mut ledger = lock(&self.inner);
        for addr in ledger.addresses(to) {
            ledger.take_tiling(addr, to.size());
            ledger.put(addr, to.size());
        }
    }

    fn shrink(&self, from: OffsetRange, to: OffsetRange) {
        assert!(
            from.contains(&to) && (from.start() == to.start() || from.end() == to.end()),
            "shrink {from:?} -> {to:?}"
        );
        let removed = if from.start() == to.start() {
            OffsetRange::from_raw(to.end_raw(), from.size() - to.size())
        } else {
            OffsetRange::from_raw(from.start_raw(), from.size() - to.size())
        };
        let mut ledger = lock(&self.inner);
        let bases = ledger.view_bases.clone();
        for base in bases {
            ledger.take_tiling(base + from.start_raw(), from.size());
            ledger.put(base + to.start_raw(), to.size());
            ledger.put(base + removed.start_raw(), removed.size());
        }
    }
}
