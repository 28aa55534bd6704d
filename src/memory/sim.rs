//! In-process stand-in for the OS.
//!
//! `SimulatedVmOps` keeps a ledger of reservations, committed backing
//! granules and per-address mappings instead of touching real memory. It
//! asserts on misuse (mapping uncommitted memory, uncommitting mapped memory,
//! double commits) and can inject the failures the engine must survive.

use super::placeholder::PlaceholderMap;
use super::range::{GRANULE_SIZE, HeapOffset, is_granule_aligned};
use super::registry::RangeCallbacks;
use super::vm::{VmError, VmOps};
use crate::sync::{Mutex, lock};
use fixedbitset::FixedBitSet;
use std::collections::BTreeMap;
use std::io;

#[derive(Default)]
struct SimState {
    /// addr -> size
    reserved: BTreeMap<usize, usize>,
    blocked: Vec<(usize, usize)>,
    committed: FixedBitSet,
    /// Further bytes `commit` may bind before it starts failing.
    commit_budget: Option<usize>,
    /// Further bytes `uncommit` may release before it starts failing.
    uncommit_budget: Option<usize>,
    /// Successful map calls left before one is made to fail.
    map_countdown: Option<usize>,
    /// granule address -> backing offset
    mappings: BTreeMap<usize, usize>,
    /// backing granule -> number of addresses mapping it
    map_counts: BTreeMap<usize, usize>,
}

impl SimState {
    fn overlaps_reserved(&self, addr: usize, size: usize) -> bool {
        self.reserved
            .range(..addr + size)
            .next_back()
            .is_some_and(|(&s, &sz)| s + sz > addr)
    }

    fn is_reserved(&self, addr: usize, size: usize) -> bool {
        // Reservations never merge, so a valid range may span several.
        let mut cursor = addr;
        while cursor < addr + size {
            match self.reserved.range(..=cursor).next_back() {
                Some((&s, &sz)) if s + sz > cursor => cursor = s + sz,
                _ => return false,
            }
        }
        true
    }
}

pub struct SimulatedVmOps {
    state: Mutex<SimState>,
    placeholders: Option<PlaceholderMap>,
}

impl Default for SimulatedVmOps {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedVmOps {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            placeholders: None,
        }
    }

    /// Simulates a platform that tracks reserved address space as
    /// placeholders in every view.
    #[must_use]
    pub fn with_placeholders(view_bases: &[usize]) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            placeholders: Some(PlaceholderMap::new(view_bases)),
        }
    }

    #[must_use]
    pub fn placeholders(&self) -> Option<&PlaceholderMap> {
        self.placeholders.as_ref()
    }

    /// Limits how many more bytes can be committed. `None` lifts the limit.
    pub fn set_commit_limit(&self, limit: Option<usize>) {
        lock(&self.state).commit_budget = limit;
    }

    /// Limits how many more bytes can be uncommitted. `None` lifts the limit.
    pub fn set_uncommit_limit(&self, limit: Option<usize>) {
        lock(&self.state).uncommit_budget = limit;
    }

    /// Makes reservations touching `[addr, addr + size)` fail.
    pub fn block(&self, addr: usize, size: usize) {
        lock(&self.state).blocked.push((addr, size));
    }

    /// Lets `successes` more map calls through, then fails the next one.
    pub fn fail_map_after(&self, successes: usize) {
        lock(&self.state).map_countdown = Some(successes);
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        lock(&self.state).reserved.values().sum()
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        lock(&self.state).committed.count_ones(..) * GRANULE_SIZE
    }

    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        lock(&self.state).mappings.len() * GRANULE_SIZE
    }

    /// Backing offset mapped at `addr`, if any.
    #[must_use]
    pub fn backing_at(&self, addr: usize) -> Option<usize> {
        let granule = addr & !(GRANULE_SIZE - 1);
        lock(&self.state)
            .mappings
            .get(&granule)
            .map(|&backing| backing + (addr - granule))
    }
}

impl VmOps for SimulatedVmOps {
    fn reserve(&self, addr: usize, size: usize) -> bool {
        assert!(is_granule_aligned(addr) && is_granule_aligned(size) && size > 0);
        let mut state = lock(&self.state);
        let blocked = state
            .blocked
            .iter()
            .any(|&(b, bsz)| b < addr + size && addr < b + bsz);
        if blocked || state.overlaps_reserved(addr, size) {
            return false;
        }
        state.reserved.insert(addr, size);
        drop(state);
        if let Some(placeholders) = &self.placeholders {
            placeholders.create(addr, size);
        }
        true
    }

    fn unreserve(&self, addr: usize, size: usize) {
        let mut state = lock(&self.state);
        let inside: Vec<usize> = state
            .reserved
            .range(addr..addr + size)
            .map(|(&s, _)| s)
            .collect();
        for s in inside {
            state.reserved.remove(&s);
        }
        let end = addr + size;
        state.mappings.retain(|&a, _| a < addr || a >= end);
        drop(state);
        if let Some(placeholders) = &self.placeholders {
            placeholders.release(addr, size);
        }
    }

    fn commit(&self, backing_offset: usize, size: usize, _numa_id: u32) -> usize {
        assert!(is_granule_aligned(backing_offset) && is_granule_aligned(size));
        let mut state = lock(&self.state);
        let allowed = state.commit_budget.map_or(size, |budget| budget.min(size));
        let first = backing_offset / GRANULE_SIZE;
        let count = allowed / GRANULE_SIZE;
        if state.committed.len() < first + count {
            state.committed.grow(first + count);
        }
        assert_eq!(
            state.committed.count_ones(first..first + count),
            0,
            "backing [{backing_offset:#x}, +{allowed:#x}) committed twice"
        );
        state.committed.set_range(first..first + count, true);
        if let Some(budget) = state.commit_budget.as_mut() {
            *budget -= allowed;
        }
        allowed
    }

    fn uncommit(&self, backing_offset: usize, size: usize) -> usize {
        let mut state = lock(&self.state);
        let allowed = state.uncommit_budget.map_or(size, |budget| budget.min(size));
        let first = backing_offset / GRANULE_SIZE;
        let count = allowed / GRANULE_SIZE;
        for g in first..first + count {
            assert!(
                state.committed.contains(g),
                "uncommitting backing granule {g} which is not committed"
            );
            assert!(
                !state.map_counts.contains_key(&g),
                "uncommitting backing granule {g} while it is mapped"
            );
        }
        if count > 0 {
            state.committed.set_range(first..first + count, false);
        }
        if let Some(budget) = state.uncommit_budget.as_mut() {
            *budget -= allowed;
        }
        allowed
    }

    fn map(&self, addr: usize, size: usize, backing_offset: usize) -> Result<(), VmError> {
        let mut state = lock(&self.state);
        match state.map_countdown {
            Some(0) => {
                state.map_countdown = None;
                return Err(VmError::MapFailed {
                    addr,
                    size,
                    source: io::Error::from_raw_os_error(libc::ENOMEM),
                });
            }
            Some(n) => state.map_countdown = Some(n - 1),
            None => {}
        }
        assert!(
            state.is_reserved(addr, size),
            "mapping unreserved [{addr:#x}, +{size:#x})"
        );
        for off in (0..size).step_by(GRANULE_SIZE) {
            let g = (backing_offset + off) / GRANULE_SIZE;
            assert!(
                state.committed.contains(g),
                "mapping uncommitted backing granule {g} at {:#x}",
                addr + off
            );
            let prev = state.mappings.insert(addr + off, backing_offset + off);
            assert!(prev.is_none(), "address {:#x} mapped twice", addr + off);
            *state.map_counts.entry(g).or_insert(0) += 1;
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> Result<(), VmError> {
        let mut state = lock(&self.state);
        for off in (0..size).step_by(GRANULE_SIZE) {
            let Some(backing) = state.mappings.remove(&(addr + off)) else {
                panic!("unmapping {:#x} which is not mapped", addr + off);
            };
            let g = backing / GRANULE_SIZE;
            if let Some(count) = state.map_counts.get_mut(&g) {
                *count -= 1;
                if *count == 0 {
                    state.map_counts.remove(&g);
                }
            }
        }
        Ok(())
    }

    fn range_callbacks(&self) -> Option<Box<dyn RangeCallbacks<HeapOffset>>> {
        self.placeholders
            .clone()
            .map(|p| Box::new(p) as Box<dyn RangeCallbacks<HeapOffset>>)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const G: usize = GRANULE_SIZE;
    const BASE: usize = 1 << 42;

    #[test]
    fn test_commit_limit_yields_prefix() {
        let vm = SimulatedVmOps::new();
        vm.set_commit_limit(Some(3 * G));
        assert_eq!(vm.commit(0, 2 * G, 0), 2 * G);
        assert_eq!(vm.commit(2 * G, 4 * G, 0), G);
        assert_eq!(vm.commit(8 * G, G, 0), 0);
        assert_eq!(vm.committed_bytes(), 3 * G);
    }

    #[test]
    fn test_blocked_reservation_fails() {
        let vm = SimulatedVmOps::new();
        vm.block(BASE + 4 * G, G);
        assert!(!vm.reserve(BASE, 8 * G));
        assert!(vm.reserve(BASE, 4 * G));
        assert!(!vm.reserve(BASE + 2 * G, 2 * G), "overlap");
        assert_eq!(vm.reserved_bytes(), 4 * G);
    }

    #[test]
    fn test_map_tracks_backing_per_view() {
        let vm = SimulatedVmOps::new();
        assert!(vm.reserve(BASE, 2 * G));
        assert!(vm.reserve(2 * BASE, 2 * G));
        vm.commit(6 * G, 2 * G, 0);
        vm.map(BASE, 2 * G, 6 * G).expect("map");
        vm.map(2 * BASE, 2 * G, 6 * G).expect("map");
        assert_eq!(vm.backing_at(BASE + G + 8), Some(7 * G + 8));
        assert_eq!(vm.backing_at(2 * BASE), Some(6 * G));
        assert_eq!(vm.mapped_bytes(), 4 * G);

        vm.unmap(BASE, 2 * G).expect("unmap");
        vm.unmap(2 * BASE, 2 * G).expect("unmap");
        assert_eq!(vm.uncommit(6 * G, 2 * G), 2 * G);
    }

    #[test]
    fn test_injected_map_failure() {
        let vm = SimulatedVmOps::new();
        assert!(vm.reserve(BASE, G));
        vm.commit(0, G, 0);
        vm.fail_map_after(0);
        assert!(matches!(vm.map(BASE, G, 0), Err(VmError::MapFailed { .. })));
        vm.map(BASE, G, 0).expect("second attempt maps");
    }

    #[test]
    #[should_panic(expected = "while it is mapped")]
    fn test_uncommit_of_mapped_memory_is_caught() {
        let vm = SimulatedVmOps::new();
        assert!(vm.reserve(BASE, G));
        vm.commit(0, G, 0);
        vm.map(BASE, G, 0).expect("map");
        vm.uncommit(0, G);
    }

    #[test]
    fn test_placeholders_follow_reservations() {
        let vm = SimulatedVmOps::with_placeholders(&[BASE]);
        assert!(vm.reserve(BASE, 4 * G));
        assert!(vm.range_callbacks().is_some());
        let placeholders = vm.placeholders().expect("placeholders");
        assert_eq!(placeholders.len(), 1);
        vm.unreserve(BASE, 4 * G);
        assert!(placeholders.is_empty());
    }
}
