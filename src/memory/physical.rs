//! Physical backing memory of one partition.
//!
//! Committed heap granules are backed by granules of a shared backing store,
//! identified by [`BackingIndex`]. The manager owns the partition's free
//! indices and the table translating committed heap offsets to indices.
//! Its lock only covers that bookkeeping; every OS call runs unlocked, which
//! is safe because callers own the ranges they pass in exclusively.

use super::backing::BackingIndexPool;
use super::range::{BackingIndex, GRANULE_SIZE, HeapOffset, IndexRange, OffsetRange, RangeUnit};
use super::stats;
use super::vm::VmOps;
use crate::sync::{Arc, Mutex, lock};
use std::collections::BTreeMap;

struct PhysicalState {
    pool: BackingIndexPool,
    /// heap granule number -> backing index
    table: BTreeMap<usize, BackingIndex>,
}

/// A stretch of heap offsets backed by consecutive indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Run {
    offset: HeapOffset,
    index: BackingIndex,
    granules: usize,
}

impl Run {
    fn bytes(&self) -> usize {
        self.granules * GRANULE_SIZE
    }
}

pub struct PhysicalMemoryManager {
    vm: Arc<dyn VmOps>,
    numa_id: u32,
    state: Mutex<PhysicalState>,
}

impl PhysicalMemoryManager {
    /// Manages the backing indices `[first_index, first_index + count)`.
    #[must_use]
    pub fn new(vm: Arc<dyn VmOps>, numa_id: u32, first_index: u32, count: usize) -> Self {
        Self {
            vm,
            numa_id,
            state: Mutex::new(PhysicalState {
                pool: BackingIndexPool::new(first_index, count),
                table: BTreeMap::new(),
            }),
        }
    }

    /// Binds backing memory to `range`. Returns the length of the committed
    /// prefix; the rest of `range` is left without backing.
    pub fn commit(&self, range: OffsetRange) -> usize {
        let granules = range.size() / GRANULE_SIZE;
        let mut drawn = Vec::new();
        let available = lock(&self.state).pool.alloc(granules, &mut drawn);
        if available < granules {
            log::warn!(
                "node {}: backing pool short by {} granules for {range:?}",
                self.numa_id,
                granules - available
            );
        }

        let mut committed = 0;
        let mut failed = false;
        for r in &drawn {
            let bytes = r.size() * GRANULE_SIZE;
            let done = self.vm.commit(r.start().backing_offset(), bytes, self.numa_id);
            committed += done;
            if done < bytes {
                failed = true;
                break;
            }
        }
        if failed {
            log::warn!(
                "node {}: partial commit of {range:?}: {committed:#x} bytes",
                self.numa_id
            );
        }

        let mut state = lock(&self.state);
        let mut granule = range.start().granule();
        let mut remaining = committed / GRANULE_SIZE;
        for mut r in drawn {
            let used = remaining.min(r.size());
            for index in r.start_raw()..r.start_raw() + used {
                let prev = state.table.insert(granule, BackingIndex::from_raw(index));
                assert!(prev.is_none(), "heap granule {granule} committed twice");
                granule += 1;
            }
            remaining -= used;
            r.shrink_from_front(used);
            if !r.is_empty() {
                state.pool.free(r);
            }
        }
        drop(state);

        stats::TOTAL_COMMITTED.add(committed);
        committed
    }

    /// Releases the backing memory of `range`. Returns the length of the
    /// uncommitted prefix; the rest stays committed.
    pub fn uncommit(&self, range: OffsetRange) -> usize {
        let runs = self.runs(range);
        let mut uncommitted = 0;
        for run in &runs {
            let done = self.vm.uncommit(run.index.backing_offset(), run.bytes());
            uncommitted += done;
            if done < run.bytes() {
                log::warn!(
                    "node {}: partial uncommit of {range:?}: {uncommitted:#x} bytes",
                    self.numa_id
                );
                break;
            }
        }

        let released = OffsetRange::new(range.start(), uncommitted);
        let indices = self.detach(released);
        let mut state = lock(&self.state);
        for r in indices {
            state.pool.free(r);
        }
        drop(state);

        stats::TOTAL_COMMITTED.sub(uncommitted);
        uncommitted
    }

    /// Maps the committed `range` at every view. Returns the length of the
    /// prefix mapped in all views; nothing past it is left mapped.
    pub fn map(&self, range: OffsetRange, views: &[usize]) -> usize {
        let mut mapped = 0;
        'runs: for run in self.runs(range) {
            for (i, &base) in views.iter().enumerate() {
                let addr = base + run.offset.raw();
                if let Err(e) = self.vm.map(addr, run.bytes(), run.index.backing_offset()) {
                    log::warn!("node {}: {e}", self.numa_id);
                    for &done in &views[..i] {
                        self.unmap_or_die(done + run.offset.raw(), run.bytes());
                    }
                    break 'runs;
                }
            }
            mapped += run.bytes();
        }
        stats::TOTAL_MAPPED.add(mapped * views.len());
        mapped
    }

    /// # Panics
    ///
    /// Panics if the OS refuses to unmap; the address space can no longer
    /// be trusted at that point.
    pub fn unmap(&self, range: OffsetRange, views: &[usize]) {
        for &base in views {
            self.unmap_or_die(base + range.start_raw(), range.size());
        }
        stats::TOTAL_MAPPED.sub(range.size() * views.len());
    }

    fn unmap_or_die(&self, addr: usize, size: usize) {
        if let Err(e) = self.vm.unmap(addr, size) {
            panic!("address space corrupted: {e}");
        }
    }

    /// Detaches the backing indices of committed `range`, in offset order.
    /// The memory stays committed; ownership of the indices moves to the
    /// caller until [`install`](Self::install) re-attaches them.
    pub fn take(&self, range: OffsetRange) -> Vec<IndexRange> {
        self.detach(range)
    }

    /// Attaches `indices` to `ranges`, both consumed in order.
    ///
    /// # Panics
    ///
    /// Panics if the two lists cover a different number of granules or a
    /// target granule is already committed.
    pub fn install(&self, ranges: &[OffsetRange], indices: &[IndexRange]) {
        let total_ranges: usize = ranges.iter().map(|r| r.size() / GRANULE_SIZE).sum();
        let total_indices: usize = indices.iter().map(IndexRange::size).sum();
        assert_eq!(total_ranges, total_indices, "install granule count mismatch");

        let mut state = lock(&self.state);
        let mut source = indices.iter().flat_map(|r| r.start_raw()..r.end_raw());
        for r in ranges {
            let first = r.start().granule();
            for granule in first..first + r.size() / GRANULE_SIZE {
                let Some(index) = source.next() else {
                    unreachable!("install granule count checked above");
                };
                let prev = state.table.insert(granule, BackingIndex::from_raw(index));
                assert!(prev.is_none(), "heap granule {granule} committed twice");
            }
        }
    }

    /// Bytes of backing still free in this partition's pool.
    #[must_use]
    pub fn available(&self) -> usize {
        lock(&self.state).pool.available() * GRANULE_SIZE
    }

    /// Bytes currently committed through this manager.
    #[must_use]
    pub fn committed(&self) -> usize {
        lock(&self.state).table.len() * GRANULE_SIZE
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        lock(&self.state).pool.capacity() * GRANULE_SIZE
    }

    #[must_use]
    pub fn is_committed(&self, offset: HeapOffset) -> bool {
        lock(&self.state).table.contains_key(&offset.granule())
    }

    fn runs(&self, range: OffsetRange) -> Vec<Run> {
        let state = lock(&self.state);
        let mut runs: Vec<Run> = Vec::new();
        let first = range.start().granule();
        for granule in first..first + range.size() / GRANULE_SIZE {
            let Some(&index) = state.table.get(&granule) else {
                panic!("heap granule {granule} of {range:?} is not committed");
            };
            match runs.last_mut() {
                Some(run) if run.index.raw() as usize + run.granules == index.raw() as usize => {
                    run.granules += 1;
                }
                _ => runs.push(Run {
                    offset: HeapOffset::new(granule * GRANULE_SIZE),
                    index,
                    granules: 1,
                }),
            }
        }
        runs
    }

    fn detach(&self, range: OffsetRange) -> Vec<IndexRange> {
        let mut state = lock(&self.state);
        let mut out: Vec<IndexRange> = Vec::new();
        let first = range.start().granule();
        for granule in first..first + range.size() / GRANULE_SIZE {
            let Some(index) = state.table.remove(&granule) else {
                panic!("heap granule {granule} of {range:?} is not committed");
            };
            let raw = index.raw() as usize;
            match out.last_mut() {
                Some(last) if last.end_raw() == raw => last.grow_from_back(1),
                _ => out.push(IndexRange::from_raw(raw, 1)),
            }
        }
        out
    }
}
