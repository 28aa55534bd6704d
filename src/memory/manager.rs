use std::time::Duration;

use super::partition::{Partition, PartitionStats};
use super::physical::PhysicalMemoryManager;
use super::range::{GRANULE_SIZE, HeapOffset, OffsetRange, align_down_granule, is_granule_aligned};
use super::registry::RangeRegistry;
use super::reserver::Reserver;
use super::stats;
#[cfg(not(loom))]
use super::uncommitter::Uncommitter;
use super::vm::{VmError, VmOps, platform_vm_ops};
use crate::sync::Arc;

const MIB: usize = 1024 * 1024;
const GIB: usize = 1024 * MIB;
const TIB: usize = 1024 * GIB;

#[derive(Debug, thiserror::Error)]
pub enum HeapSpaceError {
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),
    #[error("reserved {reserved:#x} bytes of address space, at least {required:#x} required")]
    ReservationShortfall { reserved: usize, required: usize },
    #[error("node {numa_id}: could not commit initial capacity of {size:#x} bytes")]
    InitialCommitFailed { numa_id: u32, size: usize },
    #[error("could not start uncommitter: {0}")]
    UncommitterFailed(#[source] std::io::Error),
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Startup parameters of a [`HeapSpace`].
///
/// Every size is in bytes and must be a multiple of [`GRANULE_SIZE`].
#[derive(Clone, Debug)]
pub struct HeapSpaceConfig {
    /// Upper bound on committed memory across all partitions. Default: 1 GiB.
    pub max_capacity: usize,

    /// Committed and cached at startup. Default: 32 MiB.
    pub initial_capacity: usize,

    /// Never uncommitted below this. Startup fails if not even this much
    /// address space can be reserved. Default: 0.
    pub min_capacity: usize,

    /// Number of partitions. Default: 1.
    pub numa_nodes: u32,

    /// Address space reserved per byte of `max_capacity`. Default: 16.
    pub virtual_to_physical_ratio: usize,

    /// Size of the offset space reservations are probed in. Default: 4 TiB.
    pub offset_max: usize,

    /// Base address of every view the heap is mapped into.
    /// Default: a single view at 4 TiB.
    pub view_bases: Vec<usize>,

    /// Run one background uncommitter per partition. Default: true.
    pub uncommit_enabled: bool,

    /// Time between uncommit passes. Default: 300 s.
    pub uncommit_interval: Duration,

    /// Bytes uncommitted per partition per pass. Default: unlimited.
    pub uncommit_limit: usize,
}

impl Default for HeapSpaceConfig {
    fn default() -> Self {
        Self {
            max_capacity: GIB,
            initial_capacity: 32 * MIB,
            min_capacity: 0,
            numa_nodes: 1,
            virtual_to_physical_ratio: 16,
            offset_max: 4 * TIB,
            view_bases: vec![4 * TIB],
            uncommit_enabled: true,
            uncommit_interval: Duration::from_secs(300),
            uncommit_limit: usize::MAX,
        }
    }
}

impl HeapSpaceConfig {
    /// Checks the sizes and counts against each other.
    ///
    /// # Errors
    ///
    /// Returns [`HeapSpaceError::InvalidConfig`] naming the first problem.
    pub fn validate(&self) -> Result<(), HeapSpaceError> {
        let invalid = |msg: String| Err(HeapSpaceError::InvalidConfig(msg));
        for (name, value) in [
            ("max_capacity", self.max_capacity),
            ("initial_capacity", self.initial_capacity),
            ("min_capacity", self.min_capacity),
            ("offset_max", self.offset_max),
        ] {
            if !is_granule_aligned(value) {
                return invalid(format!("{name} {value:#x} is not granule aligned"));
            }
        }
        if self.numa_nodes == 0 {
            return invalid("numa_nodes must be at least 1".into());
        }
        let nodes = self.numa_nodes as usize;
        if self.max_capacity < nodes * GRANULE_SIZE {
            return invalid(format!(
                "max_capacity {:#x} gives a partition less than one granule",
                self.max_capacity
            ));
        }
        if self.initial_capacity > self.max_capacity || self.min_capacity > self.max_capacity {
            return invalid("initial_capacity and min_capacity must not exceed max_capacity".into());
        }
        if self.virtual_to_physical_ratio == 0 {
            return invalid("virtual_to_physical_ratio must be at least 1".into());
        }
        if self.offset_max < self.max_capacity {
            return invalid(format!("offset_max {:#x} is below max_capacity", self.offset_max));
        }
        if self.view_bases.is_empty() {
            return invalid("at least one view is required".into());
        }
        for (i, &base) in self.view_bases.iter().enumerate() {
            if !is_granule_aligned(base) {
                return invalid(format!("view {i} base {base:#x} is not granule aligned"));
            }
            let Some(end) = base.checked_add(self.offset_max) else {
                return invalid(format!("view {i} at {base:#x} runs past the address space"));
            };
            // Earlier bases already passed the overflow check.
            let overlaps = self.view_bases[..i]
                .iter()
                .any(|&other| base < other + self.offset_max && other < end);
            if overlaps {
                return invalid(format!("view {i} at {base:#x} overlaps another view"));
            }
        }
        if self.uncommit_enabled && self.uncommit_interval.is_zero() {
            return invalid("uncommit_interval must be non-zero".into());
        }
        Ok(())
    }
}

/// Engine-wide snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapSpaceStats {
    pub reserved: usize,
    pub max_capacity: usize,
    pub capacity: usize,
    pub used: usize,
    pub cached: usize,
    pub partitions: Vec<PartitionStats>,
}

/// Reserved heap address space split into NUMA partitions.
///
/// Allocation hands out mapped offset ranges; the host turns an offset into
/// an address per view with [`HeapSpace::address`].
pub struct HeapSpace {
    vm: Arc<dyn VmOps>,
    views: Vec<usize>,
    offset_max: usize,
    reserved: Vec<OffsetRange>,
    max_capacity: usize,
    partitions: Vec<Arc<Partition>>,
    #[cfg(not(loom))]
    uncommitters: Vec<Uncommitter>,
}

impl HeapSpace {
    /// Reserves address space, splits it across partitions and commits the
    /// initial capacity.
    ///
    /// # Errors
    ///
    /// Fails on an invalid config, when less than `min_capacity` of address
    /// space could be reserved, or when the initial capacity cannot be
    /// committed. Everything acquired so far is released first.
    pub fn new(config: HeapSpaceConfig, vm: Arc<dyn VmOps>) -> Result<Self, HeapSpaceError> {
        config.validate()?;
        let nodes = config.numa_nodes as usize;

        let mut global = match vm.range_callbacks() {
            Some(callbacks) => RangeRegistry::<HeapOffset>::with_callbacks(callbacks),
            None => RangeRegistry::<HeapOffset>::new(),
        };

        let request = config
            .max_capacity
            .saturating_mul(config.virtual_to_physical_ratio)
            .min(config.offset_max);
        let reserver = Reserver::new(&*vm, &config.view_bases, config.offset_max);
        let reserved = reserver.reserve(request);
        let reserved_size: usize = reserved.iter().map(OffsetRange::size).sum();

        let required = config.min_capacity.max(nodes * GRANULE_SIZE);
        if reserved_size < required {
            for r in &reserved {
                reserver.unreserve(*r);
            }
            return Err(HeapSpaceError::ReservationShortfall {
                reserved: reserved_size,
                required,
            });
        }
        if reserved_size < request {
            log::warn!("reserved only {reserved_size:#x} of {request:#x} bytes of heap address space");
        }
        for r in &reserved {
            global.register_range(*r);
        }

        let max_capacity = config.max_capacity.min(align_down_granule(reserved_size));
        if max_capacity < config.max_capacity {
            log::warn!(
                "max capacity reduced from {:#x} to {max_capacity:#x} bytes",
                config.max_capacity
            );
        }
        let initial_capacity = config.initial_capacity.min(max_capacity);

        let mut space = Self {
            vm: Arc::clone(&vm),
            views: config.view_bases.clone(),
            offset_max: config.offset_max,
            reserved,
            max_capacity,
            partitions: Vec::with_capacity(nodes),
            #[cfg(not(loom))]
            uncommitters: Vec::new(),
        };

        let mut first_index = 0usize;
        let mut pieces = Vec::new();
        for node in 0..config.numa_nodes {
            let last = node as usize == nodes - 1;
            let capacity = share(max_capacity, nodes, last);
            let address_space = if last {
                global.total_size()
            } else {
                share(reserved_size, nodes, false)
            };

            let first = u32::try_from(first_index).map_err(|_| {
                HeapSpaceError::InvalidConfig(format!("{max_capacity:#x} bytes exceed the backing index space"))
            })?;
            let physical = PhysicalMemoryManager::new(Arc::clone(&vm), node, first, capacity / GRANULE_SIZE);
            first_index += capacity / GRANULE_SIZE;

            let registry = match vm.range_callbacks() {
                Some(callbacks) => RangeRegistry::with_callbacks(callbacks),
                None => RangeRegistry::new(),
            };
            let min_capacity = share(config.min_capacity, nodes, last).min(capacity);
            let partition = Partition::new(node, space.views.clone(), physical, registry, min_capacity, capacity);

            pieces.clear();
            global.remove_from_low_many_at_most(address_space, &mut pieces);
            for r in &pieces {
                partition.add_address_space(*r);
            }
            log::debug!(
                "node {node}: {:#x} bytes of address space in {} ranges, capacity {capacity:#x}",
                pieces.iter().map(OffsetRange::size).sum::<usize>(),
                pieces.len()
            );
            space.partitions.push(Arc::new(partition));
        }
        debug_assert!(global.is_empty());

        for (i, partition) in space.partitions.iter().enumerate() {
            let size = share(initial_capacity, nodes, i == nodes - 1).min(partition.max_capacity());
            if !partition.prime(size) {
                return Err(HeapSpaceError::InitialCommitFailed {
                    numa_id: partition.numa_id(),
                    size,
                });
            }
        }

        #[cfg(not(loom))]
        if config.uncommit_enabled {
            for partition in &space.partitions {
                let uncommitter =
                    Uncommitter::start(Arc::clone(partition), config.uncommit_interval, config.uncommit_limit)
                        .map_err(HeapSpaceError::UncommitterFailed)?;
                space.uncommitters.push(uncommitter);
            }
        }

        log::info!(
            "heap space: {:#x} bytes reserved in {} ranges across {} views, max capacity {max_capacity:#x}, {nodes} partitions",
            reserved_size,
            space.reserved.len(),
            space.views.len()
        );
        Ok(space)
    }

    /// Builds the engine on the platform's virtual memory primitives.
    ///
    /// # Errors
    ///
    /// See [`HeapSpace::new`]; also fails if the backing store cannot be
    /// created.
    pub fn with_platform(config: HeapSpaceConfig) -> Result<Self, HeapSpaceError> {
        let vm = platform_vm_ops(config.max_capacity)?;
        Self::new(config, vm)
    }

    /// A mapped range of `size` bytes, preferably from node `numa_id`.
    /// Null when no partition can provide it.
    pub fn alloc(&self, size: usize, numa_id: u32) -> OffsetRange {
        let count = self.partitions.len();
        let preferred = numa_id as usize % count;
        for i in 0..count {
            let partition = &self.partitions[(preferred + i) % count];
            let range = partition.alloc(size);
            if !range.is_null() {
                if i > 0 {
                    log::trace!("node {numa_id}: {size:#x} bytes served by node {}", partition.numa_id());
                }
                return range;
            }
        }
        log::debug!("heap space exhausted for {size:#x} bytes");
        OffsetRange::null()
    }

    /// Returns `range` to the partition it came from.
    ///
    /// # Panics
    ///
    /// Panics if no partition owns `range`.
    pub fn free(&self, range: OffsetRange) {
        let Some(partition) = self.partitions.iter().find(|p| p.owns(range)) else {
            panic!("free of {range:?} outside the heap");
        };
        partition.free(range);
    }

    /// Runs one uncommit pass on every partition. Returns the bytes
    /// uncommitted.
    pub fn uncommit(&self, limit: usize) -> usize {
        self.partitions.iter().map(|p| p.uncommit(limit)).sum()
    }

    /// Address of `offset` in view `view`.
    #[must_use]
    pub fn address(&self, view: usize, offset: HeapOffset) -> usize {
        debug_assert!(offset.raw() < self.offset_max);
        self.views[view] + offset.raw()
    }

    #[must_use]
    pub fn views(&self) -> &[usize] {
        &self.views
    }

    #[must_use]
    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    #[must_use]
    pub fn stats(&self) -> HeapSpaceStats {
        let partitions: Vec<PartitionStats> = self.partitions.iter().map(|p| p.stats()).collect();
        HeapSpaceStats {
            reserved: self.reserved.iter().map(OffsetRange::size).sum(),
            max_capacity: self.max_capacity,
            capacity: partitions.iter().map(|p| p.capacity).sum(),
            used: partitions.iter().map(|p| p.used).sum(),
            cached: partitions.iter().map(|p| p.cached).sum(),
            partitions,
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!(
            "heap: capacity {}M of {}M, used {}M, cached {}M",
            stats.capacity / MIB,
            stats.max_capacity / MIB,
            stats.used / MIB,
            stats.cached / MIB
        );
        for p in &stats.partitions {
            log::info!(
                "  node {}: capacity {}M (high {}M, min {}M), used {}M (high {}M), cached {}M, stranded {}M",
                p.numa_id,
                p.capacity / MIB,
                p.capacity_high / MIB,
                p.min_capacity / MIB,
                p.used / MIB,
                p.used_high / MIB,
                p.cached / MIB,
                p.stranded / MIB
            );
        }
    }

    /// Checks every partition.
    ///
    /// # Panics
    ///
    /// Panics on the first violated invariant.
    pub fn verify(&self) {
        for partition in &self.partitions {
            partition.verify();
        }
    }
}

impl Drop for HeapSpace {
    fn drop(&mut self) {
        #[cfg(not(loom))]
        self.uncommitters.clear();

        for partition in &self.partitions {
            partition.flush();
            let used = partition.used();
            if used > 0 {
                log::warn!("node {}: {used:#x} bytes still in use at shutdown", partition.numa_id());
            }
            // Live and stranded memory goes away with the reservation below.
            stats::TOTAL_COMMITTED.sub(partition.capacity());
            stats::TOTAL_MAPPED.sub(used * self.views.len());
            while !partition.unregister_first().is_null() {}
        }

        let reserver = Reserver::new(&*self.vm, &self.views, self.offset_max);
        for r in self.reserved.drain(..) {
            reserver.unreserve(r);
        }
        log::debug!("heap space released");
    }
}

/// Even split of `total` in granules; the last share takes the remainder.
fn share(total: usize, parts: usize, last: bool) -> usize {
    let even = align_down_granule(total / parts);
    if last { total - even * (parts - 1) } else { even }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::range::offset_range;
    use crate::memory::sim::SimulatedVmOps;

    const G: usize = GRANULE_SIZE;
    const VIEW: usize = 1 << 45;

    fn config(max: usize, nodes: u32) -> HeapSpaceConfig {
        HeapSpaceConfig {
            max_capacity: max,
            initial_capacity: 0,
            min_capacity: 0,
            numa_nodes: nodes,
            virtual_to_physical_ratio: 4,
            offset_max: 64 * max,
            view_bases: vec![VIEW],
            uncommit_enabled: false,
            ..HeapSpaceConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        HeapSpaceConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let bad = [
            HeapSpaceConfig {
                max_capacity: G + 1,
                ..config(8 * G, 1)
            },
            HeapSpaceConfig {
                numa_nodes: 0,
                ..config(8 * G, 1)
            },
            HeapSpaceConfig {
                initial_capacity: 16 * G,
                ..config(8 * G, 1)
            },
            config(2 * G, 4),
            HeapSpaceConfig {
                view_bases: vec![VIEW, VIEW + G],
                ..config(8 * G, 1)
            },
            HeapSpaceConfig {
                view_bases: Vec::new(),
                ..config(8 * G, 1)
            },
            HeapSpaceConfig {
                view_bases: vec![usize::MAX & !(G - 1)],
                ..config(8 * G, 1)
            },
            HeapSpaceConfig {
                view_bases: vec![VIEW, usize::MAX & !(G - 1)],
                ..config(8 * G, 1)
            },
        ];
        for c in bad {
            assert!(matches!(c.validate(), Err(HeapSpaceError::InvalidConfig(_))), "{c:?}");
        }
    }

    #[test]
    fn test_share_gives_remainder_to_last() {
        assert_eq!(share(7 * G, 3, false), 2 * G);
        assert_eq!(share(7 * G, 3, true), 3 * G);
        assert_eq!(share(0, 2, true), 0);
    }

    #[test]
    fn test_startup_reserves_and_primes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let sim = Arc::new(SimulatedVmOps::new());
        let space = HeapSpace::new(
            HeapSpaceConfig {
                initial_capacity: 4 * G,
                ..config(8 * G, 2)
            },
            sim.clone(),
        )
        .unwrap();
        let stats = space.stats();
        assert_eq!(stats.reserved, 32 * G);
        assert_eq!(stats.capacity, 4 * G);
        assert_eq!(stats.cached, 4 * G);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.partitions.len(), 2);
        assert!(stats.partitions.iter().all(|p| p.capacity == 2 * G && p.max_capacity == 4 * G));
        assert_eq!(sim.committed_bytes(), 4 * G);
        space.verify();
        drop(space);
        assert_eq!(sim.reserved_bytes(), 0);
        assert_eq!(sim.committed_bytes(), 0);
    }

    #[test]
    fn test_partitions_own_disjoint_space() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let space = HeapSpace::new(config(8 * G, 2), Arc::new(SimulatedVmOps::new())).unwrap();
        let a = space.alloc(2 * G, 0);
        let b = space.alloc(2 * G, 1);
        assert!(space.partitions()[0].owns(a));
        assert!(space.partitions()[1].owns(b));
        assert!(!space.partitions()[0].owns(b));
        assert_eq!(space.partitions()[1].used(), 2 * G);
        space.free(a);
        space.free(b);
        assert_eq!(space.stats().used, 0);
        space.verify();
    }

    #[test]
    fn test_alloc_falls_back_to_other_node() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let space = HeapSpace::new(config(8 * G, 2), Arc::new(SimulatedVmOps::new())).unwrap();
        let a = space.alloc(4 * G, 0);
        let b = space.alloc(2 * G, 0);
        assert!(space.partitions()[0].owns(a));
        assert!(space.partitions()[1].owns(b));
        assert!(space.alloc(4 * G, 0).is_null());
        space.free(a);
        space.free(b);
    }

    #[test]
    fn test_shortfall_below_min_capacity_fails() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let sim = Arc::new(SimulatedVmOps::new());
        let c = HeapSpaceConfig {
            min_capacity: 8 * G,
            offset_max: 16 * G,
            ..config(8 * G, 1)
        };
        sim.block(VIEW + 4 * G, 12 * G);
        match HeapSpace::new(c, sim.clone()) {
            Err(HeapSpaceError::ReservationShortfall { reserved, required }) => {
                assert_eq!(reserved, 4 * G);
                assert_eq!(required, 8 * G);
            }
            other => panic!("unexpected {:?}", other.map(|s| s.stats())),
        }
        assert_eq!(sim.reserved_bytes(), 0);
    }

    #[test]
    fn test_shortfall_above_min_reduces_capacity() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let sim = Arc::new(SimulatedVmOps::new());
        let c = HeapSpaceConfig {
            offset_max: 16 * G,
            ..config(8 * G, 1)
        };
        sim.block(VIEW + 4 * G, 12 * G);
        let space = HeapSpace::new(c, sim).unwrap();
        assert_eq!(space.stats().max_capacity, 4 * G);
        assert_eq!(space.alloc(4 * G, 0), offset_range(0, 4 * G));
        assert!(space.alloc(2 * G, 0).is_null());
    }

    #[test]
    fn test_initial_commit_failure_releases_everything() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let sim = Arc::new(SimulatedVmOps::new());
        sim.set_commit_limit(Some(G));
        let c = HeapSpaceConfig {
            initial_capacity: 4 * G,
            ..config(8 * G, 1)
        };
        assert!(matches!(
            HeapSpace::new(c, sim.clone()),
            Err(HeapSpaceError::InitialCommitFailed { numa_id: 0, .. })
        ));
        assert_eq!(sim.reserved_bytes(), 0);
        assert_eq!(sim.committed_bytes(), 0);
    }

    #[test]
    fn test_uncommit_returns_idle_cache() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let sim = Arc::new(SimulatedVmOps::new());
        let space = HeapSpace::new(config(8 * G, 2), sim.clone()).unwrap();
        let a = space.alloc(2 * G, 0);
        let b = space.alloc(2 * G, 1);
        space.free(a);
        space.free(b);
        assert_eq!(space.uncommit(usize::MAX), 0);
        assert_eq!(space.uncommit(usize::MAX), 4 * G);
        assert_eq!(space.stats().capacity, 0);
        assert_eq!(sim.committed_bytes(), 0);
        space.log_stats();
    }

    #[test]
    fn test_address_per_view() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = HeapSpaceConfig {
            view_bases: vec![VIEW, VIEW << 1],
            ..config(8 * G, 1)
        };
        let sim = Arc::new(SimulatedVmOps::new());
        let space = HeapSpace::new(c, sim.clone()).unwrap();
        let r = space.alloc(2 * G, 0);
        assert_eq!(space.address(0, r.start()), VIEW + r.start_raw());
        assert_eq!(space.address(1, r.start()), (VIEW << 1) + r.start_raw());
        assert_eq!(sim.mapped_bytes(), 4 * G);
        space.free(r);
    }

    #[test]
    fn test_drop_with_live_ranges_settles_global_gauges() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::global();
        {
            let space = HeapSpace::new(
                HeapSpaceConfig {
                    view_bases: vec![VIEW, VIEW << 1],
                    ..config(8 * G, 2)
                },
                Arc::new(SimulatedVmOps::new()),
            )
            .unwrap();
            let a = space.alloc(2 * G, 0);
            let b = space.alloc(G, 1);
            let c = space.alloc(G, 1);
            space.free(c);
            assert!(!a.is_null() && !b.is_null());
            assert_eq!(stats::global().mapped, before.mapped + 8 * G);
        }
        assert_eq!(stats::global(), before);
    }

    #[test]
    fn test_free_outside_heap_panics() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let space = HeapSpace::new(config(8 * G, 1), Arc::new(SimulatedVmOps::new())).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            space.free(offset_range(1 << 40, G));
        }));
        assert!(result.is_err());
        space.verify();
    }
}
