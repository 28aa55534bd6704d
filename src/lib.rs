#[cfg(not(target_pointer_width = "64"))]
compile_error!("heapspace supports only 64-bit targets.");

pub(crate) mod sync;

// public module: building blocks of the engine and TEST_MUTEX (public for tests)
pub mod memory;

// engine
pub use memory::manager::{HeapSpace, HeapSpaceConfig, HeapSpaceError, HeapSpaceStats};
pub use memory::partition::{Partition, PartitionStats};

// ranges
pub use memory::range::{BackingIndex, GRANULE_SIZE, HeapOffset, IndexRange, OffsetRange, Range, offset_range};
pub use memory::registry::{NoopCallbacks, RangeCallbacks, RangeRegistry};

// platform
pub use memory::placeholder::PlaceholderMap;
pub use memory::sim::SimulatedVmOps;
#[cfg(all(target_os = "linux", not(any(loom, miri))))]
pub use memory::vm::PlatformVmOps;
pub use memory::vm::{VmError, VmOps, platform_vm_ops};

// stats
pub use memory::stats::{GlobalStats, global as global_stats};
