use super::range::HeapOffset;
use super::registry::RangeCallbacks;
use crate::sync::Arc;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("backing store setup failed: {0}")]
    BackingFailed(#[source] io::Error),
    #[error("mapping [{addr:#x}, +{size:#x}) failed: {source}")]
    MapFailed {
        addr: usize,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("unmapping [{addr:#x}, +{size:#x}) failed: {source}")]
    UnmapFailed {
        addr: usize,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("VM initialization failed: {0}")]
    InitializationFailed(String),
}

/// OS primitives the engine is built on.
///
/// Addresses are absolute virtual addresses (`view base + heap offset`).
/// Backing offsets are byte offsets into the physical backing store
/// (`backing index * granule`). Every size is a multiple of the granule.
///
/// Commit and uncommit report partial success as a byte count covering a
/// prefix of the request; the caller rolls back the rest. Map and unmap are
/// all-or-nothing per call.
pub trait VmOps: Send + Sync {
    /// Reserves `[addr, addr + size)` exactly. Returns `false` if the range
    /// is unavailable; nothing stays reserved in that case.
    fn reserve(&self, addr: usize, size: usize) -> bool;

    fn unreserve(&self, addr: usize, size: usize);

    /// Binds physical memory to `[backing_offset, backing_offset + size)`,
    /// preferring NUMA node `numa_id`. Returns the committed prefix length.
    fn commit(&self, backing_offset: usize, size: usize, numa_id: u32) -> usize;

    /// Returns the uncommitted prefix length.
    fn uncommit(&self, backing_offset: usize, size: usize) -> usize;

    /// Maps committed backing memory at `addr`.
    fn map(&self, addr: usize, size: usize, backing_offset: usize) -> Result<(), VmError>;

    /// Replaces a mapping with inaccessible reserved address space.
    fn unmap(&self, addr: usize, size: usize) -> Result<(), VmError>;

    /// Registry callbacks for platforms with placeholder bookkeeping.
    fn range_callbacks(&self) -> Option<Box<dyn RangeCallbacks<HeapOffset>>> {
        None
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
pub use linux::PlatformVmOps;

/// Platform seam for this target, backing up to `backing_size` bytes.
///
/// # Errors
///
/// Returns an error if the backing store cannot be created.
#[cfg(all(target_os = "linux", not(any(loom, miri))))]
pub fn platform_vm_ops(backing_size: usize) -> Result<Arc<dyn VmOps>, VmError> {
    Ok(Arc::new(PlatformVmOps::new(backing_size)?))
}

/// Platform seam for this target. Without a shared-memory backing store
/// the simulated platform stands in.
///
/// # Errors
///
/// Never fails on this target.
#[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
pub fn platform_vm_ops(backing_size: usize) -> Result<Arc<dyn VmOps>, VmError> {
    log::info!("no native backing store on this target, using simulated VM ({backing_size:#x} bytes)");
    Ok(Arc::new(super::sim::SimulatedVmOps::new()))
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
mod linux {
    use super::{VmError, VmOps};
    use crate::memory::range::GRANULE_SIZE;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const MPOL_PREFERRED: libc::c_int = 1;

    /// Bits in the node masks handed to the mempolicy syscalls.
    const MAX_NODES: usize = 1024;
    const MASK_WORDS: usize = MAX_NODES / libc::c_ulong::BITS as usize;

    type NodeMask = [libc::c_ulong; MASK_WORDS];

    fn set_mempolicy(mode: libc::c_int, mask: &NodeMask) -> io::Result<()> {
        // Safety: the kernel reads at most MAX_NODES - 1 bits of `mask`.
        let res = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                mode,
                mask.as_ptr(),
                MAX_NODES as libc::c_ulong,
            )
        };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// The calling thread's memory policy and node mask.
    pub(super) fn thread_mempolicy() -> io::Result<(libc::c_int, NodeMask)> {
        let mut mode: libc::c_int = 0;
        let mut mask: NodeMask = [0; MASK_WORDS];
        // Safety: the kernel writes one int to `mode` and at most
        // MAX_NODES - 1 bits to `mask`.
        let res = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &raw mut mode,
                mask.as_mut_ptr(),
                MAX_NODES as libc::c_ulong,
                std::ptr::null_mut::<libc::c_void>(),
                0 as libc::c_ulong,
            )
        };
        if res == 0 {
            Ok((mode, mask))
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Makes the calling thread prefer one NUMA node until dropped, then
    /// puts its previous policy back.
    struct PreferredNode {
        mode: libc::c_int,
        mask: NodeMask,
    }

    impl PreferredNode {
        fn set(numa_id: u32) -> io::Result<Self> {
            let node = numa_id as usize;
            if node >= MAX_NODES - 1 {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            let (mode, mask) = thread_mempolicy()?;
            let mut preferred: NodeMask = [0; MASK_WORDS];
            let bits = libc::c_ulong::BITS as usize;
            preferred[node / bits] |= 1 << (node % bits);
            set_mempolicy(MPOL_PREFERRED, &preferred)?;
            Ok(Self { mode, mask })
        }
    }

    impl Drop for PreferredNode {
        fn drop(&mut self) {
            if let Err(e) = set_mempolicy(self.mode, &self.mask) {
                log::warn!("could not restore thread memory policy: {e}");
            }
        }
    }

    /// Linux platform: physical memory lives in an anonymous memfd so the
    /// same pages can be mapped at several addresses.
    pub struct PlatformVmOps {
        fd: OwnedFd,
        backing_size: usize,
    }

    impl PlatformVmOps {
        /// # Errors
        ///
        /// Returns an error if the memfd cannot be created or sized.
        pub fn new(backing_size: usize) -> Result<Self, VmError> {
            // Safety: FFI call to memfd_create with a NUL-terminated name.
            let raw = unsafe { libc::memfd_create(c"heapspace".as_ptr(), libc::MFD_CLOEXEC) };
            if raw < 0 {
                return Err(VmError::BackingFailed(io::Error::last_os_error()));
            }
            // Safety: raw is a freshly created descriptor we own.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let len = libc::off_t::try_from(backing_size).map_err(|_| {
                VmError::InitializationFailed(format!("backing size {backing_size:#x} too large"))
            })?;
            // Safety: FFI call to ftruncate on a valid descriptor.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
                return Err(VmError::BackingFailed(io::Error::last_os_error()));
            }

            log::debug!("memfd backing store sized {backing_size:#x}");
            Ok(Self { fd, backing_size })
        }

        fn fallocate(&self, mode: libc::c_int, offset: usize, size: usize) -> io::Result<()> {
            debug_assert!(offset + size <= self.backing_size);
            #[allow(clippy::cast_possible_wrap)]
            // Safety: FFI call to fallocate on a valid descriptor.
            let res = unsafe {
                libc::fallocate(
                    self.fd.as_raw_fd(),
                    mode,
                    offset as libc::off_t,
                    size as libc::off_t,
                )
            };
            if res == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        /// Applies `fallocate` to the whole range, falling back to granule
        /// steps to find the successful prefix.
        fn fallocate_prefix(&self, mode: libc::c_int, offset: usize, size: usize) -> usize {
            if self.fallocate(mode, offset, size).is_ok() {
                return size;
            }
            let mut done = 0;
            while done < size {
                if let Err(e) = self.fallocate(mode, offset + done, GRANULE_SIZE) {
                    log::warn!(
                        "fallocate(mode {mode:#x}) failed at backing offset {:#x}: {e}",
                        offset + done
                    );
                    break;
                }
                done += GRANULE_SIZE;
            }
            done
        }
    }

    impl VmOps for PlatformVmOps {
        fn reserve(&self, addr: usize, size: usize) -> bool {
            // Safety: FFI call to mmap. Without MAP_FIXED the kernel never
            // replaces an existing mapping.
            let res = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if res == libc::MAP_FAILED {
                log::trace!("reserve [{addr:#x}, +{size:#x}): {}", io::Error::last_os_error());
                return false;
            }
            if res as usize != addr {
                // Safety: res was just mapped by us with this size.
                unsafe { libc::munmap(res, size) };
                return false;
            }
            true
        }

        fn unreserve(&self, addr: usize, size: usize) {
            // Safety: FFI call to munmap on a range this engine reserved.
            if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
                log::error!(
                    "unreserve [{addr:#x}, +{size:#x}) failed: {}",
                    io::Error::last_os_error()
                );
            }
        }

        fn commit(&self, backing_offset: usize, size: usize, numa_id: u32) -> usize {
            log::trace!("commit backing [{backing_offset:#x}, +{size:#x}) node {numa_id}");
            // Shared memory pages are placed by the allocating thread's
            // policy. A node the kernel rejects leaves placement to it.
            let _policy = PreferredNode::set(numa_id)
                .inspect_err(|e| log::trace!("node {numa_id} not preferred: {e}"))
                .ok();
            self.fallocate_prefix(0, backing_offset, size)
        }

        fn uncommit(&self, backing_offset: usize, size: usize) -> usize {
            self.fallocate_prefix(
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                backing_offset,
                size,
            )
        }

        fn map(&self, addr: usize, size: usize, backing_offset: usize) -> Result<(), VmError> {
            #[allow(clippy::cast_possible_wrap)]
            // Safety: FFI call to mmap over address space this engine reserved.
            let res = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    self.fd.as_raw_fd(),
                    backing_offset as libc::off_t,
                )
            };
            if res == libc::MAP_FAILED {
                return Err(VmError::MapFailed {
                    addr,
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn unmap(&self, addr: usize, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mmap over address space this engine reserved.
            let res = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if res == libc::MAP_FAILED {
                return Err(VmError::UnmapFailed {
                    addr,
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(all(test, target_os = "linux", not(any(loom, miri))))]
mod tests {
    use super::*;
    use crate::memory::range::GRANULE_SIZE;

    const G: usize = GRANULE_SIZE;

    // Each test uses its own slot far above the usual mmap area.
    fn test_base(slot: usize) -> usize {
        0x3000_0000_0000 + slot * (1 << 32)
    }

    #[test]
    fn test_reserve_exact_and_collide() {
        let vm = PlatformVmOps::new(4 * G).expect("memfd");
        let base = test_base(0);
        assert!(vm.reserve(base, 4 * G), "reserve at hint");
        // Second reservation of the same range must not land elsewhere.
        assert!(!vm.reserve(base, 4 * G));
        vm.unreserve(base, 4 * G);
        assert!(vm.reserve(base, 4 * G));
        vm.unreserve(base, 4 * G);
    }

    #[test]
    fn test_commit_map_write_read() {
        let vm = PlatformVmOps::new(4 * G).expect("memfd");
        let base = test_base(1);
        assert!(vm.reserve(base, 2 * G));
        assert_eq!(vm.commit(G, 2 * G, 0), 2 * G);
        vm.map(base, 2 * G, G).expect("map");

        // Safety: Test code; the range is mapped read-write.
        unsafe {
            let p = base as *mut u8;
            *p = 42;
            *p.add(2 * G - 1) = 7;
            assert_eq!(*p, 42);
            assert_eq!(*p.add(2 * G - 1), 7);
        }

        vm.unmap(base, 2 * G).expect("unmap");
        assert_eq!(vm.uncommit(G, 2 * G), 2 * G);
        vm.unreserve(base, 2 * G);
    }

    #[test]
    fn test_two_views_share_memory() {
        let vm = PlatformVmOps::new(2 * G).expect("memfd");
        let a = test_base(2);
        let b = test_base(3);
        assert!(vm.reserve(a, G));
        assert!(vm.reserve(b, G));
        assert_eq!(vm.commit(0, G, 0), G);
        vm.map(a, G, 0).expect("map view a");
        vm.map(b, G, 0).expect("map view b");

        // Safety: Test code; both views map the same committed granule.
        unsafe {
            *(a as *mut u64) = 0xDEAD_BEEF;
            assert_eq!(*(b as *const u64), 0xDEAD_BEEF);
        }

        vm.unmap(a, G).expect("unmap a");
        vm.unmap(b, G).expect("unmap b");
        vm.uncommit(0, G);
        vm.unreserve(a, G);
        vm.unreserve(b, G);
    }

    #[test]
    fn test_uncommit_then_recommit_is_zeroed() {
        let vm = PlatformVmOps::new(G).expect("memfd");
        let base = test_base(4);
        assert!(vm.reserve(base, G));
        assert_eq!(vm.commit(0, G, 0), G);
        vm.map(base, G, 0).expect("map");
        // Safety: Test code.
        unsafe { *(base as *mut u8) = 0xAA };
        vm.unmap(base, G).expect("unmap");

        assert_eq!(vm.uncommit(0, G), G);
        assert_eq!(vm.commit(0, G, 0), G);
        vm.map(base, G, 0).expect("remap");
        // Safety: Test code; punched holes read back as zero.
        unsafe { assert_eq!(*(base as *const u8), 0) };
        vm.unmap(base, G).expect("unmap");
        vm.unreserve(base, G);
    }

    #[test]
    fn test_commit_restores_thread_memory_policy() {
        let vm = PlatformVmOps::new(2 * G).expect("memfd");
        let before = linux::thread_mempolicy();
        assert_eq!(vm.commit(0, G, 0), G);
        // Nodes the machine does not have still commit.
        assert_eq!(vm.commit(G, G, 4000), G);
        let after = linux::thread_mempolicy();
        match (before, after) {
            (Ok(before), Ok(after)) => assert_eq!(before, after),
            // No mempolicy support (e.g. seccomp); nothing was changed.
            (Err(_), Err(_)) => {}
            (before, after) => panic!("policy query changed: {before:?} -> {after:?}"),
        }
        assert_eq!(vm.uncommit(0, 2 * G), 2 * G);
    }

    #[test]
    fn test_platform_vm_ops_factory() {
        let vm = platform_vm_ops(G).expect("platform");
        assert!(vm.range_callbacks().is_none());
    }
}
