/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the Mutex-protected partition and physical bookkeeping under
/// every thread interleaving loom can explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Partitions are a handful of granules so each operation touches few
///     registry/cache entries.
///   - Every model builds a fresh `SimulatedVmOps`; its state mutex is a
///     loom mutex, so OS calls are interleaving points too.
///   - The uncommitter thread is not modelled. Its body is one
///     `Partition::uncommit` call, which is tested directly.
#[cfg(loom)]
mod tests {
    use crate::memory::partition::Partition;
    use crate::memory::physical::PhysicalMemoryManager;
    use crate::memory::range::{GRANULE_SIZE, HeapOffset, offset_range};
    use crate::memory::registry::RangeRegistry;
    use crate::memory::sim::SimulatedVmOps;
    use crate::memory::vm::VmOps;
    use crate::sync::Arc;

    const G: usize = GRANULE_SIZE;
    const VIEWS: [usize; 1] = [1 << 42];

    // =====================================================================
    // Helpers
    // =====================================================================

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn partition(granules: usize) -> (Arc<SimulatedVmOps>, Arc<Partition>) {
        let sim = Arc::new(SimulatedVmOps::new());
        for base in VIEWS {
            assert!(sim.reserve(base, 2 * granules * G));
        }
        let vm: Arc<dyn VmOps> = sim.clone();
        let physical = PhysicalMemoryManager::new(vm, 0, 0, granules);
        let p = Partition::new(
            0,
            VIEWS.to_vec(),
            physical,
            RangeRegistry::<HeapOffset>::new(),
            0,
            granules * G,
        );
        p.add_address_space(offset_range(0, 2 * granules * G));
        (sim, Arc::new(p))
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. Partition alloc/free
    // =====================================================================

    #[test]
    fn loom_partition_concurrent_alloc_free() {
        bounded(2).check(|| {
            let (sim, p) = partition(2);

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let p = p.clone();
                    loom::thread::spawn(move || {
                        let r = p.alloc(G);
                        assert!(!r.is_null(), "two granules of capacity for two threads");
                        p.free(r);
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(p.used(), 0);
            assert_eq!(sim.committed_bytes(), p.capacity());
            p.verify();
        });
    }

    #[test]
    fn loom_partition_contended_last_granule() {
        bounded(2).check(|| {
            let (_sim, p) = partition(1);

            let p1 = p.clone();
            let p2 = p.clone();
            let t1 = loom::thread::spawn(move || p1.alloc(G));
            let t2 = loom::thread::spawn(move || p2.alloc(G));
            let a = t1.join().unwrap();
            let b = t2.join().unwrap();

            // Exactly one winner; the loser sees exhaustion, not an error.
            assert_ne!(a.is_null(), b.is_null());
            let won = if a.is_null() { b } else { a };
            assert_eq!(p.used(), G);
            p.free(won);
            p.verify();
        });
    }

    // =====================================================================
    // 3. Uncommit racing allocation
    // =====================================================================

    #[test]
    fn loom_uncommit_while_allocating() {
        bounded(2).check(|| {
            let (sim, p) = partition(2);
            assert!(p.prime(G));
            // Open the watermark so the next pass may take the primed granule.
            p.uncommit(0);

            let pu = p.clone();
            let pa = p.clone();
            let t_uncommit = loom::thread::spawn(move || pu.uncommit(usize::MAX));
            let t_alloc = loom::thread::spawn(move || pa.alloc(G));

            let uncommitted = t_uncommit.join().unwrap();
            let r = t_alloc.join().unwrap();

            assert!(!r.is_null());
            assert!(uncommitted <= G);
            assert_eq!(p.used(), G);
            assert_eq!(sim.committed_bytes(), p.capacity());
            p.free(r);
            p.verify();
        });
    }

    // =====================================================================
    // 4. PhysicalMemoryManager
    // =====================================================================

    #[test]
    fn loom_physical_concurrent_commit_distinct_ranges() {
        bounded(2).check(|| {
            let sim = Arc::new(SimulatedVmOps::new());
            let vm: Arc<dyn VmOps> = sim.clone();
            let pm = Arc::new(PhysicalMemoryManager::new(vm, 0, 0, 2));

            let m1 = pm.clone();
            let m2 = pm.clone();
            let t1 = loom::thread::spawn(move || m1.commit(offset_range(0, G)));
            let t2 = loom::thread::spawn(move || m2.commit(offset_range(4 * G, G)));
            assert_eq!(t1.join().unwrap(), G);
            assert_eq!(t2.join().unwrap(), G);

            assert_eq!(pm.committed(), 2 * G);
            assert_eq!(pm.available(), 0);
            assert_eq!(sim.committed_bytes(), 2 * G);
            // Each granule drew its own backing index.
            let a = pm.take(offset_range(0, G));
            let b = pm.take(offset_range(4 * G, G));
            assert_ne!(a[0].start(), b[0].start());
        });
    }
}
