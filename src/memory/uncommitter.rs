//! Background thread that periodically returns idle cached memory.

use std::time::Duration;

use super::partition::Partition;
use crate::sync::thread::{Builder, JoinHandle};
use crate::sync::{Arc, Condvar, Mutex, lock};

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// One uncommit worker per partition. Stopped and joined on drop.
pub struct Uncommitter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Uncommitter {
    /// Spawns the worker. Every `interval` it runs one uncommit pass of at
    /// most `limit` bytes.
    pub fn start(partition: Arc<Partition>, interval: Duration, limit: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = Builder::new()
            .name(format!("heap-uncommit-{}", partition.numa_id()))
            .spawn(move || run(&partition, &worker, interval, limit))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Asks the worker to exit and waits for it.
    pub fn stop(&mut self) {
        *lock(&self.shared.stop) = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("uncommitter thread panicked");
            }
        }
    }
}

impl Drop for Uncommitter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(partition: &Partition, shared: &Shared, interval: Duration, limit: usize) {
    log::trace!("node {}: uncommitter started", partition.numa_id());
    let mut stopped = lock(&shared.stop);
    // The flag is checked before every wait so a stop that lands before the
    // first wait is not lost.
    while !*stopped {
        let (guard, timeout) = shared
            .wake
            .wait_timeout(stopped, interval)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        stopped = guard;
        if *stopped || !timeout.timed_out() {
            continue;
        }
        drop(stopped);
        partition.uncommit(limit);
        stopped = lock(&shared.stop);
    }
    log::trace!("node {}: uncommitter stopped", partition.numa_id());
}
