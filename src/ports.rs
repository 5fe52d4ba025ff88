//! Host port pool for run sessions.

use crate::error::{OrchestratorError, Result};
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::debug;

/// Fixed pool of ports. A port leaves the pool on `allocate` and only
/// returns on `release`, which happens after its session is evicted.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    capacity: u16,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, capacity: u16) -> Self {
        let end = start.saturating_add(capacity);
        Self {
            start,
            capacity: end - start,
            free: Mutex::new((start..end).collect()),
        }
    }

    /// Take the lowest free port.
    pub fn allocate(&self) -> Result<u16> {
        let mut free = self
            .free
            .lock()
            .map_err(|_| OrchestratorError::Infrastructure("port pool poisoned".to_string()))?;
        let port = free.pop_first().ok_or_else(|| {
            OrchestratorError::Infrastructure(format!(
                "no free ports ({} sessions live)",
                self.capacity
            ))
        })?;
        debug!(port, "Port allocated");
        Ok(port)
    }

    /// Return a port to the pool. Ports outside the range are ignored.
    pub fn release(&self, port: u16) {
        if !self.contains(port) {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            if free.insert(port) {
                debug!(port, "Port released");
            }
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.start && port - self.start < self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_are_distinct() {
        let pool = Arc::new(PortAllocator::new(20000, 200));
        let mut tasks = Vec::new();
        for _ in 0..200 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.allocate().unwrap() }));
        }

        let mut ports = HashSet::new();
        for task in tasks {
            assert!(ports.insert(task.await.unwrap()), "port handed out twice");
        }
        assert_eq!(ports.len(), 200);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let pool = PortAllocator::new(30000, 1);
        assert_eq!(pool.allocate().unwrap(), 30000);
        assert!(matches!(
            pool.allocate(),
            Err(OrchestratorError::Infrastructure(_))
        ));
    }

    #[test]
    fn released_port_is_reused_only_after_release() {
        let pool = PortAllocator::new(30000, 2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);

        pool.release(a);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn foreign_and_double_release_are_ignored() {
        let pool = PortAllocator::new(30000, 2);
        pool.release(1234);
        assert_eq!(pool.available(), 2);

        let a = pool.allocate().unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.available(), 2);
    }
}
