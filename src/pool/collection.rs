use std::net::SocketAddr;

use crate::control::LinkId;
use crate::pool::worker::{Worker, WorkerStatus};

/// Registered workers in registration order, plus the balancer's round-robin cursor.
///
/// No two workers share a port. The cursor indexes into the active subset, which is
/// recomputed on every selection.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    cursor: usize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    /// Append a worker. Returns it back if its port is already taken.
    pub fn add(&mut self, worker: Worker) -> Result<(), Worker> {
        if self.contains_port(worker.port) {
            return Err(worker);
        }
        self.workers.push(worker);
        Ok(())
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.workers.iter().any(|w| w.port == port)
    }

    pub fn get(&self, port: u16) -> Option<&Worker> {
        self.workers.iter().find(|w| w.port == port)
    }

    pub fn get_mut(&mut self, port: u16) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.port == port)
    }

    pub fn find_by_pid_mut(&mut self, pid: u32) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.pid == pid)
    }

    pub fn port_of_pid(&self, pid: u32) -> Option<u16> {
        self.workers.iter().find(|w| w.pid == pid).map(|w| w.port)
    }

    pub fn port_of_link(&self, link: LinkId) -> Option<u16> {
        self.workers
            .iter()
            .find(|w| w.link_id() == link)
            .map(|w| w.port)
    }

    /// Remove and return the worker listening on `port`.
    pub fn remove(&mut self, port: u16) -> Option<Worker> {
        let idx = self.workers.iter().position(|w| w.port == port)?;
        Some(self.workers.remove(idx))
    }

    /// Ports of every worker, in registration order.
    pub fn ports(&self) -> Vec<u16> {
        self.workers.iter().map(|w| w.port).collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|w| w.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn has_shutting_down(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.status == WorkerStatus::ShuttingDown)
    }

    /// Advance the cursor over the current active subset.
    ///
    /// Returns `None` when no worker is active.
    pub fn next_active_index(&mut self) -> Option<usize> {
        let count = self.active_count();
        if count == 0 {
            return None;
        }
        self.cursor += 1;
        if self.cursor >= count {
            self.cursor = 0;
        }
        Some(self.cursor)
    }

    /// Pick the next active worker's address for a balancer connection.
    pub fn next_active_addr(&mut self) -> Option<SocketAddr> {
        let active: Vec<SocketAddr> = self.active().map(|w| w.addr()).collect();
        if active.is_empty() {
            return None;
        }
        // The subset may have changed since the cursor was last used; resample until
        // the index falls inside this snapshot.
        loop {
            let idx = self.next_active_index()?;
            if let Some(addr) = active.get(idx) {
                return Some(*addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Link;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn worker(pid: u32, port: u16) -> Worker {
        let (link, _rx) = Link::channel();
        Worker::register(pid, IpAddr::V4(Ipv4Addr::LOCALHOST), port, link)
    }

    #[test]
    fn add_rejects_duplicate_port() {
        let mut pool = WorkerPool::new();
        assert!(pool.add(worker(1, 9001)).is_ok());
        assert!(pool.add(worker(2, 9002)).is_ok());

        let rejected = pool.add(worker(3, 9001)).unwrap_err();
        assert_eq!(rejected.pid, 3);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.ports(), vec![9001, 9002]);
    }

    #[test]
    fn remove_keeps_registration_order() {
        let mut pool = WorkerPool::new();
        for (pid, port) in [(1, 9001), (2, 9002), (3, 9003)] {
            pool.add(worker(pid, port)).unwrap();
        }
        let removed = pool.remove(9002).unwrap();
        assert_eq!(removed.pid, 2);
        assert_eq!(pool.ports(), vec![9001, 9003]);
        assert!(pool.remove(9002).is_none());
    }

    #[test]
    fn lookups_by_pid_and_link() {
        let mut pool = WorkerPool::new();
        let w = worker(7, 9007);
        let link = w.link_id();
        pool.add(w).unwrap();

        assert_eq!(pool.port_of_pid(7), Some(9007));
        assert_eq!(pool.port_of_link(link), Some(9007));
        assert!(pool.find_by_pid_mut(8).is_none());
    }

    #[test]
    fn next_active_index_is_none_when_empty() {
        let mut pool = WorkerPool::new();
        assert_eq!(pool.next_active_index(), None);
        assert_eq!(pool.next_active_addr(), None);
    }

    #[test]
    fn round_robin_is_fair() {
        let mut pool = WorkerPool::new();
        for (pid, port) in [(1, 9001), (2, 9002), (3, 9003)] {
            pool.add(worker(pid, port)).unwrap();
        }

        let mut hits: HashMap<u16, usize> = HashMap::new();
        let selections = 10;
        for _ in 0..selections {
            let addr = pool.next_active_addr().unwrap();
            *hits.entry(addr.port()).or_default() += 1;
        }

        assert_eq!(hits.len(), 3);
        for count in hits.values() {
            assert!(*count >= selections / 3);
        }
    }

    #[test]
    fn round_robin_skips_shutting_down_workers() {
        let mut pool = WorkerPool::new();
        for (pid, port) in [(1, 9001), (2, 9002), (3, 9003)] {
            pool.add(worker(pid, port)).unwrap();
        }
        pool.get_mut(9002).unwrap().request_shutdown();
        assert!(pool.has_shutting_down());
        assert_eq!(pool.active_count(), 2);

        for _ in 0..6 {
            assert_ne!(pool.next_active_addr().unwrap().port(), 9002);
        }
    }

    #[test]
    fn cursor_wraps_when_active_subset_shrinks() {
        let mut pool = WorkerPool::new();
        for (pid, port) in [(1, 9001), (2, 9002), (3, 9003)] {
            pool.add(worker(pid, port)).unwrap();
        }
        pool.next_active_index();
        pool.next_active_index();
        pool.remove(9003);
        pool.remove(9002);

        assert_eq!(pool.next_active_index(), Some(0));
        assert_eq!(pool.next_active_addr().unwrap().port(), 9001);
    }
}
