use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{FleetError, Result};

/// Fleet-wide flags and counters owned by the supervisor.
///
/// Mutated only through methods so the lock and spawn rules hold.
#[derive(Debug)]
pub struct SupervisorState {
    target: usize,
    shutdown_lock: bool,
    allow_new_instances: bool,
    /// Forked children that have not registered yet, by pid.
    pending: BTreeMap<u32, Instant>,
}

impl SupervisorState {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            shutdown_lock: false,
            allow_new_instances: true,
            pending: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn shutdown_lock(&self) -> bool {
        self.shutdown_lock
    }

    pub fn allow_new_instances(&self) -> bool {
        self.allow_new_instances
    }

    /// Take the shutdown lock. Fails if a restart, stop or handoff already holds it.
    pub fn begin_shutdown(&mut self) -> Result<()> {
        if self.shutdown_lock {
            return Err(FleetError::ShutdownInProgress);
        }
        self.shutdown_lock = true;
        Ok(())
    }

    pub fn end_shutdown(&mut self) {
        self.shutdown_lock = false;
    }

    /// Forbid any future spawn.
    pub fn disable_new_instances(&mut self) {
        self.allow_new_instances = false;
    }

    pub fn enable_new_instances(&mut self) {
        self.allow_new_instances = true;
    }

    pub fn waited_workers(&self) -> usize {
        self.pending.len()
    }

    pub fn spawn_requested(&mut self, pid: u32, at: Instant) {
        self.pending.insert(pid, at);
    }

    /// Account for a registration. Consumes the matching pending spawn, or the oldest
    /// one if the pid is unknown.
    pub fn spawn_registered(&mut self, pid: u32) {
        if self.pending.remove(&pid).is_some() {
            return;
        }
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(pid, _)| *pid);
        if let Some(oldest) = oldest {
            self.pending.remove(&oldest);
        }
    }

    /// A child exited. Returns true if it had never registered.
    pub fn spawn_exited(&mut self, pid: u32) -> bool {
        self.pending.remove(&pid).is_some()
    }

    /// Drop pending spawns older than `timeout` and return their pids.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<u32> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > timeout)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &expired {
            self.pending.remove(pid);
        }
        expired
    }

    /// Forget every pending spawn and return their pids.
    pub fn take_pending(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pending).into_keys().collect()
    }

    /// How many workers to fork so that registered plus pending reaches the target.
    pub fn spawn_deficit(&self, registered: usize) -> usize {
        if !self.allow_new_instances {
            return 0;
        }
        self.target
            .saturating_sub(registered + self.pending.len())
    }
}
