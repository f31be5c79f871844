use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Drain flags shared by the agent and the HTTP handlers.
#[derive(Debug, Default)]
pub struct DrainState {
    shutdown_requested: AtomicBool,
    in_flight: AtomicUsize,
    failed_checks: AtomicU32,
}

impl DrainState {
    /// Set the shutdown flag. Returns true the first time only.
    pub fn request_shutdown(&self) -> bool {
        !self.shutdown_requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Mark a request as in flight until the guard is dropped.
    pub fn begin_request(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { state: self }
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Count a health check answered with 500. Returns the new total.
    pub fn record_failed_check(&self) -> u32 {
        self.failed_checks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn failed_checks(&self) -> u32 {
        self.failed_checks.load(Ordering::SeqCst)
    }
}

pub struct InFlight<'a> {
    state: &'a DrainState,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// When a draining worker may exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Failed health checks that prove the balancer stopped routing here.
    pub fail_checks: u32,
    /// Drain-check ticks after which the worker exits regardless of checks.
    pub max_checks: u32,
}

impl DrainPolicy {
    pub fn should_exit(&self, processing: bool, failed_checks: u32, ticks: u32) -> bool {
        !processing && (failed_checks >= self.fail_checks || ticks > self.max_checks)
    }
}

/// Counts drain-check ticks once a shutdown was requested.
#[derive(Debug)]
pub struct DrainTimer {
    policy: DrainPolicy,
    ticks: u32,
}

impl DrainTimer {
    pub fn new(policy: DrainPolicy) -> Self {
        Self { policy, ticks: 0 }
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// One drain-check period elapsed. Returns true when the worker should exit.
    pub fn tick(&mut self, state: &DrainState) -> bool {
        if !state.is_shutdown_requested() {
            return false;
        }
        let exit = self
            .policy
            .should_exit(state.is_processing(), state.failed_checks(), self.ticks);
        self.ticks += 1;
        exit
    }
}
