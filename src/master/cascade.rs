use std::collections::VecDeque;

use crate::control::LinkId;

/// What happens once every worker in the snapshot has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeKind {
    /// Replacements are spawned as workers go away; the master keeps running.
    Restart,
    /// No replacements; the master exits at the end.
    Stop,
    /// Every slot is handed to the successor on `link`, then the master exits.
    Handoff { successor: LinkId },
}

impl std::fmt::Display for CascadeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CascadeKind::Restart => write!(f, "restart"),
            CascadeKind::Stop => write!(f, "stop"),
            CascadeKind::Handoff { .. } => write!(f, "handoff"),
        }
    }
}

/// Sequential graceful shutdown of a snapshot of workers.
///
/// At most one worker is in flight at a time. The supervisor pops the next pid when
/// nothing is in flight and marks the step done when that worker leaves the pool.
#[derive(Debug)]
pub struct Cascade {
    kind: CascadeKind,
    pending: VecDeque<u32>,
    current: Option<u32>,
    reporter: Option<LinkId>,
    shut_down: usize,
}

impl Cascade {
    /// Start a cascade over `pids`, in order. Progress lines go to `reporter` if set.
    pub fn new(kind: CascadeKind, pids: Vec<u32>, reporter: Option<LinkId>) -> Self {
        Self {
            kind,
            pending: pids.into(),
            current: None,
            reporter,
            shut_down: 0,
        }
    }

    pub fn kind(&self) -> CascadeKind {
        self.kind
    }

    pub fn reporter(&self) -> Option<LinkId> {
        self.reporter
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Workers shut down so far.
    pub fn shut_down(&self) -> usize {
        self.shut_down
    }

    /// Pop the next pid and mark it in flight. Returns `None` while one is still in
    /// flight or when the snapshot is exhausted.
    pub fn start_next(&mut self) -> Option<u32> {
        if self.current.is_some() {
            return None;
        }
        let pid = self.pending.pop_front()?;
        self.current = Some(pid);
        Some(pid)
    }

    /// The worker `pid` left the pool. Returns true if it was the one in flight.
    pub fn worker_gone(&mut self, pid: u32) -> bool {
        if self.current == Some(pid) {
            self.current = None;
            self.shut_down += 1;
            return true;
        }
        // Gone before its turn: nothing left to shut down.
        self.pending.retain(|p| *p != pid);
        false
    }

    pub fn is_done(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    pub fn detach_reporter(&mut self) {
        self.reporter = None;
    }

    /// Turn a restart into a stop. Other kinds already end the master.
    pub fn escalate_to_stop(&mut self) {
        if self.kind == CascadeKind::Restart {
            self.kind = CascadeKind::Stop;
        }
    }

    /// Abandon a handoff whose successor went away: finish the worker in flight, skip
    /// the rest, and complete as a restart.
    pub fn revert(&mut self) {
        self.pending.clear();
        self.kind = CascadeKind::Restart;
        self.reporter = None;
    }
}
