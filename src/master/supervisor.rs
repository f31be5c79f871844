use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::MasterConfig;
use crate::control::{Command, Link, LinkId, LogLevel, Side};
use crate::master::cascade::{Cascade, CascadeKind};
use crate::master::spawner::Spawner;
use crate::master::state::SupervisorState;
use crate::master::status::{ClusterStatus, WorkerView};
use crate::master::Directive;
use crate::pool::{Worker, WorkerPool, WorkerStatus};
use crate::shutdown::ShutdownSignal;
use crate::stats::UsageSampler;

/// CPU usage above which a worker is asked to shut down.
pub const CPU_LIMIT_PERCENT: f64 = 10.0;

/// Delay between handing over the last worker and exiting.
pub const HANDOFF_EXIT_DELAY: Duration = Duration::from_secs(1);

/// Delay before closing a rejected handoff connection.
pub const REJECT_CLOSE_DELAY: Duration = Duration::from_secs(1);

/// Time given to link writers to flush before a stopped master exits.
pub const EXIT_FLUSH_DELAY: Duration = Duration::from_millis(200);

const SHUTDOWN_IN_PROGRESS: &str = "Cluster shutdown already in progress.\n";

/// Owner of the worker pool and every supervisor-side link.
///
/// All methods are synchronous state transitions. Work that needs the runtime (binding
/// sockets, timers, exiting) is queued as [`Directive`]s for the event loop.
pub struct Supervisor {
    config: MasterConfig,
    pid: u32,
    workers_control_port: u16,
    pool: WorkerPool,
    state: SupervisorState,
    cascade: Option<Cascade>,
    /// Links not owned by a worker record: operators, handoff peers, unregistered workers.
    links: HashMap<LinkId, Link>,
    predecessor: Option<LinkId>,
    takeover_permitted: bool,
    running: bool,
    balancer_started: bool,
    spawner: Box<dyn Spawner>,
    usage: Box<dyn UsageSampler>,
    directives: Vec<Directive>,
}

impl Supervisor {
    pub fn new(
        config: MasterConfig,
        pid: u32,
        workers_control_port: u16,
        spawner: Box<dyn Spawner>,
        usage: Box<dyn UsageSampler>,
    ) -> Self {
        let state = SupervisorState::new(config.workers);
        Self {
            config,
            pid,
            workers_control_port,
            pool: WorkerPool::new(),
            state,
            cascade: None,
            links: HashMap::new(),
            predecessor: None,
            takeover_permitted: false,
            running: false,
            balancer_started: false,
            spawner,
            usage,
            directives: Vec::new(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn cascade(&self) -> Option<&Cascade> {
        self.cascade.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn takeover_permitted(&self) -> bool {
        self.takeover_permitted
    }

    pub fn balancer_started(&self) -> bool {
        self.balancer_started
    }

    pub fn mark_balancer_started(&mut self) {
        self.balancer_started = true;
    }

    pub fn take_directives(&mut self) -> Vec<Directive> {
        std::mem::take(&mut self.directives)
    }

    /// Take ownership of a freshly accepted or connected link.
    pub fn attach(&mut self, link: Link) {
        self.links.insert(link.id(), link);
    }

    /// Attach the link to the master this one is taking over from.
    pub fn attach_predecessor(&mut self, link: Link) {
        self.predecessor = Some(link.id());
        self.attach(link);
    }

    /// Begin normal operation as the primary master.
    pub fn start(&mut self) {
        self.running = true;
        tracing::info!(
            pid = self.pid,
            workers = self.state.target(),
            workers_control_port = self.workers_control_port,
            "Supervisor running"
        );
        self.check_workers();
    }

    /// Promote a successor once it holds the control port.
    pub fn take_over(&mut self) {
        self.running = true;
        tracing::info!(pid = self.pid, workers = self.pool.len(), "Took over from previous master");
        if !self.balancer_started {
            self.balancer_started = true;
            self.directives.push(Directive::SpawnBalancer);
        }
        self.check_workers();
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            pid: self.pid,
            host: self.config.host.to_string(),
            port: self.config.port,
            shutdown_lock: self.state.shutdown_lock(),
            waited_workers: self.state.waited_workers(),
            workers_count: self.pool.len(),
            allow_new_instances: self.state.allow_new_instances(),
            workers_control_port: self.workers_control_port,
            balancer_port: self.config.balancer_addr().port(),
            workers: self.pool.iter().map(WorkerView::from).collect(),
        }
    }

    fn send_to(&self, id: LinkId, command: &Command) -> bool {
        self.links.get(&id).map_or(false, |link| link.send(command))
    }

    fn report(&self, id: Option<LinkId>, text: &str) {
        if let Some(link) = id.and_then(|id| self.links.get(&id)) {
            link.write_text(text);
        }
    }

    pub fn close_link(&mut self, id: LinkId) {
        if let Some(link) = self.links.remove(&id) {
            link.close();
        }
    }

    pub fn register(&mut self, from: LinkId, pid: u32, port: u16) {
        self.state.spawn_registered(pid);

        if self.pool.port_of_link(from).is_some() {
            tracing::debug!(pid, port, "Worker already registered");
            return;
        }
        if self.pool.len() >= self.state.target() {
            tracing::warn!(pid, port, workers = self.pool.len(), "Worker pool is full, rejecting registration");
            self.close_link(from);
            return;
        }
        let Some(link) = self.links.remove(&from) else {
            tracing::debug!(link = %from, pid, "Register on unknown link");
            return;
        };

        let worker = Worker::register(pid, self.config.host, port, link);
        if let Err(worker) = self.pool.add(worker) {
            tracing::warn!(pid, port, "Port already taken by another worker, rejecting registration");
            worker.close();
            return;
        }
        tracing::info!(pid, port, "New worker up and ready");

        if !self.balancer_started {
            self.balancer_started = true;
            self.directives.push(Directive::SpawnBalancer);
        }
    }

    pub fn unregister(&mut self, from: LinkId, pid: u32) {
        match self
            .pool
            .port_of_pid(pid)
            .or_else(|| self.pool.port_of_link(from))
        {
            Some(port) => {
                tracing::info!(pid, port, "Worker unregistered");
                self.remove_worker(port);
            }
            None => tracing::debug!(pid, "Unregister from unknown worker"),
        }
    }

    pub fn ping(&mut self, pid: u32, memory: u64, born_at: DateTime<Utc>, ping_at: DateTime<Utc>) {
        let cpu = self.usage.cpu_percent(pid);
        let skip_limits = self.pool.has_shutting_down() || self.state.shutdown_lock();
        let memory_limit = self.config.worker_memory_limit;

        let Some(worker) = self.pool.find_by_pid_mut(pid) else {
            tracing::debug!(pid, "Ping from unknown worker");
            return;
        };
        worker.record_ping(memory, cpu, born_at, ping_at);
        if skip_limits {
            return;
        }

        if memory > memory_limit {
            tracing::warn!(pid, memory, limit = memory_limit, "Worker over memory limit, shutting it down");
            worker.request_shutdown();
        } else if let Some(cpu) = cpu.filter(|cpu| *cpu > CPU_LIMIT_PERCENT) {
            tracing::warn!(pid, cpu, limit = CPU_LIMIT_PERCENT, "Worker over CPU limit, shutting it down");
            worker.request_shutdown();
        }
    }

    pub fn status_request(&mut self, from: LinkId) {
        match serde_json::to_string(&self.status()) {
            Ok(json) => self.report(Some(from), &format!("{}\n", json)),
            Err(e) => tracing::error!(error = %e, "Failed to encode status"),
        }
        self.close_link(from);
    }

    pub fn restart(&mut self, from: LinkId) {
        if !self.begin_cascade(CascadeKind::Restart, Some(from)) {
            self.reject(from);
        }
    }

    pub fn stop(&mut self, from: LinkId) {
        if !self.begin_cascade(CascadeKind::Stop, Some(from)) {
            self.reject(from);
        }
    }

    fn reject(&mut self, from: LinkId) {
        self.report(Some(from), SHUTDOWN_IN_PROGRESS);
        self.close_link(from);
    }

    pub fn new_master(&mut self, from: LinkId, pid: u32) {
        tracing::info!(successor_pid = pid, "New master requests handoff");
        if !self.begin_cascade(CascadeKind::Handoff { successor: from }, None) {
            self.send_to(
                from,
                &Command::log(LogLevel::Warn, "Cluster shutdown already in progress, retry later"),
            );
            self.directives.push(Directive::CloseLater {
                link: from,
                after: REJECT_CLOSE_DELAY,
            });
        }
    }

    /// The predecessor handed over one worker slot.
    pub fn new_worker(&mut self, port: Option<u16>) {
        tracing::info!(predecessor_port = ?port, "Taking over a worker slot");
        self.spawn_one();
    }

    pub fn permit_takeover(&mut self) {
        tracing::info!("Predecessor drained, takeover permitted");
        self.takeover_permitted = true;
    }

    pub fn forward_log(&self, from: LinkId, message: &str, level: LogLevel) {
        level.emit(&self.source_of(from), message);
    }

    fn source_of(&self, id: LinkId) -> String {
        if self.predecessor == Some(id) {
            return "predecessor".to_string();
        }
        match self.pool.iter().find(|w| w.link_id() == id) {
            Some(worker) => format!("worker {}", worker.pid),
            None => id.to_string(),
        }
    }

    /// A link reported end of stream.
    pub fn link_closed(&mut self, id: LinkId) {
        if self.predecessor == Some(id) {
            self.predecessor = None;
            self.links.remove(&id);
            if self.takeover_permitted {
                tracing::info!("Predecessor released the control port");
                self.directives.push(Directive::Takeover);
            } else {
                tracing::error!("Predecessor closed the handoff without prepareMaster");
                self.directives.push(Directive::AbortStartup);
            }
            return;
        }

        if let Some(port) = self.pool.port_of_link(id) {
            tracing::debug!(link = %id, port, "Worker connection closed");
            self.remove_worker(port);
            return;
        }

        self.links.remove(&id);
        if let Some(cascade) = self.cascade.as_mut() {
            if cascade.kind() == (CascadeKind::Handoff { successor: id }) {
                tracing::warn!("Successor went away, reverting handoff");
                cascade.revert();
                self.state.enable_new_instances();
            } else if cascade.reporter() == Some(id) {
                tracing::debug!(link = %id, "Operator disconnected, cascade continues");
                cascade.detach_reporter();
            }
        }
    }

    pub fn child_exited(&mut self, pid: u32, code: Option<i32>) {
        if self.state.spawn_exited(pid) {
            tracing::warn!(pid, code = ?code, "Worker exited before registering");
            self.check_workers();
        } else {
            tracing::debug!(pid, code = ?code, "Worker process exited");
        }
    }

    /// SIGTERM or SIGINT reached the master.
    pub fn signal(&mut self, signal: ShutdownSignal) {
        if let Some(cascade) = self.cascade.as_mut() {
            tracing::info!(%signal, cascade = %cascade.kind(), "Escalating cascade to stop, exiting once it completes");
            cascade.escalate_to_stop();
            self.state.disable_new_instances();
        } else if !self.running {
            tracing::info!(%signal, "Signal received before startup completed, exiting");
            self.directives.push(Directive::Exit { after: Duration::ZERO });
        } else {
            tracing::info!(%signal, "Stopping cluster");
            self.begin_cascade(CascadeKind::Stop, None);
        }
    }

    /// Periodic health check.
    pub fn sweep(&mut self, now: Instant) {
        let timeout = self.config.ping_timeout();

        let dead: Vec<u16> = self
            .pool
            .iter()
            .filter(|w| w.link().is_dead())
            .map(|w| w.port)
            .collect();
        for port in dead {
            tracing::debug!(port, "Removing worker with dead connection");
            self.remove_worker(port);
        }

        let silent: Vec<(u32, u16)> = self
            .pool
            .iter()
            .filter(|w| now.saturating_duration_since(w.last_seen) > timeout)
            .map(|w| (w.pid, w.port))
            .collect();
        for (pid, port) in silent {
            tracing::warn!(pid, port, timeout_secs = timeout.as_secs(), "Worker stopped pinging, killing it");
            self.spawner.kill(pid);
            self.remove_worker(port);
        }

        for pid in self.state.expire_pending(now, timeout) {
            tracing::warn!(pid, "Worker never registered, killing it");
            self.spawner.kill(pid);
        }

        self.check_workers();
    }

    /// Remove a worker, close its link and account for it in the running cascade.
    fn remove_worker(&mut self, port: u16) {
        let Some(worker) = self.pool.remove(port) else {
            return;
        };
        let pid = worker.pid;
        let url = worker.url();
        self.usage.forget(pid);
        worker.close();
        tracing::info!(pid, port, "Worker removed from pool");

        if let Some(cascade) = self.cascade.as_mut() {
            if cascade.worker_gone(pid) {
                let reporter = cascade.reporter();
                let kind = cascade.kind();
                self.report(reporter, &format!("Shutdown {}\n", url));
                if let CascadeKind::Handoff { successor } = kind {
                    self.send_to(successor, &Command::NewWorker { port: Some(port) });
                    self.send_to(
                        successor,
                        &Command::log(LogLevel::Info, format!("Handed over worker {}", url)),
                    );
                }
            }
        }

        self.check_workers();
    }

    /// Spawn enough workers to reach the target, counting pending spawns.
    fn check_workers(&mut self) {
        if !self.running {
            return;
        }
        let missing = self.state.spawn_deficit(self.pool.len());
        for _ in 0..missing {
            self.spawn_one();
        }
    }

    fn spawn_one(&mut self) {
        match self.spawner.spawn() {
            Ok(pid) => {
                self.state.spawn_requested(pid, Instant::now());
                tracing::info!(pid, "Spawned worker process");
            }
            Err(e) => tracing::error!(error = %e, "Failed to spawn worker process"),
        }
    }

    fn begin_cascade(&mut self, kind: CascadeKind, reporter: Option<LinkId>) -> bool {
        if let Err(e) = self.state.begin_shutdown() {
            tracing::warn!(error = %e, cascade = %kind, "Rejecting cluster shutdown");
            return false;
        }
        if kind != CascadeKind::Restart {
            self.state.disable_new_instances();
        }
        let pids: Vec<u32> = self.pool.iter().map(|w| w.pid).collect();
        tracing::info!(cascade = %kind, workers = pids.len(), "Starting shutdown cascade");
        self.cascade = Some(Cascade::new(kind, pids, reporter));
        true
    }

    /// Move the cascade forward as far as it can go without waiting on a worker.
    pub fn advance_cascade(&mut self) {
        loop {
            let Some(cascade) = self.cascade.as_mut() else {
                return;
            };
            if cascade.current().is_some() {
                return;
            }
            if cascade.is_done() {
                self.finish_cascade();
                return;
            }
            // Keep capacity within one slot of target while restarting.
            if cascade.kind() == CascadeKind::Restart && self.state.waited_workers() > 0 {
                return;
            }
            let Some(pid) = cascade.start_next() else {
                return;
            };
            let reporter = cascade.reporter();

            let Some(worker) = self.pool.find_by_pid_mut(pid) else {
                cascade.worker_gone(pid);
                continue;
            };
            let port = worker.port;
            let url = worker.url();
            let dead = worker.link().is_dead();
            if dead {
                worker.status = WorkerStatus::ShuttingDown;
            } else {
                worker.request_shutdown();
            }
            self.report(reporter, &format!("Try shutdown {}\n", url));

            if dead {
                tracing::debug!(pid, port, "Worker connection already dead");
                self.remove_worker(port);
                continue;
            }
            tracing::info!(pid, port, "Shutting down worker");
            return;
        }
    }

    fn finish_cascade(&mut self) {
        let Some(cascade) = self.cascade.take() else {
            return;
        };
        self.state.end_shutdown();

        let reporter = cascade.reporter();
        self.report(reporter, "Last worker shutdown.\n");
        if let Some(id) = reporter {
            self.close_link(id);
        }
        tracing::info!(cascade = %cascade.kind(), workers = cascade.shut_down(), "Shutdown cascade complete");

        match cascade.kind() {
            CascadeKind::Restart => self.check_workers(),
            CascadeKind::Stop => {
                self.halt();
                self.directives.push(Directive::Exit {
                    after: EXIT_FLUSH_DELAY,
                });
            }
            CascadeKind::Handoff { successor } => {
                self.halt();
                self.send_to(successor, &Command::log(LogLevel::Info, "All workers handed over"));
                self.send_to(successor, &Command::PrepareMaster);
                self.close_link(successor);
                self.directives.push(Directive::Exit {
                    after: HANDOFF_EXIT_DELAY,
                });
            }
        }
    }

    fn halt(&mut self) {
        self.running = false;
        for pid in self.state.take_pending() {
            self.spawner.kill(pid);
        }
    }
}

impl Side for Supervisor {
    fn handle_default(&mut self, from: LinkId, command: Command) {
        match command {
            Command::Register { pid, port } => self.register(from, pid, port),
            Command::Unregister { pid } => self.unregister(from, pid),
            Command::Ping {
                pid,
                memory,
                born_at,
                ping_at,
            } => self.ping(pid, memory, born_at, ping_at),
            Command::Status => self.status_request(from),
            Command::Restart => self.restart(from),
            Command::Stop => self.stop(from),
            Command::NewWorker { port } => self.new_worker(port),
            Command::NewMaster { pid } => self.new_master(from, pid),
            Command::PrepareMaster => self.permit_takeover(),
            Command::Log { message, level } => self.forward_log(from, &message, level),
            Command::Shutdown => tracing::debug!(link = %from, "Ignoring shutdown sent to a master"),
        }
    }
}
