use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::bridge::Bridge;
use crate::config::WorkerConfig;
use crate::control::{BusEvent, Command, CommandKind, Dispatcher, Link, LinkId, LogLevel, Side};
use crate::error::Result;
use crate::net;
use crate::shutdown::install_shutdown_handler;
use crate::stats::resident_memory;
use crate::worker::drain::{DrainPolicy, DrainState, DrainTimer};
use crate::worker::http::{self, WorkerHttpState};

/// Upper bound on waiting for the last commands to reach the supervisor.
pub const EXIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested and the drain conditions are met.
    Drained,
    /// The supervisor connection closed.
    SupervisorGone,
    /// A heartbeat could not be written.
    PingFailed,
}

/// Worker-side end of the control bus.
pub struct WorkerAgent {
    pid: u32,
    port: u16,
    born_at: DateTime<Utc>,
    link: Link,
    drain: Arc<DrainState>,
    timer: DrainTimer,
}

impl WorkerAgent {
    pub fn new(config: &WorkerConfig, pid: u32, port: u16, link: Link, drain: Arc<DrainState>) -> Self {
        Self {
            pid,
            port,
            born_at: Utc::now(),
            link,
            drain,
            timer: DrainTimer::new(DrainPolicy {
                fail_checks: config.drain_fail_checks,
                max_checks: config.drain_max_checks,
            }),
        }
    }

    /// Commands a worker accepts from its supervisor.
    pub fn dispatcher() -> Dispatcher<WorkerAgent> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.def(CommandKind::Shutdown);
        dispatcher
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_shutdown_requested()
    }

    pub fn register(&self) -> bool {
        self.link.send(&Command::Register {
            pid: self.pid,
            port: self.port,
        })
    }

    /// Send a heartbeat. Returns false if the supervisor can no longer be reached.
    pub fn ping(&self) -> bool {
        self.link.send(&Command::Ping {
            pid: self.pid,
            memory: resident_memory(None).unwrap_or(0),
            born_at: self.born_at,
            ping_at: Utc::now(),
        })
    }

    pub fn begin_drain(&self, reason: &str) {
        if self.drain.request_shutdown() {
            tracing::info!(pid = self.pid, port = self.port, reason, "Draining worker");
            self.link.send(&Command::log(
                LogLevel::Info,
                format!("Worker {} draining ({})", self.pid, reason),
            ));
        }
    }

    /// One drain-check period elapsed. Returns true when the worker should exit.
    pub fn drain_tick(&mut self) -> bool {
        self.timer.tick(&self.drain)
    }

    /// Say goodbye to the supervisor and wait briefly for it to be written.
    pub async fn exit(self, reason: ExitReason) {
        match reason {
            ExitReason::Drained => {
                tracing::info!(pid = self.pid, failed_checks = self.drain.failed_checks(), "Worker drained, exiting");
                self.link.send(&Command::log(
                    LogLevel::Info,
                    format!("Worker {} drained after {} checks", self.pid, self.timer.ticks()),
                ));
            }
            ExitReason::SupervisorGone => tracing::warn!(pid = self.pid, "Supervisor connection lost, exiting"),
            ExitReason::PingFailed => tracing::warn!(pid = self.pid, "Heartbeat failed, exiting"),
        }

        self.link.send(&Command::Unregister { pid: self.pid });
        self.link.close();
        let _ = tokio::time::timeout(EXIT_FLUSH_TIMEOUT, self.link.flushed()).await;
    }
}

impl Side for WorkerAgent {
    fn handle_default(&mut self, _from: LinkId, command: Command) {
        match command {
            Command::Shutdown => self.begin_drain("shutdown requested by supervisor"),
            other => tracing::debug!(cmd = %other.kind(), "Ignoring command"),
        }
    }
}

/// Run a worker process until it drains or loses its supervisor.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let pid = std::process::id();

    let mut bridge = Bridge::from_name(&config.bridge, &config.working_directory)?;
    bridge.bootstrap(&config.bootstrap, &config.app_env)?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<BusEvent>();
    let link = Link::connect(config.control_addr(), events_tx).await?;

    let (listener, port) = match net::bind_worker_listener(config.host, config.min_port, config.max_port) {
        Ok(bound) => bound,
        Err(e) => {
            link.close();
            let _ = tokio::time::timeout(EXIT_FLUSH_TIMEOUT, link.flushed()).await;
            return Err(e);
        }
    };

    let drain = Arc::new(DrainState::default());
    let app = http::router(
        &config.check_url,
        WorkerHttpState {
            bridge: Arc::new(bridge),
            drain: drain.clone(),
        },
    );
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Worker HTTP server failed");
        }
    });

    let mut agent = WorkerAgent::new(&config, pid, port, link, drain);
    let dispatcher = WorkerAgent::dispatcher();
    agent.register();
    tracing::info!(pid, port, master_pid = config.master_pid, "Worker registered");

    let mut shutdown = install_shutdown_handler();
    let mut signalled = false;
    let mut ping = interval_at(Instant::now() + config.ping_interval(), config.ping_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drain_check = interval(config.drain_check_interval());
    drain_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(BusEvent::Command(from, command)) => {
                    dispatcher.dispatch(&mut agent, from, command);
                }
                Some(BusEvent::Closed(_)) | None => break ExitReason::SupervisorGone,
            },
            _ = ping.tick() => {
                if !agent.ping() {
                    break ExitReason::PingFailed;
                }
            }
            _ = drain_check.tick() => {
                if agent.drain_tick() {
                    break ExitReason::Drained;
                }
            }
            received = &mut shutdown, if !signalled => {
                signalled = true;
                if let Ok(signal) = received {
                    agent.begin_drain(&signal.to_string());
                }
            }
        }
    };

    agent.exit(reason).await;
    Ok(())
}
