//! Process supervisor.
//!
//! One [`Master`] per process owns the worker pool and every supervisor-side link. It
//! runs as an actor: listener tasks, link readers, the balancer and child reapers only
//! send it [`Event`]s, and handlers answer with [`Directive`]s for the event loop to
//! carry out. Three kinds of link feed it, each with its own dispatch table:
//! - **Workers**: register, unregister, ping, log
//! - **Control**: status, restart, stop, newMaster (operators and successors)
//! - **Predecessor**: newWorker, prepareMaster, log (only while taking over)

pub mod cascade;
pub mod handoff;
pub mod spawner;
pub mod state;
pub mod status;
pub mod supervisor;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::balancer::{self, RouteRequest};
use crate::config::MasterConfig;
use crate::control::{BusEvent, Command, CommandKind, Dispatcher, Link, LinkId};
use crate::error::{FleetError, Result};
use crate::net;
use crate::shutdown::{install_shutdown_handler, ShutdownSignal};
use crate::stats::ProcfsSampler;

pub use cascade::{Cascade, CascadeKind};
pub use handoff::{PortBinder, Role, TcpBinder};
pub use spawner::{ProcessSpawner, Spawner};
pub use state::SupervisorState;
pub use status::{ClusterStatus, WorkerView};
pub use supervisor::Supervisor;

/// Period of the health sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Which listener a link came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Workers,
    Control,
    Predecessor,
}

/// Input to the master actor.
#[derive(Debug)]
pub enum Event {
    Bus(BusEvent),
    /// A new link to own. Its reader is started only after this is queued.
    Accepted { link: Link, role: LinkRole },
    /// The balancer wants a worker address.
    Route(RouteRequest),
    ChildExited { pid: u32, code: Option<i32> },
    Tick(Instant),
    Signal(ShutdownSignal),
    CloseLink(LinkId),
    /// The control port was rebound after the predecessor let go.
    ControlBound(TcpListener),
    /// The control port could not be rebound.
    TakeoverFailed(FleetError),
}

impl From<BusEvent> for Event {
    fn from(event: BusEvent) -> Self {
        Event::Bus(event)
    }
}

impl From<RouteRequest> for Event {
    fn from(request: RouteRequest) -> Self {
        Event::Route(request)
    }
}

/// Side effects requested by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Bind the public balancer port and start proxying.
    SpawnBalancer,
    /// Close `link` after a delay.
    CloseLater { link: LinkId, after: Duration },
    /// Stop the event loop and exit the process.
    Exit { after: Duration },
    /// The predecessor let go: bind the control port and start serving.
    Takeover,
    /// The predecessor went away without permitting the takeover.
    AbortStartup,
}

/// The supervisor plus its per-role dispatch tables.
pub struct Master {
    supervisor: Supervisor,
    roles: HashMap<LinkId, LinkRole>,
    workers_bus: Dispatcher<Supervisor>,
    control_bus: Dispatcher<Supervisor>,
    predecessor_bus: Dispatcher<Supervisor>,
}

impl Master {
    pub fn new(supervisor: Supervisor) -> Self {
        let mut workers_bus = Dispatcher::new();
        workers_bus
            .def(CommandKind::Register)
            .def(CommandKind::Unregister)
            .def(CommandKind::Ping)
            .def(CommandKind::Log);

        let mut control_bus = Dispatcher::new();
        control_bus
            .def(CommandKind::Status)
            .def(CommandKind::Restart)
            .def(CommandKind::Stop)
            .def(CommandKind::NewMaster);

        let mut predecessor_bus = Dispatcher::new();
        predecessor_bus
            .def(CommandKind::NewWorker)
            .def(CommandKind::Log)
            .on(CommandKind::PrepareMaster, |supervisor: &mut Supervisor, _, _| {
                supervisor.permit_takeover()
            });

        Self {
            supervisor,
            roles: HashMap::new(),
            workers_bus,
            control_bus,
            predecessor_bus,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    /// Start as primary.
    pub fn start(&mut self) -> Vec<Directive> {
        self.supervisor.start();
        self.settle()
    }

    /// Start serving after a successful takeover.
    pub fn take_over(&mut self) -> Vec<Directive> {
        self.supervisor.take_over();
        self.settle()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Directive> {
        match event {
            Event::Accepted { link, role } => {
                tracing::debug!(link = %link.id(), peer = ?link.peer(), ?role, "Link attached");
                self.roles.insert(link.id(), role);
                if role == LinkRole::Predecessor {
                    self.supervisor.attach_predecessor(link);
                } else {
                    self.supervisor.attach(link);
                }
            }
            Event::Bus(BusEvent::Command(from, command)) => self.dispatch(from, command),
            Event::Bus(BusEvent::Closed(id)) => {
                self.roles.remove(&id);
                self.supervisor.link_closed(id);
            }
            Event::Route(request) => {
                let _ = request.respond(self.supervisor.pool_mut().next_active_addr());
            }
            Event::ChildExited { pid, code } => self.supervisor.child_exited(pid, code),
            Event::Tick(now) => self.supervisor.sweep(now),
            Event::Signal(signal) => self.supervisor.signal(signal),
            Event::CloseLink(id) => self.supervisor.close_link(id),
            Event::ControlBound(_) | Event::TakeoverFailed(_) => {
                tracing::warn!("Takeover outcome must be handled by the event loop");
            }
        }
        self.settle()
    }

    fn dispatch(&mut self, from: LinkId, command: Command) {
        let Some(role) = self.roles.get(&from).copied() else {
            tracing::debug!(link = %from, cmd = %command.kind(), "Command from detached link");
            return;
        };
        let kind = command.kind();
        let bus = match role {
            LinkRole::Workers => &self.workers_bus,
            LinkRole::Control => &self.control_bus,
            LinkRole::Predecessor => &self.predecessor_bus,
        };
        if !bus.dispatch(&mut self.supervisor, from, command) {
            tracing::debug!(link = %from, ?role, cmd = %kind, "Ignoring command not accepted on this bus");
        }
    }

    fn settle(&mut self) -> Vec<Directive> {
        self.supervisor.advance_cascade();
        self.supervisor.take_directives()
    }
}

/// Accept connections on `listener` and hand each one to the actor as a link.
async fn accept_links(listener: TcpListener, role: LinkRole, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, ?role, "Accepted connection");
                let (link, reader) = Link::split(stream, events.clone());
                if events.send(Event::Accepted { link, role }).is_err() {
                    break;
                }
                tokio::spawn(reader.run());
            }
            Err(e) => {
                tracing::warn!(?role, error = %e, "Accept failed");
            }
        }
    }
}

fn start_balancer(config: &MasterConfig, events: &mpsc::UnboundedSender<Event>) -> Result<()> {
    let addr = config.balancer_addr();
    let listener = net::bind_shared_listener(addr)?;
    tracing::info!(%addr, "Load balancer listening");
    tokio::spawn(balancer::serve(listener, events.clone(), config.balancer_wait()));
    Ok(())
}

/// Run a master until it stops, hands over to a successor, or fails to start.
pub async fn run(config: MasterConfig) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
    let control_addr = config.control_addr();
    let pid = std::process::id();

    let role = handoff::decide_role(&TcpBinder, control_addr)?;

    let (workers_listener, workers_control_port) =
        net::bind_first(config.workers_control_ports(), |port| {
            net::bind_listener(SocketAddr::new(config.host, port))
        })?;
    tracing::info!(port = workers_control_port, "Listening for workers");
    tokio::spawn(accept_links(workers_listener, LinkRole::Workers, events_tx.clone()));

    let spawner = ProcessSpawner::new(
        std::env::current_exe()?,
        &config.worker_config(workers_control_port, pid),
        events_tx.clone(),
    )?;
    let supervisor = Supervisor::new(
        config.clone(),
        pid,
        workers_control_port,
        Box::new(spawner),
        Box::new(ProcfsSampler::default()),
    );
    let mut master = Master::new(supervisor);

    let mut directives: VecDeque<Directive> = match role {
        Role::Primary(listener) => {
            tracing::info!(%control_addr, pid, "Starting as primary master");
            tokio::spawn(accept_links(listener, LinkRole::Control, events_tx.clone()));
            start_balancer(&config, &events_tx)?;
            master.supervisor_mut().mark_balancer_started();
            master.start().into()
        }
        Role::Successor => {
            tracing::info!(%control_addr, pid, "Control port in use, requesting handoff");
            let link = Link::connect(control_addr, events_tx.clone()).await?;
            link.send(&Command::NewMaster { pid });
            master
                .handle(Event::Accepted {
                    link,
                    role: LinkRole::Predecessor,
                })
                .into()
        }
    };

    let mut shutdown = install_shutdown_handler();
    let mut signalled = false;
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        while let Some(directive) = directives.pop_front() {
            match directive {
                Directive::SpawnBalancer => {
                    if let Err(e) = start_balancer(&config, &events_tx) {
                        tracing::error!(error = %e, "Failed to bind balancer port");
                    }
                }
                Directive::CloseLater { link, after } => {
                    let events = events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = events.send(Event::CloseLink(link));
                    });
                }
                Directive::Exit { after } => {
                    tokio::time::sleep(after).await;
                    tracing::info!(pid, "Master exiting");
                    return Ok(());
                }
                Directive::Takeover => {
                    handoff::spawn_rebind(
                        TcpBinder,
                        control_addr,
                        config.handoff_grace(),
                        events_tx.clone(),
                        |result| match result {
                            Ok(listener) => Event::ControlBound(listener),
                            Err(e) => Event::TakeoverFailed(e),
                        },
                    );
                }
                Directive::AbortStartup => {
                    return Err(FleetError::HandoffAborted(
                        "predecessor closed the connection before prepareMaster".to_string(),
                    ));
                }
            }
        }

        let batch = tokio::select! {
            Some(event) = events_rx.recv() => match event {
                Event::ControlBound(listener) => {
                    tracing::info!(%control_addr, "Bound control port");
                    tokio::spawn(accept_links(listener, LinkRole::Control, events_tx.clone()));
                    master.take_over()
                }
                Event::TakeoverFailed(e) => return Err(e),
                event => master.handle(event),
            },
            _ = sweep.tick() => master.handle(Event::Tick(Instant::now())),
            received = &mut shutdown, if !signalled => {
                signalled = true;
                match received {
                    Ok(signal) => master.handle(Event::Signal(signal)),
                    Err(_) => Vec::new(),
                }
            }
        };
        directives.extend(batch);
    }
}
