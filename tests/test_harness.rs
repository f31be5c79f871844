//! Test harness for supervisor and handoff integration tests.
//!
//! Drives [`Master`] actors directly with in-memory links, a recording spawner and a
//! fixed CPU sampler, so whole cascades can be stepped deterministically.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use fleet_lite::config::MasterConfig;
use fleet_lite::control::{BusEvent, Command, Link, LinkId, Outbound};
use fleet_lite::master::{ClusterStatus, Directive, Event, LinkRole, Master, Spawner, Supervisor};
use fleet_lite::stats::UsageSampler;

/// Everything the fake spawner was asked to do.
#[derive(Debug, Default)]
pub struct SpawnRecord {
    pub next_pid: u32,
    pub spawned: Vec<u32>,
    pub killed: Vec<u32>,
}

pub struct FakeSpawner {
    record: Arc<Mutex<SpawnRecord>>,
}

impl Spawner for FakeSpawner {
    fn spawn(&mut self) -> io::Result<u32> {
        let mut record = self.record.lock().unwrap();
        record.next_pid += 1;
        let pid = record.next_pid;
        record.spawned.push(pid);
        Ok(pid)
    }

    fn kill(&mut self, pid: u32) {
        self.record.lock().unwrap().killed.push(pid);
    }
}

/// Reports whatever CPU usage the test set for a pid.
pub struct FixedUsage {
    cpu: Arc<Mutex<HashMap<u32, f64>>>,
}

impl UsageSampler for FixedUsage {
    fn cpu_percent(&mut self, pid: u32) -> Option<f64> {
        self.cpu.lock().unwrap().get(&pid).copied()
    }
}

/// Config with a fixed control port and `workers` target.
pub fn test_config(workers: usize) -> MasterConfig {
    MasterConfig {
        workers,
        ..MasterConfig::default()
    }
}

/// A test-side end of an in-memory link.
pub struct TestLink {
    pub id: LinkId,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl TestLink {
    /// Everything queued on the link since the last call.
    pub fn take(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            out.push(item);
        }
        out
    }

    pub fn commands(&mut self) -> Vec<Command> {
        commands(&self.take())
    }
}

pub fn commands(items: &[Outbound]) -> Vec<Command> {
    items
        .iter()
        .filter_map(|item| match item {
            Outbound::Line(line) => Command::decode_line(line).ok(),
            _ => None,
        })
        .collect()
}

pub fn text(items: &[Outbound]) -> String {
    items
        .iter()
        .filter_map(|item| match item {
            Outbound::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn is_closed(items: &[Outbound]) -> bool {
    items.iter().any(|item| *item == Outbound::Close)
}

/// A master actor with fake process control.
pub struct TestMaster {
    pub master: Master,
    pub spawns: Arc<Mutex<SpawnRecord>>,
    pub cpu: Arc<Mutex<HashMap<u32, f64>>>,
    pub directives: Vec<Directive>,
    registered: HashSet<u32>,
    next_port: u16,
}

impl TestMaster {
    fn build(config: MasterConfig, pid_base: u32, port_base: u16) -> Self {
        let spawns = Arc::new(Mutex::new(SpawnRecord {
            next_pid: pid_base,
            ..SpawnRecord::default()
        }));
        let cpu = Arc::new(Mutex::new(HashMap::new()));
        let supervisor = Supervisor::new(
            config,
            pid_base,
            5499,
            Box::new(FakeSpawner {
                record: spawns.clone(),
            }),
            Box::new(FixedUsage { cpu: cpu.clone() }),
        );
        let mut master = Master::new(supervisor);
        master.supervisor_mut().mark_balancer_started();
        Self {
            master,
            spawns,
            cpu,
            directives: Vec::new(),
            registered: HashSet::new(),
            next_port: port_base,
        }
    }

    /// A running primary that already asked for its target worker count.
    pub fn primary(config: MasterConfig, pid_base: u32, port_base: u16) -> Self {
        let mut tm = Self::build(config, pid_base, port_base);
        let directives = tm.master.start();
        tm.directives.extend(directives);
        tm
    }

    /// A master that has not taken over yet.
    pub fn successor(config: MasterConfig, pid_base: u32, port_base: u16) -> Self {
        Self::build(config, pid_base, port_base)
    }

    /// What the event loop does on `Directive::Takeover` once the control port is bound.
    pub fn take_over(&mut self) -> Vec<Directive> {
        let directives = self.master.take_over();
        self.directives.extend(directives.iter().cloned());
        directives
    }

    pub fn supervisor(&self) -> &Supervisor {
        self.master.supervisor()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Directive> {
        let directives = self.master.handle(event);
        self.directives.extend(directives.iter().cloned());
        directives
    }

    pub fn connect(&mut self, role: LinkRole) -> TestLink {
        let (link, rx) = Link::channel();
        let id = link.id();
        self.handle(Event::Accepted { link, role });
        TestLink { id, rx }
    }

    pub fn send(&mut self, link: &TestLink, command: Command) -> Vec<Directive> {
        self.handle(Event::Bus(BusEvent::Command(link.id, command)))
    }

    pub fn close(&mut self, link: &TestLink) -> Vec<Directive> {
        self.handle(Event::Bus(BusEvent::Closed(link.id)))
    }

    pub fn spawned(&self) -> Vec<u32> {
        self.spawns.lock().unwrap().spawned.clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.spawns.lock().unwrap().killed.clone()
    }

    pub fn set_cpu(&self, pid: u32, percent: f64) {
        self.cpu.lock().unwrap().insert(pid, percent);
    }

    /// Register one worker for every spawned pid that has not registered yet.
    pub fn register_spawned(&mut self) -> Vec<(u32, TestLink)> {
        let pending: Vec<u32> = self
            .spawned()
            .into_iter()
            .filter(|pid| !self.registered.contains(pid))
            .collect();

        let mut links = Vec::new();
        for pid in pending {
            self.registered.insert(pid);
            let port = self.next_port;
            self.next_port += 1;
            let link = self.connect(LinkRole::Workers);
            self.send(&link, Command::Register { pid, port });
            links.push((pid, link));
        }
        links
    }

    /// Ask for a status snapshot over a fresh control link.
    pub fn status(&mut self) -> ClusterStatus {
        let mut link = self.connect(LinkRole::Control);
        self.send(&link, Command::Status);
        let items = link.take();
        assert!(is_closed(&items), "status link should be closed");
        serde_json::from_str(text(&items).trim()).unwrap()
    }

    pub fn has_exited(&self) -> bool {
        self.directives
            .iter()
            .any(|d| matches!(d, Directive::Exit { .. }))
    }
}
