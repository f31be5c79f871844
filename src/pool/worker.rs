use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::{Command, Link, LinkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    ShuttingDown,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Supervisor-side record of one registered worker process.
///
/// The record owns the worker's control link; removing the record closes it.
#[derive(Debug)]
pub struct Worker {
    pub pid: u32,
    pub host: IpAddr,
    pub port: u16,
    pub status: WorkerStatus,
    pub memory: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub born_at: Option<DateTime<Utc>>,
    pub ping_at: Option<DateTime<Utc>>,
    /// Local receive time of the last ping (or registration), used for liveness.
    pub last_seen: Instant,
    link: Link,
}

impl Worker {
    /// Record created when a Register command arrives.
    pub fn register(pid: u32, host: IpAddr, port: u16, link: Link) -> Self {
        let now = Utc::now();
        Self {
            pid,
            host,
            port,
            status: WorkerStatus::Active,
            memory: None,
            cpu_percent: None,
            born_at: Some(now),
            ping_at: Some(now),
            last_seen: Instant::now(),
            link,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr())
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }

    /// Apply the metrics carried by a ping.
    pub fn record_ping(
        &mut self,
        memory: u64,
        cpu_percent: Option<f64>,
        born_at: DateTime<Utc>,
        ping_at: DateTime<Utc>,
    ) {
        self.memory = Some(memory);
        if cpu_percent.is_some() {
            self.cpu_percent = cpu_percent;
        }
        self.born_at = Some(born_at);
        self.ping_at = Some(ping_at);
        self.last_seen = Instant::now();
    }

    /// Mark the worker as draining and tell it to shut down.
    ///
    /// Returns false without sending anything if it was already shutting down.
    pub fn request_shutdown(&mut self) -> bool {
        if self.status == WorkerStatus::ShuttingDown {
            return false;
        }
        self.status = WorkerStatus::ShuttingDown;
        self.link.send(&Command::Shutdown);
        true
    }

    /// Time between birth and the last ping, formatted as `[Nd ]HH:MM:SS`.
    pub fn uptime(&self) -> Option<String> {
        let born_at = self.born_at?;
        let ping_at = self.ping_at?;
        let secs = (ping_at - born_at).num_seconds().max(0);
        let (days, rest) = (secs / 86_400, secs % 86_400);
        let clock = format!("{:02}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
        Some(if days > 0 {
            format!("{}d {}", days, clock)
        } else {
            clock
        })
    }

    /// Close the control link, consuming the record.
    pub fn close(self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Outbound;
    use chrono::Duration;
    use std::net::Ipv4Addr;

    fn worker(port: u16) -> (Worker, tokio::sync::mpsc::UnboundedReceiver<Outbound>) {
        let (link, rx) = Link::channel();
        (
            Worker::register(100, IpAddr::V4(Ipv4Addr::LOCALHOST), port, link),
            rx,
        )
    }

    #[test]
    fn register_starts_active_with_timestamps() {
        let (w, _rx) = worker(9001);
        assert!(w.is_active());
        assert!(w.born_at.is_some());
        assert!(w.ping_at.is_some());
        assert_eq!(w.url(), "http://127.0.0.1:9001");
    }

    #[test]
    fn request_shutdown_sends_once() {
        let (mut w, mut rx) = worker(9001);
        assert!(w.request_shutdown());
        assert!(!w.request_shutdown());
        assert_eq!(w.status, WorkerStatus::ShuttingDown);

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Line(r#"{"cmd":"shutdown"}"#.to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn record_ping_keeps_previous_cpu_when_unsampled() {
        let (mut w, _rx) = worker(9001);
        let now = Utc::now();
        w.record_ping(1024, Some(3.5), now, now);
        w.record_ping(2048, None, now, now);
        assert_eq!(w.memory, Some(2048));
        assert_eq!(w.cpu_percent, Some(3.5));
    }

    #[test]
    fn uptime_formats_days_and_clock() {
        let (mut w, _rx) = worker(9001);
        let born = Utc::now();
        w.record_ping(0, None, born, born + Duration::seconds(3661));
        assert_eq!(w.uptime().as_deref(), Some("01:01:01"));

        w.record_ping(0, None, born, born + Duration::seconds(2 * 86_400 + 5));
        assert_eq!(w.uptime().as_deref(), Some("2d 00:00:05"));
    }

    #[test]
    fn close_closes_link() {
        let (w, mut rx) = worker(9001);
        w.close();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }
}
