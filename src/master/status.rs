use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::{Worker, WorkerStatus};

/// Snapshot returned to a `status` client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub shutdown_lock: bool,
    pub waited_workers: usize,
    pub workers_count: usize,
    pub allow_new_instances: bool,
    pub workers_control_port: u16,
    pub balancer_port: u16,
    pub workers: Vec<WorkerView>,
}

/// One worker as reported in a [`ClusterStatus`]. Unknown fields are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub born_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
}

impl From<&Worker> for WorkerView {
    fn from(worker: &Worker) -> Self {
        Self {
            pid: worker.pid,
            host: worker.host.to_string(),
            port: worker.port,
            status: worker.status,
            memory: worker.memory,
            cpu_percent: worker.cpu_percent,
            born_at: worker.born_at,
            ping_at: worker.ping_at,
            uptime: worker.uptime(),
        }
    }
}
