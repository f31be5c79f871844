use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "fleet.json";

/// Environment variable carrying the serialized [`WorkerConfig`] into worker processes.
pub const WORKER_CONFIG_ENV: &str = "FLEET_WORKER_CONFIG";

/// How many ports below `workers_control_port` are tried before giving up.
pub const WORKERS_CONTROL_PORT_ATTEMPTS: u16 = 5;

/// Supervisor configuration.
///
/// Read once at startup (defaults, then `fleet.json`, then CLI overrides) and treated as
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Bind host for every listener. Workers listen on the same host.
    pub host: IpAddr,
    /// Control port: operator commands and master handoff.
    pub port: u16,
    /// Public load-balancer port. Defaults to `port + 1`.
    pub balancer_port: Option<u16>,
    /// Worker registration port. Defaults to `port - 1`.
    pub workers_control_port: Option<u16>,
    /// Target worker count.
    pub workers: usize,
    /// Per-worker resident memory limit in bytes.
    pub worker_memory_limit: u64,
    pub workers_min_port: u16,
    pub workers_max_port: u16,
    /// Seconds without a ping before a worker is killed.
    pub request_timeout: Option<u64>,
    pub ping_interval_ms: u64,
    pub drain_check_interval_ms: u64,
    /// Failed health checks a draining worker waits for before exiting.
    pub drain_fail_checks: u32,
    /// Drain-check ticks before a draining worker exits regardless of checks.
    pub drain_max_checks: u32,
    pub check_url: String,
    pub bridge: String,
    pub bootstrap: String,
    pub app_env: String,
    pub working_directory: PathBuf,
    pub log_file: Option<PathBuf>,
    pub balancer_wait_ms: u64,
    pub handoff_grace_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5500,
            balancer_port: None,
            workers_control_port: None,
            workers: 8,
            worker_memory_limit: 128 * 1024 * 1024,
            workers_min_port: 9001,
            workers_max_port: 9201,
            request_timeout: None,
            ping_interval_ms: 5000,
            drain_check_interval_ms: 1000,
            drain_fail_checks: 3,
            drain_max_checks: 10,
            check_url: "/check".to_string(),
            bridge: "hello".to_string(),
            bootstrap: "public".to_string(),
            app_env: "dev".to_string(),
            working_directory: PathBuf::from("."),
            log_file: None,
            balancer_wait_ms: 5000,
            handoff_grace_ms: 1500,
        }
    }
}

impl MasterConfig {
    /// Load a config file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `fleet.json` from `dir` if present, defaults otherwise.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            tracing::info!(path = %path.display(), "Using config file");
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FleetError::Config("workers must be at least 1".to_string()));
        }
        if self.workers_min_port >= self.workers_max_port {
            return Err(FleetError::Config(format!(
                "empty worker port range {}..{}",
                self.workers_min_port, self.workers_max_port
            )));
        }
        if self.port == 0 || self.port == u16::MAX {
            return Err(FleetError::Config(format!("invalid control port {}", self.port)));
        }
        Ok(())
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn balancer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.balancer_port.unwrap_or(self.port + 1))
    }

    /// Health-check path with a leading '/'.
    pub fn check_path(&self) -> String {
        normalize_check_path(&self.check_url)
    }

    /// Candidate worker registration ports, highest first.
    pub fn workers_control_ports(&self) -> Vec<u16> {
        let first = self.workers_control_port.unwrap_or(self.port - 1);
        (0..WORKERS_CONTROL_PORT_ATTEMPTS)
            .filter_map(|offset| first.checked_sub(offset))
            .filter(|port| *port > 0)
            .collect()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Time without a ping after which a worker is force-killed.
    pub fn ping_timeout(&self) -> Duration {
        match self.request_timeout {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(30) + self.ping_interval() * 3,
        }
    }

    pub fn balancer_wait(&self) -> Duration {
        Duration::from_millis(self.balancer_wait_ms)
    }

    pub fn handoff_grace(&self) -> Duration {
        Duration::from_millis(self.handoff_grace_ms)
    }

    /// Build the config handed to every worker spawned by this master.
    pub fn worker_config(&self, workers_control_port: u16, master_pid: u32) -> WorkerConfig {
        WorkerConfig {
            host: self.host,
            control_port: workers_control_port,
            min_port: self.workers_min_port,
            max_port: self.workers_max_port,
            ping_interval_ms: self.ping_interval_ms,
            drain_check_interval_ms: self.drain_check_interval_ms,
            drain_fail_checks: self.drain_fail_checks,
            drain_max_checks: self.drain_max_checks,
            check_url: self.check_url.clone(),
            bridge: self.bridge.clone(),
            bootstrap: self.bootstrap.clone(),
            app_env: self.app_env.clone(),
            working_directory: self.working_directory.clone(),
            log_file: self.log_file.clone(),
            master_pid,
        }
    }
}

/// Configuration of a single worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub host: IpAddr,
    /// Supervisor's worker registration port.
    pub control_port: u16,
    pub min_port: u16,
    pub max_port: u16,
    pub ping_interval_ms: u64,
    pub drain_check_interval_ms: u64,
    pub drain_fail_checks: u32,
    pub drain_max_checks: u32,
    pub check_url: String,
    pub bridge: String,
    pub bootstrap: String,
    pub app_env: String,
    pub working_directory: PathBuf,
    pub log_file: Option<PathBuf>,
    pub master_pid: u32,
}

impl WorkerConfig {
    /// Read the config the supervisor put in the environment.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(WORKER_CONFIG_ENV)
            .map_err(|_| FleetError::Config(format!("{} is not set", WORKER_CONFIG_ENV)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.control_port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn drain_check_interval(&self) -> Duration {
        Duration::from_millis(self.drain_check_interval_ms)
    }
}

pub fn normalize_check_path(check_url: &str) -> String {
    if check_url.starts_with('/') {
        check_url.to_string()
    } else {
        format!("/{}", check_url)
    }
}
