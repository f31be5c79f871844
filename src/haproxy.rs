//! HAProxy configuration for fronting the workers with an external balancer.
//!
//! Workers bind the first free ports of the worker range, so a pool of N workers lives
//! on the first N ports. HAProxy checks each one at the health-check path, which is
//! what lets a draining worker count failed checks and leave early.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use askama::Template;

use crate::config::MasterConfig;
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Template)]
#[template(path = "haproxy.cfg", escape = "none")]
pub struct HaproxyConfig {
    pub bind: SocketAddr,
    pub check_url: String,
    pub servers: Vec<Backend>,
}

impl HaproxyConfig {
    /// Frontend on every interface at the balancer port, one server per worker slot.
    pub fn from_config(config: &MasterConfig) -> Self {
        let bind = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.balancer_addr().port(),
        );
        let servers = (config.workers_min_port..config.workers_max_port)
            .take(config.workers)
            .enumerate()
            .map(|(i, port)| Backend {
                name: format!("app{:02}", i + 1),
                addr: SocketAddr::new(config.host, port),
            })
            .collect();

        Self {
            bind,
            check_url: config.check_path(),
            servers,
        }
    }
}

/// Render the HAProxy config for `config`.
pub fn render(config: &MasterConfig) -> Result<String> {
    HaproxyConfig::from_config(config)
        .render()
        .map_err(|e| FleetError::Config(format!("cannot render haproxy config: {}", e)))
}
