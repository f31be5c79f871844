use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Shutdown already in progress")]
    ShutdownInProgress,

    #[error("No free port on {host} in range {min}..{max}")]
    PortsExhausted { host: String, min: u16, max: u16 },

    #[error("Unknown bridge: {0}")]
    UnknownBridge(String),

    #[error("Bridge bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Handoff aborted: {0}")]
    HandoffAborted(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
