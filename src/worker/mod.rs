//! Worker process.
//!
//! A worker is the supervisor's binary re-executed with the `worker` subcommand. It:
//! - **Bootstraps** its bridge and exits immediately if that fails
//! - **Registers** over the control bus once its private HTTP listener is bound
//! - **Heartbeats** with a ping carrying pid, resident memory and timestamps
//! - **Drains** on a shutdown command or SIGTERM: the health check starts answering 500
//!   and the worker exits once idle and either failed enough health checks or out of patience
//!
//! Losing the supervisor connection ends the worker without draining.

pub mod agent;
pub mod drain;
pub mod http;

pub use agent::{run, ExitReason, WorkerAgent};
pub use drain::{DrainPolicy, DrainState, DrainTimer};
