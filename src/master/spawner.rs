use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::{WorkerConfig, WORKER_CONFIG_ENV};
use crate::error::Result;
use crate::master::Event;

/// Creates and kills worker processes.
pub trait Spawner: Send {
    /// Start one worker process and return its pid.
    fn spawn(&mut self) -> io::Result<u32>;

    /// Kill `pid` without giving it a chance to drain.
    fn kill(&mut self, pid: u32);
}

/// Re-executes the current binary with the `worker` subcommand.
///
/// Every child is awaited on its own task and its exit reported as
/// [`Event::ChildExited`].
pub struct ProcessSpawner {
    program: PathBuf,
    worker_config: String,
    working_directory: PathBuf,
    events: mpsc::UnboundedSender<Event>,
}

impl ProcessSpawner {
    pub fn new(
        program: PathBuf,
        config: &WorkerConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        Ok(Self {
            program,
            worker_config: serde_json::to_string(config)?,
            working_directory: config.working_directory.clone(),
            events,
        })
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&mut self) -> io::Result<u32> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .env(WORKER_CONFIG_ENV, &self.worker_config)
            .current_dir(&self.working_directory)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before reporting a pid"))?;

        let events = self.events.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for worker process");
                    None
                }
            };
            let _ = events.send(Event::ChildExited { pid, code });
        });

        Ok(pid)
    }

    fn kill(&mut self, pid: u32) {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "Failed to kill worker process");
        }
    }
}
