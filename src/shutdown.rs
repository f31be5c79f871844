use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

/// The termination signal a process received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Listen for SIGTERM and SIGINT and report the first one that arrives.
///
/// Both handlers are registered before this returns, so a signal sent right after the
/// call is never lost. A master turns it into a stop cascade; a worker starts draining.
pub fn install_shutdown_handler() -> oneshot::Receiver<ShutdownSignal> {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => ShutdownSignal::Terminate,
            _ = sigint.recv() => ShutdownSignal::Interrupt,
        };
        tracing::info!(pid = std::process::id(), signal = %received, "Received shutdown signal");
        let _ = tx.send(received);
    });

    rx
}
