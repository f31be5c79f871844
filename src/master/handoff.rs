use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{FleetError, Result};
use crate::net;

/// Attempts made to bind the control port after the predecessor let go.
pub const REBIND_ATTEMPTS: u32 = 10;
pub const REBIND_DELAY: Duration = Duration::from_millis(250);

/// Something that can try to bind the control port.
pub trait PortBinder {
    type Listener;

    fn try_bind(&self, addr: SocketAddr) -> io::Result<Self::Listener>;
}

/// Binds real TCP listeners.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBinder;

impl PortBinder for TcpBinder {
    type Listener = TcpListener;

    fn try_bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        net::bind_listener(addr)
    }
}

/// How a master starts, decided by one bind attempt on the control port.
#[derive(Debug)]
pub enum Role<L> {
    /// The port was free: serve it and spawn workers right away.
    Primary(L),
    /// Another master holds the port: ask it to hand over.
    Successor,
}

impl<L> Role<L> {
    /// Map the outcome of a bind attempt to a role. Errors other than "address in use"
    /// are fatal.
    pub fn from_bind(result: io::Result<L>) -> Result<Self> {
        match result {
            Ok(listener) => Ok(Role::Primary(listener)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(Role::Successor),
            Err(e) => Err(FleetError::Io(e)),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary(_))
    }
}

pub fn decide_role<P: PortBinder>(binder: &P, addr: SocketAddr) -> Result<Role<P::Listener>> {
    Role::from_bind(binder.try_bind(addr))
}

/// Wait `grace`, then bind the control port the predecessor is releasing.
pub async fn rebind<P: PortBinder>(binder: &P, addr: SocketAddr, grace: Duration) -> Result<P::Listener> {
    tokio::time::sleep(grace).await;
    let mut attempt = 1;
    loop {
        match binder.try_bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < REBIND_ATTEMPTS => {
                tracing::debug!(%addr, attempt, "Control port still held by predecessor");
                attempt += 1;
                tokio::time::sleep(REBIND_DELAY).await;
            }
            Err(e) => {
                return Err(FleetError::HandoffAborted(format!(
                    "cannot bind control port {}: {}",
                    addr, e
                )))
            }
        }
    }
}

/// Run [`rebind`] on its own task and post the outcome through `events`.
///
/// The caller's event loop keeps serving while the grace period and retries run.
pub fn spawn_rebind<P, E, F>(
    binder: P,
    addr: SocketAddr,
    grace: Duration,
    events: mpsc::UnboundedSender<E>,
    outcome: F,
) -> JoinHandle<()>
where
    P: PortBinder + Send + Sync + 'static,
    P::Listener: Send,
    E: Send + 'static,
    F: FnOnce(Result<P::Listener>) -> E + Send + 'static,
{
    tokio::spawn(async move {
        let result = rebind(&binder, addr, grace).await;
        if let Err(e) = &result {
            tracing::error!(%addr, error = %e, "Takeover failed");
        }
        let _ = events.send(outcome(result));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with "address in use" a fixed number of times, then succeeds.
    struct BusyPort {
        busy_for: AtomicU32,
    }

    fn busy(times: u32) -> BusyPort {
        BusyPort {
            busy_for: AtomicU32::new(times),
        }
    }

    impl PortBinder for BusyPort {
        type Listener = u16;

        fn try_bind(&self, addr: SocketAddr) -> io::Result<u16> {
            let left = self.busy_for.load(Ordering::SeqCst);
            if left > 0 {
                self.busy_for.store(left - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "busy"));
            }
            Ok(addr.port())
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5500".parse().unwrap()
    }

    #[test]
    fn free_port_makes_a_primary() {
        let binder = busy(0);
        let role = decide_role(&binder, addr()).unwrap();
        assert!(matches!(role, Role::Primary(5500)));
    }

    #[test]
    fn occupied_port_makes_a_successor() {
        let binder = busy(1);
        let role = decide_role(&binder, addr()).unwrap();
        assert!(matches!(role, Role::Successor));
        assert!(!role.is_primary());
    }

    #[test]
    fn other_bind_errors_are_fatal() {
        let result: Result<Role<()>> =
            Role::from_bind(Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope")));
        assert!(matches!(result, Err(FleetError::Io(_))));
    }

    #[tokio::test]
    async fn rebind_retries_while_predecessor_holds_the_port() {
        let binder = busy(3);
        let port = rebind(&binder, addr(), Duration::ZERO).await.unwrap();
        assert_eq!(port, 5500);
    }

    #[tokio::test]
    async fn rebind_gives_up_after_bounded_attempts() {
        let binder = busy(REBIND_ATTEMPTS + 1);
        let result = rebind(&binder, addr(), Duration::ZERO).await;
        assert!(matches!(result, Err(FleetError::HandoffAborted(_))));
    }

    #[tokio::test]
    async fn spawned_rebind_leaves_the_caller_free() {
        let (tx, mut rx) = mpsc::unbounded_channel::<std::result::Result<u16, String>>();
        let handle = spawn_rebind(busy(2), addr(), Duration::from_millis(200), tx.clone(), |result| {
            result.map_err(|e| e.to_string())
        });

        // Other events still flow while the grace period runs.
        tx.send(Err("route request".to_string())).unwrap();
        let first = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert_eq!(first, Some(Err("route request".to_string())));
        assert!(!handle.is_finished());

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(outcome, Some(Ok(5500)));
    }

    #[tokio::test]
    async fn spawned_rebind_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
        spawn_rebind(busy(REBIND_ATTEMPTS + 1), addr(), Duration::ZERO, tx, |result| {
            matches!(result, Err(FleetError::HandoffAborted(_)))
        });
        let aborted = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(aborted, Some(true));
    }
}
