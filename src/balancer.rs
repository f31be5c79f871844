//! Public connection-level load balancer.
//!
//! Each accepted connection asks the supervisor for the next active worker and is then
//! piped byte for byte to that worker's private port. Nothing is parsed or buffered;
//! when either side closes, so does the other.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Delay between two routing attempts while no worker is active.
pub const ROUTE_RETRY: Duration = Duration::from_millis(50);

/// A request for the next worker address, answered by whoever owns the pool.
#[derive(Debug)]
pub struct RouteRequest(oneshot::Sender<Option<SocketAddr>>);

impl RouteRequest {
    pub fn new() -> (Self, oneshot::Receiver<Option<SocketAddr>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn respond(self, addr: Option<SocketAddr>) -> Result<(), Option<SocketAddr>> {
        self.0.send(addr)
    }
}

/// Accept public connections forever, proxying each one on its own task.
pub async fn serve<E>(listener: TcpListener, routes: mpsc::UnboundedSender<E>, wait: Duration)
where
    E: From<RouteRequest> + Send + 'static,
{
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Balancer accept failed");
                continue;
            }
        };
        let routes = routes.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy(client, &routes, wait).await {
                tracing::debug!(%peer, error = %e, "Proxied connection ended with error");
            }
        });
    }
}

/// Ask for a worker until one is active or `wait` has elapsed.
pub async fn route<E>(routes: &mpsc::UnboundedSender<E>, wait: Duration) -> Option<SocketAddr>
where
    E: From<RouteRequest>,
{
    let deadline = Instant::now() + wait;
    loop {
        let (request, response) = RouteRequest::new();
        routes.send(request.into()).ok()?;
        if let Some(addr) = response.await.ok()? {
            return Some(addr);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(ROUTE_RETRY).await;
    }
}

async fn proxy<E>(mut client: TcpStream, routes: &mpsc::UnboundedSender<E>, wait: Duration) -> io::Result<()>
where
    E: From<RouteRequest>,
{
    let Some(addr) = route(routes, wait).await else {
        tracing::warn!(wait_ms = wait.as_millis() as u64, "No active worker, dropping connection");
        return Ok(());
    };

    let mut upstream = TcpStream::connect(addr).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    tracing::debug!(worker = %addr, sent, received, "Proxied connection closed");
    Ok(())
}
