use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket};

use crate::error::{FleetError, Result};

/// Bind the first port of `ports` that `bind` accepts.
///
/// "Address in use" and "permission denied" move on to the next port; any other error
/// is returned immediately.
pub fn bind_first<L, I, F>(ports: I, mut bind: F) -> io::Result<(L, u16)>
where
    I: IntoIterator<Item = u16>,
    F: FnMut(u16) -> io::Result<L>,
{
    let mut last_error = None;
    for port in ports {
        match bind(port) {
            Ok(listener) => return Ok((listener, port)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::debug!(port, error = %e, "Port unavailable, trying next");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port candidates")))
}

/// Bind a plain listener on `addr`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Bind a worker HTTP listener on the first free port in `min..max`.
pub fn bind_worker_listener(host: IpAddr, min: u16, max: u16) -> Result<(TcpListener, u16)> {
    bind_first(min..max, |port| bind_listener(SocketAddr::new(host, port))).map_err(|e| {
        tracing::error!(%host, min, max, error = %e, "No free worker port");
        FleetError::PortsExhausted {
            host: host.to_string(),
            min,
            max,
        }
    })
}

/// Bind a listener that another process may bind at the same time.
///
/// Used for the balancer port, so a new master can start accepting before the old one
/// lets go.
pub fn bind_shared_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}
