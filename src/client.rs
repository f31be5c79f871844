//! Operator client for a running master's control port.
//!
//! Each request opens a fresh connection, writes one command line and reads until the
//! master closes the connection. Restart and stop stream progress lines while the
//! cascade runs; status answers with a single JSON document.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::control::Command;
use crate::error::Result;
use crate::master::ClusterStatus;

/// Send `command` and copy everything the master answers into `out`.
pub async fn stream<W>(addr: SocketAddr, command: &Command, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = TcpStream::connect(addr).await?;
    let mut line = command.encode();
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let (mut reader, _writer) = stream.into_split();
    let copied = tokio::io::copy(&mut reader, out).await?;
    out.flush().await?;
    Ok(copied)
}

/// Send `command` and collect the whole answer.
pub async fn request(addr: SocketAddr, command: &Command) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut line = command.encode();
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut answer = String::new();
    stream.read_to_string(&mut answer).await?;
    Ok(answer)
}

pub async fn status(addr: SocketAddr) -> Result<ClusterStatus> {
    let answer = request(addr, &Command::Status).await?;
    Ok(serde_json::from_str(answer.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Accept one connection, check the command line and answer with `reply`.
    async fn one_shot_server(port: u16, expected: Command, reply: &'static str) -> SocketAddr {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            assert_eq!(Command::decode_line(&line).unwrap(), expected);
            write.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn stream_copies_progress_until_close() {
        let addr = one_shot_server(
            19201,
            Command::Restart,
            "Try shutdown http://127.0.0.1:9001\nShutdown http://127.0.0.1:9001\nLast worker shutdown.\n",
        )
        .await;

        let mut out = Vec::new();
        stream(addr, &Command::Restart, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Try shutdown"));
        assert!(text.ends_with("Last worker shutdown.\n"));
    }

    #[tokio::test]
    async fn status_parses_snapshot() {
        let addr = one_shot_server(
            19202,
            Command::Status,
            r#"{"pid":1,"host":"127.0.0.1","port":5500,"shutdown_lock":false,"waited_workers":0,"workers_count":1,"allow_new_instances":true,"workers_control_port":5499,"balancer_port":5501,"workers":[{"pid":2,"host":"127.0.0.1","port":9001,"status":"active"}]}
"#,
        )
        .await;

        let status = status(addr).await.unwrap();
        assert_eq!(status.workers_count, 1);
        assert_eq!(status.workers[0].port, 9001);
        assert_eq!(status.workers[0].memory, None);
    }

    #[tokio::test]
    async fn status_rejects_garbage() {
        let addr = one_shot_server(19203, Command::Status, "Cluster shutdown already in progress.\n").await;
        assert!(matches!(status(addr).await, Err(FleetError::Json(_))));
    }
}
