//! Control bus over real TCP connections.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use fleet_lite::control::bus::MAX_LINE_LENGTH;
use fleet_lite::control::{BusEvent, Command, Link, LinkId};

const WAIT: Duration = Duration::from_secs(5);

/// Accept one connection as a server-side link and return the raw client stream.
async fn linked_pair() -> (Link, TcpStream, mpsc::UnboundedReceiver<BusEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let (link, reader) = Link::split(stream, tx);
    tokio::spawn(reader.run());
    (link, client, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> BusEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a bus event")
        .expect("event channel closed")
}

async fn next_command(rx: &mut mpsc::UnboundedReceiver<BusEvent>, link: LinkId) -> Command {
    match next_event(rx).await {
        BusEvent::Command(from, command) => {
            assert_eq!(from, link);
            command
        }
        other => panic!("expected a command, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_line_does_not_poison_its_neighbour() {
    let (link, mut client, mut rx) = linked_pair().await;

    let raw = "this is not json\n{\"cmd\":\"ping\",\"pid\":42,\"memory\":1024,\"born_at\":\"2024-01-01T00:00:00Z\",\"ping_at\":\"2024-01-01T00:01:00Z\"}\n";
    client.write_all(raw.as_bytes()).await.unwrap();

    match next_command(&mut rx, link.id()).await {
        Command::Ping { pid, memory, .. } => {
            assert_eq!(pid, 42);
            assert_eq!(memory, 1024);
        }
        other => panic!("expected ping, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_and_incomplete_commands_are_dropped() {
    let (link, mut client, mut rx) = linked_pair().await;

    client
        .write_all(b"{\"cmd\":\"reboot\"}\n{\"cmd\":\"register\",\"pid\":1}\n\n{\"cmd\":\"status\"}\n")
        .await
        .unwrap();

    assert_eq!(next_command(&mut rx, link.id()).await, Command::Status);
}

#[tokio::test]
async fn commands_split_across_writes_are_reassembled() {
    let (link, mut client, mut rx) = linked_pair().await;

    client.write_all(b"{\"cmd\":\"unreg").await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"ister\",\"pid\":7}\n").await.unwrap();

    assert_eq!(
        next_command(&mut rx, link.id()).await,
        Command::Unregister { pid: 7 }
    );
}

#[tokio::test]
async fn oversized_line_is_skipped() {
    let (link, mut client, mut rx) = linked_pair().await;

    let mut raw = "x".repeat(MAX_LINE_LENGTH + 10);
    raw.push('\n');
    client.write_all(raw.as_bytes()).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"{\"cmd\":\"stop\"}\n").await.unwrap();

    assert_eq!(next_command(&mut rx, link.id()).await, Command::Stop);
    assert!(link.is_alive());

    // A second oversized line in the same write as a valid one.
    let mut raw = "y".repeat(MAX_LINE_LENGTH * 2);
    raw.push_str("\n{\"cmd\":\"status\"}\n");
    client.write_all(raw.as_bytes()).await.unwrap();
    assert_eq!(next_command(&mut rx, link.id()).await, Command::Status);
}

#[tokio::test]
async fn peer_disconnect_reports_closed_once() {
    let (link, client, mut rx) = linked_pair().await;
    drop(client);

    match next_event(&mut rx).await {
        BusEvent::Closed(id) => assert_eq!(id, link.id()),
        other => panic!("expected closed, got {:?}", other),
    }
    // The reader is done: no second Closed, and the channel ends.
    let after = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(matches!(after, Ok(None) | Err(_)), "{:?}", after);
    assert!(link.is_dead());
}

#[tokio::test]
async fn close_flushes_queued_output() {
    let (link, mut client, _rx) = linked_pair().await;

    link.send(&Command::Shutdown);
    link.write_text("Last worker shutdown.\n");
    link.close();
    assert!(!link.send(&Command::Status));

    let mut received = String::new();
    tokio::time::timeout(WAIT, client.read_to_string(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "{\"cmd\":\"shutdown\"}\nLast worker shutdown.\n");
}

#[tokio::test]
async fn connected_link_writes_commands() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, _rx) = mpsc::unbounded_channel::<BusEvent>();
    let link = Link::connect(addr, tx).await.unwrap();
    link.send(&Command::Register { pid: 9, port: 9001 });

    let (stream, _) = listener.accept().await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    let line = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        Command::decode_line(&line).unwrap(),
        Command::Register { pid: 9, port: 9001 }
    );
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, _rx) = mpsc::unbounded_channel::<BusEvent>();
    assert!(Link::connect(addr, tx).await.is_err());
}
