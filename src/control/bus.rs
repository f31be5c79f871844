use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::control::command::{decode_fragment, Command};

/// Longest control line accepted from a peer.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// What a link reports to its owner.
#[derive(Debug)]
pub enum BusEvent {
    /// A decoded command arrived.
    Command(LinkId, Command),
    /// The connection is gone. Emitted exactly once per socket-backed link.
    Closed(LinkId),
}

/// Items queued for the writer half.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A line written as-is followed by `\n`.
    Line(String),
    /// Raw text written without framing (operator progress output).
    Text(String),
    /// Flush what is queued, then close the connection.
    Close,
}

/// Sending side of a control-bus connection.
///
/// The link is the sole handle that can write to the connection. Dropping or closing
/// it ends the connection.
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Outbound>,
    alive: CancellationToken,
    flushed: CancellationToken,
}

/// Reading side of a socket-backed link. Run it on its own task.
pub struct LinkReader<E> {
    id: LinkId,
    frames: FramedRead<OwnedReadHalf, ControlCodec>,
    events: mpsc::UnboundedSender<E>,
    alive: CancellationToken,
}

impl Link {
    /// Wrap a connected stream.
    ///
    /// The writer task starts immediately; the returned reader must be spawned by the
    /// caller once it has registered the link, so no command can overtake the
    /// registration.
    pub fn split<E>(stream: TcpStream, events: mpsc::UnboundedSender<E>) -> (Link, LinkReader<E>)
    where
        E: From<BusEvent> + Send + 'static,
    {
        let id = LinkId::next();
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = CancellationToken::new();
        let flushed = CancellationToken::new();

        tokio::spawn(write_loop(write_half, rx, alive.clone(), flushed.clone()));

        let link = Link {
            id,
            peer,
            tx,
            alive: alive.clone(),
            flushed,
        };
        let reader = LinkReader {
            id,
            frames: FramedRead::new(read_half, ControlCodec::new(MAX_LINE_LENGTH)),
            events,
            alive,
        };
        (link, reader)
    }

    /// Connect to `addr` and start both halves.
    pub async fn connect<E>(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<E>,
    ) -> std::io::Result<Link>
    where
        E: From<BusEvent> + Send + 'static,
    {
        let stream = TcpStream::connect(addr).await?;
        let (link, reader) = Link::split(stream, events);
        tokio::spawn(reader.run());
        Ok(link)
    }

    /// In-memory link whose output lands in the returned receiver.
    ///
    /// No reader exists, so the owner is responsible for delivering `Closed`.
    pub fn channel() -> (Link, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Link {
            id: LinkId::next(),
            peer: None,
            tx,
            alive: CancellationToken::new(),
            flushed: CancellationToken::new(),
        };
        (link, rx)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a command. Returns false if the connection is no longer writable.
    pub fn send(&self, command: &Command) -> bool {
        self.push(Outbound::Line(command.encode()))
    }

    /// Queue free-form text, used for operator progress messages.
    pub fn write_text(&self, text: impl Into<String>) -> bool {
        self.push(Outbound::Text(text.into()))
    }

    fn push(&self, item: Outbound) -> bool {
        if self.is_dead() {
            return false;
        }
        self.tx.send(item).is_ok()
    }

    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled() && !self.tx.is_closed()
    }

    pub fn is_dead(&self) -> bool {
        !self.is_alive()
    }

    /// Flush queued output and close the connection.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
        self.alive.cancel();
    }

    /// Resolves once everything queued before `close` has been written out.
    pub async fn flushed(&self) {
        self.flushed.cancelled().await
    }
}

impl<E> LinkReader<E>
where
    E: From<BusEvent> + Send + 'static,
{
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Read lines until the peer goes away or the link is closed locally.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.alive.cancelled() => break,
                frame = self.frames.next() => match frame {
                    Some(Ok(Frame::Line(line))) => {
                        let Some(command) = decode_fragment(&line) else {
                            continue;
                        };
                        tracing::debug!(link = %self.id, cmd = %command.kind(), "Received command");
                        if self.events.send(BusEvent::Command(self.id, command).into()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::Oversized)) => {
                        tracing::warn!(link = %self.id, max = MAX_LINE_LENGTH, "Dropping oversized control line");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(link = %self.id, error = %e, "Control connection read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.alive.cancel();
        let _ = self.events.send(BusEvent::Closed(self.id).into());
    }
}

/// One unit read off the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// A line longer than the limit was discarded up to its terminating `\n`.
    Oversized,
}

/// Newline framing that reports an over-long line as a frame instead of an error.
///
/// `FramedRead` ends the stream after any decoder error, which would tear down the
/// whole link for one bad line.
#[derive(Debug)]
pub struct ControlCodec {
    lines: LinesCodec,
}

impl ControlCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn frame(result: Result<Option<String>, LinesCodecError>) -> io::Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for ControlCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::frame(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::frame(self.lines.decode_eof(buf))
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    alive: CancellationToken,
    flushed: CancellationToken,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Line(mut line) => {
                line.push('\n');
                writer.write_all(line.as_bytes()).await
            }
            Outbound::Text(text) => writer.write_all(text.as_bytes()).await,
            Outbound::Close => break,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Control connection write failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
    alive.cancel();
    flushed.cancel();
}
