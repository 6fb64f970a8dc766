//! Framed JSON transport.
//!
//! Every message is a JSON object prefixed by a 4-byte big-endian length of
//! the payload, which is exactly what [`LengthDelimitedCodec`] speaks by
//! default. Framing failures (short read, EOF) terminate the stream; a frame
//! whose payload fails to decode is dropped silently and the connection stays
//! open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::network::message::Message;
use crate::network::Endpoint;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Cheap, cloneable handle to the write side of one socket.
///
/// Writes are atomic per message: a dedicated writer task drains the channel
/// and serialises one frame at a time. Dropping the last handle closes the
/// channel and ends the writer task, which releases the socket.
#[derive(Clone, Debug)]
pub(crate) struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    /// Spawn the writer task for `write` and return the send handle.
    pub(crate) fn spawn<W>(write: W) -> Connection
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            let mut frames = FramedWrite::new(write, LengthDelimitedCodec::new());
            while let Some(msg) = rx.recv().await {
                let payload = match serde_json::to_vec(&msg) {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::warn!("Cannot serialise outbound message: {err}");
                        continue;
                    }
                };
                if frames.send(Bytes::from(payload)).await.is_err() {
                    break;
                }
            }
        });
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Queue `msg` for sending. Returns false once the writer task is gone.
    pub(crate) fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Identity of the underlying socket, used to tell apart a stored
    /// connection from a replacement that raced it.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// A connection whose messages land in the returned receiver instead of a
    /// socket.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (conn, rx)
    }
}

/// Read side of one socket, yielding decoded messages.
pub(crate) struct MessageStream<R> {
    frames: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
    pub(crate) fn new(read: R) -> Self {
        MessageStream {
            frames: FramedRead::new(read, LengthDelimitedCodec::new()),
        }
    }

    /// Next decodable message, or None once the stream is done (EOF or broken
    /// framing). Undecodable payloads are skipped.
    pub(crate) async fn next(&mut self) -> Option<Message> {
        loop {
            let frame = match self.frames.next().await? {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("Framing error, closing connection: {err}");
                    return None;
                }
            };
            match serde_json::from_slice::<Message>(&frame) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    log::debug!("Dropping undecodable frame: {err}");
                }
            }
        }
    }
}

/// Split a TCP stream into a message reader and a send handle.
pub(crate) fn split(stream: TcpStream) -> (MessageStream<OwnedReadHalf>, Connection) {
    let (read, write) = stream.into_split();
    (MessageStream::new(read), Connection::spawn(write))
}

/// One connect attempt with a per-operation deadline.
pub(crate) async fn connect(target: &Endpoint, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(target.addr())).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

/// Connect with linear backoff: attempt `i` sleeps 1+i seconds on failure.
pub(crate) async fn connect_with_retries(
    target: &Endpoint,
    attempts: u32,
    timeout: Duration,
) -> Option<TcpStream> {
    for attempt in 0..attempts {
        match connect(target, timeout).await {
            Ok(stream) => return Some(stream),
            Err(_) => tokio::time::sleep(Duration::from_secs(1 + u64::from(attempt))).await,
        }
    }
    None
}
