//! Selective-repeat receiver: out-of-order buffering, selective acks, and
//! contiguous in-order delivery to a sink.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Result, RudderError};
use crate::frame::{crc32, Frame, FRAME_LEN};
use crate::io::ChunkSink;
use crate::IDLE_TIMEOUT;

/// How long one socket read may block before the engine rechecks its flags.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Undecodable datagrams tolerated before the session aborts.
const MAX_MALFORMED: u32 = 64;

/// Outcome of offering one DATA payload to the reorder buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// Not seen before; buffered.
    Fresh,
    /// Already delivered or already buffered.
    Duplicate,
}

/// Sparse seq-to-payload map plus the delivery cursor.
///
/// `expected` is the lowest seq not yet handed to the sink; everything below
/// it has been delivered exactly once.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    expected: u32,
    pending: BTreeMap<u32, Bytes>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest seq not yet delivered.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn insert(&mut self, seq: u32, payload: Bytes) -> Accept {
        if seq < self.expected || self.pending.contains_key(&seq) {
            return Accept::Duplicate;
        }
        self.pending.insert(seq, payload);
        Accept::Fresh
    }

    /// Remove and return the contiguous prefix starting at `expected`.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(payload) = self.pending.remove(&self.expected) {
            out.push(payload);
            self.expected += 1;
        }
        out
    }
}

/// Drives one inbound transfer on a dedicated socket.
///
/// The peer tuple is pinned either up front (responder side, from the
/// dispatched request) or from the source of the first decodable frame
/// (requester side, completing the port-migration handshake). Frames from
/// any other tuple are ignored for the life of the session.
pub struct Receiver<S> {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    sink: S,
    cancelled: Arc<AtomicBool>,
    handshake_timeout: Option<Duration>,
}

impl<S: ChunkSink> Receiver<S> {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
        sink: S,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self { socket, peer, sink, cancelled, handshake_timeout: None }
    }

    /// Bound the wait for the first frame; expiry is a handshake failure
    /// rather than an idle timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Run to completion. Returns the number of payload bytes written to
    /// the sink.
    pub async fn run(mut self) -> Result<u64> {
        let mut buffer = ReorderBuffer::new();
        let mut bytes_written = 0u64;
        let mut malformed = 0u32;
        let mut last_inbound = Instant::now();
        let mut first = true;
        let handshake_deadline = self.handshake_timeout.map(|wait| Instant::now() + wait);
        let mut buf = vec![0u8; FRAME_LEN];

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(RudderError::Cancelled);
            }

            // The handshake wait is a fixed deadline, not a per-read timeout:
            // garbage datagrams must not keep re-arming it.
            let wait = match (first, handshake_deadline) {
                (true, Some(deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.sink.discard()?;
                        return Err(RudderError::HandshakeFail);
                    }
                    remaining
                }
                _ => READ_TIMEOUT,
            };
            let (len, from) = match timeout(wait, self.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) if first && handshake_deadline.is_some() => {
                    self.sink.discard()?;
                    return Err(RudderError::HandshakeFail);
                }
                Err(_) => {
                    if last_inbound.elapsed() >= IDLE_TIMEOUT {
                        return Err(RudderError::IdleTimeout(IDLE_TIMEOUT));
                    }
                    continue;
                }
            };

            let frame = match Frame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    malformed += 1;
                    tracing::debug!(%from, %err, malformed, "undecodable datagram dropped");
                    if malformed > MAX_MALFORMED {
                        return Err(RudderError::TooManyMalformed(malformed));
                    }
                    continue;
                }
            };

            let peer = match self.peer {
                Some(peer) => {
                    if from != peer {
                        tracing::debug!(%from, %peer, "datagram from foreign tuple ignored");
                        continue;
                    }
                    peer
                }
                None => {
                    tracing::debug!(%from, "session peer pinned from first reply");
                    self.peer = Some(from);
                    from
                }
            };
            first = false;
            last_inbound = Instant::now();

            match frame {
                Frame::Error { message } => {
                    self.sink.discard()?;
                    return Err(RudderError::RemoteRefusal(message));
                }
                Frame::End { seq } => {
                    self.socket.send_to(&Frame::Ack { seq }.encode(), peer).await?;
                    let missing = seq.saturating_sub(buffer.expected());
                    if missing > 0 {
                        return Err(RudderError::Incomplete { missing });
                    }
                    self.sink.commit()?;
                    tracing::info!(frames = seq, bytes = bytes_written, "transfer complete");
                    return Ok(bytes_written);
                }
                Frame::Data { seq, payload, checksum } => {
                    if crc32(&payload) != checksum {
                        tracing::debug!(seq, "checksum mismatch, frame dropped");
                        continue;
                    }
                    let accept = buffer.insert(seq, payload);
                    // Ack the exact seq, duplicates included: a re-ack tells
                    // the sender its ack was lost.
                    self.socket.send_to(&Frame::Ack { seq }.encode(), peer).await?;
                    if accept == Accept::Duplicate {
                        tracing::debug!(seq, "duplicate data re-acked");
                        continue;
                    }
                    for chunk in buffer.drain() {
                        self.sink.write_chunk(&chunk)?;
                        bytes_written += chunk.len() as u64;
                    }
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), "unexpected frame kind ignored");
                }
            }
        }
    }
}
