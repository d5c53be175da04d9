//! Sliding-window sender engine.
//!
//! Three cooperating tasks share one session-scoped lock around the window
//! and RTT state: the main task fills the window from the enumerated
//! frames, an ack-reader task applies acknowledgements and RTT samples, and
//! a timer task re-sends overdue frames every sweep. Slots are stamped
//! under the lock before the frame reaches the wire, so a concurrent sweep
//! can at worst send a frame twice, never skip it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use crate::error::{Result, RudderError};
use crate::frame::{Frame, FRAME_LEN};
use crate::rtt::RttEstimator;
use crate::window::SendWindow;
use crate::IDLE_TIMEOUT;

/// Poll period for the ack reader and the retransmission sweeper.
const TICK: Duration = Duration::from_millis(100);

/// Pause between window-fill attempts while the window is full.
const FILL_PAUSE: Duration = Duration::from_millis(10);

/// How many times the END frame is repeated.
const END_REPEAT: u32 = 3;

struct Shared {
    window: SendWindow,
    rtt: RttEstimator,
    last_progress: Instant,
}

/// Drives one outbound transfer to a fixed peer on a dedicated socket.
pub struct Sender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    frames: Vec<Frame>,
    cancelled: Arc<AtomicBool>,
}

impl Sender {
    /// `frames` is the full enumeration of the transfer: DATA frames with
    /// seqs `0..N` and precomputed checksums.
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        frames: Vec<Frame>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self { socket, peer, frames, cancelled }
    }

    /// Run to completion. Returns the number of payload bytes delivered.
    pub async fn run(self) -> Result<u64> {
        let total = self.frames.len() as u32;
        let bytes: u64 = self
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Data { payload, .. } => payload.len() as u64,
                _ => 0,
            })
            .sum();

        let shared = Arc::new(Mutex::new(Shared {
            window: SendWindow::new(total),
            rtt: RttEstimator::new(),
            last_progress: Instant::now(),
        }));
        let finished = Arc::new(AtomicBool::new(false));
        let end_acked = Arc::new(AtomicBool::new(false));

        let ack_task = tokio::spawn(ack_loop(
            Arc::clone(&self.socket),
            self.peer,
            Arc::clone(&shared),
            total,
            Arc::clone(&finished),
            Arc::clone(&end_acked),
        ));
        let timer_task = tokio::spawn(retransmit_loop(
            Arc::clone(&self.socket),
            self.peer,
            Arc::clone(&shared),
            Arc::clone(&finished),
        ));

        let result = self.fill_and_finish(total, &shared, &end_acked).await;

        finished.store(true, Ordering::Relaxed);
        let _ = ack_task.await;
        let _ = timer_task.await;
        result.map(|()| bytes)
    }

    async fn fill_and_finish(
        &self,
        total: u32,
        shared: &Arc<Mutex<Shared>>,
        end_acked: &Arc<AtomicBool>,
    ) -> Result<()> {
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(RudderError::Cancelled);
            }
            let (batch, complete, stalled) = {
                let mut state = shared.lock();
                let now = Instant::now();
                let mut batch = Vec::new();
                while state.window.can_open() {
                    let frame = self.frames[state.window.next_seq() as usize].clone();
                    state.window.open_slot(frame.clone(), now);
                    batch.push(frame);
                }
                (
                    batch,
                    state.window.is_complete(),
                    state.last_progress.elapsed() >= IDLE_TIMEOUT,
                )
            };
            for frame in &batch {
                self.socket.send_to(&frame.encode(), self.peer).await?;
                tracing::trace!(seq = frame.seq(), "data sent");
            }
            if complete {
                break;
            }
            if stalled {
                return Err(RudderError::IdleTimeout(IDLE_TIMEOUT));
            }
            sleep(FILL_PAUSE).await;
        }

        // Let in-flight acks drain before the final exchange.
        let grace = 2 * shared.lock().rtt.rto();
        if total > 0 {
            sleep(grace).await;
        }

        // The END is repeated to tolerate loss; if its ack never shows up
        // the peer's idle timeout closes the far side.
        let end = Frame::End { seq: total };
        for _ in 0..END_REPEAT {
            self.socket.send_to(&end.encode(), self.peer).await?;
            sleep(TICK).await;
            if end_acked.load(Ordering::Relaxed) {
                return Ok(());
            }
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if end_acked.load(Ordering::Relaxed) {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        tracing::debug!("end ack never arrived, closing anyway");
        Ok(())
    }
}

/// Consumes acks from the session socket and applies them to the window.
async fn ack_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    total: u32,
    finished: Arc<AtomicBool>,
    end_acked: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; FRAME_LEN];
    while !finished.load(Ordering::Relaxed) {
        let (len, from) = match timeout(TICK, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                tracing::warn!(%err, "ack socket read failed");
                continue;
            }
            Err(_) => continue,
        };
        if from != peer {
            tracing::debug!(%from, %peer, "datagram from foreign tuple ignored");
            continue;
        }
        let frame = match Frame::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%err, "undecodable datagram dropped");
                continue;
            }
        };
        let seq = match frame {
            Frame::Ack { seq } => seq,
            other => {
                tracing::debug!(kind = ?other.kind(), "unexpected frame kind ignored");
                continue;
            }
        };
        if seq == total {
            end_acked.store(true, Ordering::Relaxed);
            continue;
        }

        let now = Instant::now();
        let mut state = shared.lock();
        let outcome = state.window.mark_ack(seq, now);
        if outcome.newly_acked {
            state.last_progress = now;
            if let Some(sample) = outcome.sample {
                state.rtt.update(sample);
            }
            tracing::trace!(seq, base = state.window.base(), "ack applied");
        }
    }
}

/// Sweeps the window every tick and re-sends overdue frames.
async fn retransmit_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    finished: Arc<AtomicBool>,
) {
    while !finished.load(Ordering::Relaxed) {
        sleep(TICK).await;
        let due = {
            let mut state = shared.lock();
            let rto = state.rtt.rto();
            state.window.due_retransmits(Instant::now(), rto)
        };
        for frame in due {
            tracing::debug!(seq = frame.seq(), "retransmitting");
            if let Err(err) = socket.send_to(&frame.encode(), peer).await {
                tracing::warn!(%err, "retransmit send failed");
            }
        }
    }
}
