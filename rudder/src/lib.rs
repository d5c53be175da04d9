//! rudder: reliable file transfer over best-effort datagrams.
//!
//! A fixed-size framed protocol with per-frame CRC-32 integrity checks,
//! selective-repeat sliding-window retransmission, Jacobson/Karels adaptive
//! timeouts, and a request handshake that migrates each transfer to its own
//! ephemeral port so a single responder can serve many sessions at once.

use std::time::Duration;

pub mod client;
pub mod error;
pub mod frame;
pub mod io;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod server;
pub mod session;
pub mod window;

pub use client::{Client, Command};
pub use error::{Result, RudderError};
pub use frame::{Frame, FrameKind, FRAME_LEN, MAX_PAYLOAD};
pub use server::Server;
pub use window::{SendWindow, WINDOW_SIZE};

/// Well-known request port.
pub const DEFAULT_PORT: u16 = 9999;

/// A session with no inbound progress for this long is considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
