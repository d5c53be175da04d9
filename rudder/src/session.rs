//! Requester-side sessions: the request handshake, the ephemeral-port
//! migration, and the engine drive for one upload or download.
//!
//! The requester sends its REQUEST to the well-known port but runs the rest
//! of the session against whatever tuple the first reply arrives from; that
//! is how it learns the responder's per-transfer ephemeral port.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Result, RudderError};
use crate::frame::{Frame, FRAME_LEN, MAX_FILENAME};
use crate::io::{enumerate_frames, FileSink, FileSource};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// Prefix for files stored by the responder on upload.
pub const UPLOAD_PREFIX: &str = "received_";

/// Prefix for files stored by the requester on download.
pub const DOWNLOAD_PREFIX: &str = "downloaded_";

/// How long the requester waits for the first reply to its request.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reject wire filenames that could escape the transfer directory: path
/// separators, NUL bytes, empty names, and anything over the wire bound.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_FILENAME
        || name.bytes().any(|b| b == 0)
        || name.contains(['/', '\\'])
    {
        return Err(RudderError::InvalidFilename(name.to_owned()));
    }
    Ok(())
}

/// Upload the file at `path` to the responder at `server`. Returns the
/// number of payload bytes delivered.
pub async fn upload(socket: Arc<UdpSocket>, server: SocketAddr, path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RudderError::InvalidFilename(path.display().to_string()))?
        .to_owned();
    validate_filename(&name)?;

    // Enumerate before requesting: a missing or unreadable file must never
    // put a REQUEST on the wire.
    let mut source = FileSource::open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => RudderError::NoSuchFile(path.display().to_string()),
        _ => RudderError::Io(err),
    })?;
    let frames = enumerate_frames(&mut source)?;
    tracing::info!(file = %name, frames = frames.len(), "upload starting");

    socket.send_to(&Frame::UploadRequest { filename: name }.encode(), server).await?;

    let (reply, peer) = await_first_reply(&socket).await?;
    match reply {
        Frame::Ack { .. } => {}
        Frame::Error { message } => return Err(RudderError::RemoteRefusal(message)),
        other => {
            tracing::warn!(kind = ?other.kind(), "unexpected handshake reply");
            return Err(RudderError::HandshakeFail);
        }
    }
    tracing::debug!(%peer, "session migrated to ephemeral port");

    let cancelled = Arc::new(AtomicBool::new(false));
    Sender::new(socket, peer, frames, cancelled).run().await
}

/// Download `name` from the responder at `server`, writing
/// `downloaded_<name>` under `dest_dir`. Returns the number of payload
/// bytes received.
pub async fn download(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    name: &str,
    dest_dir: &Path,
) -> Result<u64> {
    validate_filename(name)?;
    let dest = dest_dir.join(format!("{DOWNLOAD_PREFIX}{name}"));
    let sink = FileSink::create(&dest)?;
    tracing::info!(file = %name, dest = %dest.display(), "download starting");

    socket.send_to(&Frame::DownloadRequest { filename: name.to_owned() }.encode(), server).await?;

    // The receiver pins the peer from the first reply (DATA or ERROR), which
    // carries the responder's ephemeral port as its source.
    let cancelled = Arc::new(AtomicBool::new(false));
    Receiver::new(socket, None, sink, cancelled)
        .with_handshake_timeout(HANDSHAKE_TIMEOUT)
        .run()
        .await
}

/// Wait for the first decodable reply and report the tuple it came from.
async fn await_first_reply(socket: &UdpSocket) -> Result<(Frame, SocketAddr)> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut buf = vec![0u8; FRAME_LEN];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RudderError::HandshakeFail);
        }
        let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Err(RudderError::HandshakeFail),
        };
        match Frame::decode(&buf[..len]) {
            Ok(frame) => return Ok((frame, from)),
            Err(err) => {
                tracing::debug!(%from, %err, "undecodable handshake reply dropped");
            }
        }
    }
}
