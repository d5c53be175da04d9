//! Responder side: the well-known-port dispatcher and the per-transfer
//! session workers.
//!
//! The dispatcher only ever reads the listening socket. Each accepted
//! request gets an independent worker on its own ephemeral socket, so the
//! well-known port is immediately free for the next request and concurrent
//! sessions can never confuse each other's frames.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{Result, RudderError};
use crate::frame::{Frame, FRAME_LEN};
use crate::io::{enumerate_frames, FileSink, FileSource};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::session::{validate_filename, UPLOAD_PREFIX};

/// Accepts transfer requests and spawns one session per request.
pub struct Server {
    socket: Arc<UdpSocket>,
    root: PathBuf,
}

impl Server {
    /// Bind the well-known socket. Transfers are stored in and served from
    /// `root`.
    pub async fn bind(addr: SocketAddr, root: impl Into<PathBuf>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "server listening");
        Ok(Self { socket: Arc::new(socket), root: root.into() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve forever. The loop never blocks on session I/O; malformed or
    /// unknown requests are logged and discarded, and worker failures are
    /// isolated from the accept path.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; FRAME_LEN];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let frame = match Frame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(%from, %err, "undecodable request dropped");
                    continue;
                }
            };
            match frame {
                Frame::UploadRequest { filename } => self.spawn_session(from, filename, true),
                Frame::DownloadRequest { filename } => self.spawn_session(from, filename, false),
                other => {
                    tracing::warn!(%from, kind = ?other.kind(), "unexpected frame on the request port");
                }
            }
        }
    }

    fn spawn_session(&self, client: SocketAddr, filename: String, upload: bool) {
        if let Err(err) = validate_filename(&filename) {
            tracing::warn!(%client, %err, "request rejected");
            return;
        }
        let root = self.root.clone();
        tokio::spawn(async move {
            let op = if upload { "upload" } else { "download" };
            tracing::info!(%client, file = %filename, op, "session started");
            let result = if upload {
                handle_upload(client, &filename, &root).await
            } else {
                handle_download(client, &filename, &root).await
            };
            match result {
                Ok(bytes) => tracing::info!(%client, file = %filename, bytes, "session finished"),
                Err(err) => tracing::warn!(%client, file = %filename, %err, "session failed"),
            }
        });
    }
}

/// Receive one uploaded file on a fresh ephemeral socket.
async fn handle_upload(client: SocketAddr, filename: &str, root: &Path) -> Result<u64> {
    let socket = Arc::new(ephemeral_socket().await?);
    let dest = root.join(format!("{UPLOAD_PREFIX}{filename}"));
    let sink = match FileSink::create(&dest) {
        Ok(sink) => sink,
        Err(err) => {
            let notice = Frame::Error { message: format!("cannot store {filename}") };
            socket.send_to(&notice.encode(), client).await?;
            return Err(RudderError::Io(err));
        }
    };

    // The ack's source port is how the client learns where the session
    // lives from here on.
    socket.send_to(&Frame::Ack { seq: 0 }.encode(), client).await?;

    let cancelled = Arc::new(AtomicBool::new(false));
    Receiver::new(socket, Some(client), sink, cancelled).run().await
}

/// Serve one download from a fresh ephemeral socket. The first DATA frame
/// (or the ERROR notice) carries the ephemeral port back to the client.
async fn handle_download(client: SocketAddr, filename: &str, root: &Path) -> Result<u64> {
    let socket = Arc::new(ephemeral_socket().await?);
    let path = root.join(filename);
    let mut source = match FileSource::open(&path) {
        Ok(source) => source,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let notice = Frame::Error { message: format!("no such file: {filename}") };
            socket.send_to(&notice.encode(), client).await?;
            return Err(RudderError::NoSuchFile(filename.to_owned()));
        }
        Err(err) => {
            let notice = Frame::Error { message: format!("cannot open {filename}") };
            socket.send_to(&notice.encode(), client).await?;
            return Err(RudderError::Io(err));
        }
    };
    let frames = match enumerate_frames(&mut source) {
        Ok(frames) => frames,
        Err(err) => {
            // Never follow a truncated enumeration with DATA and END.
            let notice = Frame::Error { message: format!("cannot read {filename}") };
            socket.send_to(&notice.encode(), client).await?;
            return Err(err);
        }
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    Sender::new(socket, client, frames, cancelled).run().await
}

async fn ephemeral_socket() -> Result<UdpSocket> {
    Ok(UdpSocket::bind(("0.0.0.0", 0)).await?)
}
