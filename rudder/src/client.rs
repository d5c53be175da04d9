//! Requester-side front end: command parsing and the per-session driver.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::Result;
use crate::session;

/// One parsed user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload(String),
    Download(String),
    Quit,
}

impl Command {
    /// Parse an input line; `None` for blank or unrecognized input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        match (parts.next()?, parts.next(), parts.next()) {
            ("quit", None, _) | ("exit", None, _) => Some(Command::Quit),
            ("upload", Some(name), None) => Some(Command::Upload(name.to_owned())),
            ("download", Some(name), None) => Some(Command::Download(name.to_owned())),
            _ => None,
        }
    }
}

/// Transfer front end; every session gets its own ephemeral socket, so
/// concurrent or back-to-back transfers never share a port.
pub struct Client {
    server: SocketAddr,
    download_dir: PathBuf,
}

impl Client {
    pub fn new(server: SocketAddr, download_dir: impl Into<PathBuf>) -> Self {
        Self { server, download_dir: download_dir.into() }
    }

    pub async fn upload(&self, path: impl AsRef<Path>) -> Result<u64> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        session::upload(socket, self.server, path.as_ref()).await
    }

    pub async fn download(&self, name: &str) -> Result<u64> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        session::download(socket, self.server, name, &self.download_dir).await
    }
}
