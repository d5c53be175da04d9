use std::net::{Ipv4Addr, SocketAddr};

use tracing_subscriber::EnvFilter;

use rudder::{Server, DEFAULT_PORT};

#[tokio::main]
async fn main() -> rudder::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT));
    let server = Server::bind(addr, std::env::current_dir()?).await?;
    server.run().await
}
