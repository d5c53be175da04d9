use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::process::exit;

use tracing_subscriber::EnvFilter;

use rudder::{Client, Command, DEFAULT_PORT};

#[tokio::main]
async fn main() -> rudder::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server: SocketAddr = match std::env::args().nth(1) {
        Some(arg) => match arg.parse() {
            Ok(addr) => addr,
            Err(_) => {
                eprintln!("usage: rudder-client [server_ip:port]");
                exit(2);
            }
        },
        None => SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
    };
    let client = Client::new(server, std::env::current_dir()?);
    tracing::info!(%server, "client ready; commands: upload <file>, download <file>, quit");

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match Command::parse(&line) {
            Some(Command::Quit) => break,
            Some(Command::Upload(name)) => match client.upload(&name).await {
                Ok(bytes) => tracing::info!(file = %name, bytes, "upload complete"),
                Err(err) => tracing::warn!(file = %name, %err, "upload failed"),
            },
            Some(Command::Download(name)) => match client.download(&name).await {
                Ok(bytes) => tracing::info!(file = %name, bytes, "download complete"),
                Err(err) => tracing::warn!(file = %name, %err, "download failed"),
            },
            None => tracing::warn!("unrecognized command; use upload <file>, download <file>, quit"),
        }
    }
    Ok(())
}
