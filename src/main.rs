use clap::{Parser, Subcommand};
use peer_relay::{
    config::Settings,
    network::{Connector, PeerEvent},
    service::RelayServer,
    Result,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "peer-relay")]
#[command(about = "Peer-to-peer chat relay and file transfer daemon")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay hub
    Serve,
    /// Connect to a relay and log relayed traffic until interrupted
    Join { addr: SocketAddr },
    /// Send one chat message to a relay
    Say { addr: SocketAddr, message: String },
    /// Send a file to the peer at addr
    Send { addr: SocketAddr, file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("peer_relay={}", log_level))
        .init();

    info!("Starting peer-relay v{}", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(Settings::load(cli.config.as_deref())?);

    match cli.command {
        Command::Serve => {
            let server = RelayServer::bind(settings)?;
            tokio::select! {
                result = server.run() => {
                    result?;
                }
                _ = shutdown_signal() => {
                    info!("Shutdown signal received, stopping relay");
                }
            }
        }
        Command::Join { addr } => {
            let mut client = Connector::new(settings).connect(addr).await?;
            info!(%addr, "joined relay");
            tokio::select! {
                _ = async {
                    while let Some(event) = client.next_event().await {
                        log_event(&event);
                    }
                } => {
                    info!("relay closed the connection");
                }
                _ = shutdown_signal() => {
                    info!("Shutdown signal received, leaving relay");
                }
            }
            client.close().await;
        }
        Command::Say { addr, message } => {
            let client = Connector::new(settings).connect(addr).await?;
            client.send_chat(message)?;
            client.close().await;
        }
        Command::Send { addr, file } => {
            let client = Connector::new(settings).connect(addr).await?;
            let bytes = client.send_file(&file).await?;
            info!(file = %file.display(), bytes, "file sent");
            client.close().await;
        }
    }

    Ok(())
}

fn log_event(event: &PeerEvent) {
    match event {
        PeerEvent::Chat { from, text } => info!(peer = %from, %text, "chat"),
        PeerEvent::FileReceived { name, bytes, .. } => {
            info!(file = %name, bytes, "file received")
        }
        PeerEvent::FileFailed { name, reason, .. } => {
            warn!(file = %name, %reason, "file transfer failed")
        }
        PeerEvent::Disconnected { .. } => {}
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    }
}
