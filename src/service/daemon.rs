use crate::config::Settings;
use crate::network::peer::{spawn_connection, PeerEvent};
use crate::network::registry::{ConnectionRegistry, Role};
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// The relay hub: accepts peer connections and spawns a handler per
/// connection. The accept loop never blocks on per-connection I/O.
pub struct RelayServer {
    settings: Arc<Settings>,
    registry: Arc<ConnectionRegistry>,
    listener: TcpListener,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl RelayServer {
    pub fn bind(settings: Arc<Settings>) -> Result<Self> {
        let addr = settings.bind_address()?;
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(settings.network.backlog)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            settings,
            registry: Arc::new(ConnectionRegistry::new()),
            listener,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Detach the peer event stream. If taken before `run`, the caller
    /// owns event consumption; otherwise `run` logs them.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.take()
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            node = %self.settings.node.name,
            "relay listening"
        );

        if let Some(mut events) = self.events_rx.take() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    log_event(&event);
                }
            });
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "peer connected");
                    if let Err(e) = spawn_connection(
                        stream,
                        Role::Inbound,
                        self.registry.clone(),
                        self.settings.clone(),
                        self.events_tx.clone(),
                    ) {
                        warn!(%addr, error = %e, "failed to start connection handler");
                    }
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn log_event(event: &PeerEvent) {
    match event {
        PeerEvent::Chat { from, text } => {
            info!(peer = %from, %text, "relayed chat");
        }
        PeerEvent::FileReceived {
            from,
            name,
            path,
            bytes,
        } => {
            info!(peer = %from, file = %name, dest = %path.display(), bytes, "stored file");
        }
        PeerEvent::FileFailed { from, name, reason } => {
            warn!(peer = %from, file = %name, %reason, "file transfer failed");
        }
        PeerEvent::Disconnected { peer } => {
            info!(%peer, "peer left");
        }
    }
}
