use crate::config::Settings;
use crate::network::protocol::{Frame, RelayCodec};
use crate::network::registry::{ConnectionRegistry, PeerHandle, Role};
use crate::service::file_transfer::{self, FileTransferSession};
use crate::{RelayError, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound traffic surfaced to the embedding layer: the server daemon
/// logs these, a client hands them to its caller.
#[derive(Debug)]
pub enum PeerEvent {
    Chat {
        from: Uuid,
        text: String,
    },
    FileReceived {
        from: Uuid,
        name: String,
        path: PathBuf,
        bytes: u64,
    },
    FileFailed {
        from: Uuid,
        name: String,
        reason: String,
    },
    Disconnected {
        peer: Uuid,
    },
}

pub struct SpawnedPeer {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Register `stream` and drive its receive loop and writer on new tasks.
/// The receive loop owns the registry membership: whatever ends it —
/// orderly EOF, transport error, framing or protocol violation — removes
/// the connection before the transport is released.
pub fn spawn_connection(
    stream: TcpStream,
    role: Role,
    registry: Arc<ConnectionRegistry>,
    settings: Arc<Settings>,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> Result<SpawnedPeer> {
    let addr = stream.peer_addr()?;
    let id = Uuid::new_v4();
    let max_frame_len = settings.transfer.max_frame_len;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let (read_half, write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, RelayCodec::new(max_frame_len));
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(peer = %id, error = %e, "write failed, closing writer");
                break;
            }
        }
        debug!(peer = %id, "writer task ended");
    });

    let handle = PeerHandle::new(id, addr, role, outbound_tx.clone());
    let reader_registry = registry;
    let reader = tokio::spawn(async move {
        if !reader_registry.add(handle).await {
            return;
        }

        let mut handler = ConnectionHandler {
            id,
            registry: reader_registry.clone(),
            settings,
            events,
            session: None,
        };
        let mut frames = FramedRead::new(read_half, RelayCodec::new(max_frame_len));

        match handler.run(&mut frames).await {
            Ok(()) => info!(peer = %id, %addr, "peer disconnected"),
            Err(e) => warn!(peer = %id, %addr, error = %e, "connection closed"),
        }

        // Removal precedes dropping the transport, so no broadcast can
        // observe this connection once its receive loop is gone.
        reader_registry.remove(id).await;
        let _ = handler.events.send(PeerEvent::Disconnected { peer: id });
    });

    Ok(SpawnedPeer {
        id,
        addr,
        outbound: outbound_tx,
        reader,
        writer,
    })
}

struct ConnectionHandler {
    id: Uuid,
    registry: Arc<ConnectionRegistry>,
    settings: Arc<Settings>,
    events: mpsc::UnboundedSender<PeerEvent>,
    session: Option<FileTransferSession>,
}

impl ConnectionHandler {
    async fn run(&mut self, frames: &mut FramedRead<OwnedReadHalf, RelayCodec>) -> Result<()> {
        while let Some(frame) = frames.next().await {
            match frame? {
                Frame::Chat(text) => {
                    debug!(peer = %self.id, len = text.len(), "chat frame");
                    self.registry
                        .broadcast(Frame::Chat(text.clone()), self.id)
                        .await;
                    let _ = self.events.send(PeerEvent::Chat {
                        from: self.id,
                        text,
                    });
                }
                Frame::FileBegin { name, size } => {
                    if self.session.is_some() {
                        return Err(RelayError::Protocol(
                            "file-begin while a transfer is already active".to_string(),
                        ));
                    }
                    info!(peer = %self.id, file = %name, size, "incoming file transfer");
                    let session = FileTransferSession::begin(
                        &self.settings.transfer.download_dir,
                        &name,
                        size,
                    )
                    .await?;
                    self.session = Some(session);
                }
                Frame::FileChunk(chunk) => {
                    let session = self.session.as_mut().ok_or_else(|| {
                        RelayError::Protocol("file-chunk with no active transfer".to_string())
                    })?;
                    session.write_chunk(&chunk).await?;
                }
                Frame::FileEnd { checksum } => {
                    let session = self.session.take().ok_or_else(|| {
                        RelayError::Protocol("file-end with no active transfer".to_string())
                    })?;
                    let name = session.file_name().to_string();
                    match session.finish(&checksum).await {
                        Ok(report) => {
                            info!(
                                peer = %self.id,
                                file = %report.name,
                                bytes = report.bytes,
                                "file received"
                            );
                            let _ = self.events.send(PeerEvent::FileReceived {
                                from: self.id,
                                name: report.name,
                                path: report.path,
                                bytes: report.bytes,
                            });
                        }
                        // A failed checksum is reported, not fatal; the
                        // connection stays open and the file stays on disk.
                        Err(e @ RelayError::IntegrityMismatch { .. }) => {
                            warn!(peer = %self.id, file = %name, error = %e, "transfer failed verification");
                            let _ = self.events.send(PeerEvent::FileFailed {
                                from: self.id,
                                name,
                                reason: e.to_string(),
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Client role: opens one outbound connection to a remote relay.
pub struct Connector {
    settings: Arc<Settings>,
}

impl Connector {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerClient> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RelayError::Connect { addr, source })?;
        info!(%addr, "connected to peer");

        let registry = Arc::new(ConnectionRegistry::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = spawn_connection(
            stream,
            Role::Outbound,
            registry.clone(),
            self.settings.clone(),
            events_tx,
        )?;

        Ok(PeerClient {
            id: peer.id,
            addr: peer.addr,
            outbound: peer.outbound,
            writer: peer.writer,
            events: events_rx,
            settings: self.settings.clone(),
            registry,
        })
    }
}

/// Handle to one established outbound connection.
pub struct PeerClient {
    id: Uuid,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    writer: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    settings: Arc<Settings>,
    registry: Arc<ConnectionRegistry>,
}

impl PeerClient {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.outbound
            .send(Frame::Chat(text.into()))
            .map_err(|_| closed_pipe())
    }

    pub async fn send_file(&self, path: &Path) -> Result<u64> {
        file_transfer::send_file(path, self.settings.transfer.chunk_size, &self.outbound).await
    }

    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    pub async fn is_connected(&self) -> bool {
        self.registry.count().await > 0
    }

    /// Tear down the connection. Queued frames are flushed before the
    /// socket's write half closes.
    pub async fn close(self) {
        let PeerClient {
            id,
            outbound,
            writer,
            registry,
            ..
        } = self;
        registry.remove(id).await;
        drop(outbound);
        let _ = writer.await;
    }
}

fn closed_pipe() -> RelayError {
    RelayError::Transport(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "connection closed",
    ))
}
