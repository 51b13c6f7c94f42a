use crate::network::protocol::Frame;
use crate::{RelayError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Stream a local file onto a connection's outbound channel as a
/// file-begin frame, fixed-size chunk frames, and a file-end frame
/// carrying the SHA-256 of the content. The path is validated before
/// the first frame is queued, so the peer is never promised a file
/// that cannot be delivered.
pub async fn send_file(
    path: &Path,
    chunk_size: usize,
    outbound: &mpsc::UnboundedSender<Frame>,
) -> Result<u64> {
    let metadata =
        std::fs::metadata(path).map_err(|_| RelayError::FileNotFound(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(RelayError::FileNotFound(path.to_path_buf()));
    }

    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            RelayError::Protocol(format!("file name of {} is not valid UTF-8", path.display()))
        })?
        .to_string();

    let mut file = File::open(path)
        .await
        .map_err(|_| RelayError::FileNotFound(path.to_path_buf()))?;

    let total = metadata.len();
    queue(
        outbound,
        Frame::FileBegin {
            name: name.clone(),
            size: total,
        },
    )?;

    let mut hasher = Sha256::new();
    let mut sent = 0u64;
    while sent < total {
        let len = (chunk_size as u64).min(total - sent) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        hasher.update(&buf);
        sent += len as u64;
        queue(outbound, Frame::FileChunk(Bytes::from(buf)))?;
    }

    queue(
        outbound,
        Frame::FileEnd {
            checksum: hasher.finalize().to_vec(),
        },
    )?;

    info!(file = %name, bytes = sent, "file queued for transfer");
    Ok(sent)
}

fn queue(outbound: &mpsc::UnboundedSender<Frame>, frame: Frame) -> Result<()> {
    outbound.send(frame).map_err(|_| {
        RelayError::Transport(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection closed",
        ))
    })
}

/// Receiver-side state for one in-flight transfer. Created on file-begin,
/// fed by file-chunk frames, consumed by `finish` on file-end.
pub struct FileTransferSession {
    name: String,
    dest: PathBuf,
    file: File,
    hasher: Sha256,
    declared_size: u64,
    received: u64,
}

/// Outcome of a completed, checksum-verified transfer.
#[derive(Debug)]
pub struct FileTransferReport {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

impl FileTransferSession {
    pub async fn begin(download_dir: &Path, name: &str, declared_size: u64) -> Result<Self> {
        let safe_name = sanitize_file_name(name)?;
        fs::create_dir_all(download_dir).await?;
        let dest = download_dir.join(safe_name);
        let file = File::create(&dest).await?;
        debug!(file = %safe_name, dest = %dest.display(), declared_size, "transfer session opened");

        Ok(Self {
            name: safe_name.to_string(),
            dest,
            file,
            hasher: Sha256::new(),
            declared_size,
            received: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.name
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.received += chunk.len() as u64;
        Ok(())
    }

    /// Flush, close, and verify against the sender's checksum. The file
    /// stays on disk whether or not the digests match; the caller decides
    /// whether to re-request.
    pub async fn finish(mut self, declared_checksum: &[u8]) -> Result<FileTransferReport> {
        self.file.flush().await?;
        drop(self.file);

        if self.received != self.declared_size {
            warn!(
                file = %self.name,
                declared = self.declared_size,
                received = self.received,
                "received byte count differs from declared size"
            );
        }

        let actual = self.hasher.finalize();
        if actual.as_slice() != declared_checksum {
            return Err(RelayError::IntegrityMismatch {
                expected: hex(declared_checksum),
                actual: hex(&actual),
            });
        }

        Ok(FileTransferReport {
            name: self.name,
            path: self.dest,
            bytes: self.received,
        })
    }
}

/// The sender's file name is untrusted input. Only a plain single
/// component is allowed as the destination name.
fn sanitize_file_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(RelayError::Protocol(format!(
            "unsafe file name {:?}",
            name
        )));
    }
    Ok(name)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
