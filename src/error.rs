use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),
}
