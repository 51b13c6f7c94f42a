pub mod daemon;
pub mod file_transfer;

pub use daemon::RelayServer;
pub use file_transfer::{FileTransferReport, FileTransferSession};
