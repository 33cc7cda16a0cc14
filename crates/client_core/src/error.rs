use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("another upload is already waiting for file {0}")]
    AlreadyWaiting(String),
    #[error("synchronizer shut down while waiting for file {0}")]
    Abandoned(String),
}

/// A failed payload transfer, split by whether another attempt could succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transient transfer failure: {0}")]
    Transient(String),
    #[error("transfer rejected: {0}")]
    Permanent(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to initiate upload: {0}")]
    Initiate(#[source] anyhow::Error),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("failed to open event stream: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("no keep-alive received for {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("event stream closed by server")]
    Closed,
    #[error("undecodable event frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream transport failed: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}
