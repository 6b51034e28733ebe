use thiserror::Error;

use crate::checkpoint::StoreError;
use crate::config::ConfigError;
use crate::diff::DecodeError;
use crate::document::LiveTextError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Everything that can go wrong while syncing.
///
/// Inside a cycle these are never returned to the caller: the affected
/// document degrades to a full-text resync and the error is logged.
/// Registry operations return them directly.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("delta decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("live text write failed: {0}")]
    LiveText(#[from] LiveTextError),

    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether the document should jump to the minimum interval to recover.
    pub fn wants_immediate_resync(&self) -> bool {
        matches!(self, SyncError::Decode(_) | SyncError::LiveText(_))
    }
}
