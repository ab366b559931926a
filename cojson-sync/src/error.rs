//! Error types for the sync layer.

use cojson_types::PeerId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Peer disconnects and ping timeouts are not errors: they arrive as
/// [`PeerEvent`](crate::PeerEvent)s.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The underlying socket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer not found.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}
