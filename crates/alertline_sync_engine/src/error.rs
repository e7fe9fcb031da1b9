//! Error types for the sync engine.

use alertline_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server or the network closed the connection.
    #[error("connection closed{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed(Option<String>),

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Frame encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sync state persistence failed.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The client was disconnected by the application.
    #[error("sync cancelled")]
    Cancelled,

    /// Reconnect attempts exhausted.
    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::ConnectionClosed(_) | SyncError::NotConnected | SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if this error means the connection is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::ConnectionClosed(_)
                | SyncError::NotConnected
                | SyncError::Timeout
        )
    }
}

/// Errors from the sync state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store cannot be reached right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
