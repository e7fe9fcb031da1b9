//! Error types for the push server.

use alertline_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the push server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A client frame could not be understood.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Frame encoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The websocket handshake or a websocket write failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the client caused this error.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServerError::InvalidRequest(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::WebSocket(error.to_string())
    }
}
