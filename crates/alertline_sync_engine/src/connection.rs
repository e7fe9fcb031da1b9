//! Connection lifecycle.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Connector, FrameSink, FrameStream, Link};
use alertline_protocol::OutboundFrame;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Connection states observed by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A connection attempt is in progress.
    Connecting,
    /// Connected.
    Open,
    /// Closed on request, or never opened.
    Closed,
    /// The last attempt or the open connection failed.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Owns the one logical connection to the server.
///
/// The manager never retries on its own. A failed connect, a failed send or
/// a dead read side all leave it in [`ConnectionState::Failed`]; deciding
/// when to try again is up to the caller. Sends are serialized through an
/// async mutex so ACKs and subscriptions can be sent from any task.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Creates a manager in the closed state.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            connector,
            sink: Mutex::new(None),
            state,
        }
    }

    /// Opens a connection, replacing any previous one, and returns its read side.
    pub async fn connect(&self) -> SyncResult<FrameStream> {
        self.set_state(ConnectionState::Connecting);
        let previous = self.sink.lock().await.take();
        if let Some(mut sink) = previous {
            let _ = sink.close().await;
        }

        match self.connector.connect().await {
            Ok(Link { sink, stream }) => {
                *self.sink.lock().await = Some(sink);
                self.set_state(ConnectionState::Open);
                tracing::info!("connection open");
                Ok(stream)
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                tracing::warn!(error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Sends one frame. A send failure marks the connection failed.
    pub async fn send(&self, frame: &OutboundFrame) -> SyncResult<()> {
        let text = frame.encode()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SyncError::NotConnected)?;
        match sink.send_text(text).await {
            Ok(()) => {
                tracing::trace!(kind = frame.kind(), "frame sent");
                Ok(())
            }
            Err(e) => {
                guard.take();
                self.set_state(ConnectionState::Failed);
                tracing::warn!(kind = frame.kind(), error = %e, "send failed");
                Err(e)
            }
        }
    }

    /// Closes the connection on request.
    pub async fn disconnect(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "close failed");
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Records that the read side failed and drops the connection.
    pub async fn report_failure(&self, error: &SyncError) {
        self.sink.lock().await.take();
        if self.set_state(ConnectionState::Failed) {
            tracing::warn!(error = %error, "connection failed");
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns true while connected.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
