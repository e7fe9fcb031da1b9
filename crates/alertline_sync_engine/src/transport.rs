//! Transport layer abstraction.
//!
//! A [`Connector`] opens one full-duplex text connection and returns it as
//! a [`Link`]: a [`FrameSink`] for outbound frames and a [`FrameStream`] of
//! inbound ones. The websocket implementation lives in [`crate::ws`];
//! [`MemoryConnector`] is an in-process pair for tests and embedding.

use crate::error::{SyncError, SyncResult};
use alertline_protocol::{decode_outbound, InboundFrame, OutboundFrame};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex};

/// Something read from the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// The peer closed the connection, with an optional reason.
    Closed(Option<String>),
}

/// Inbound half of a connection. The stream ending means the connection is gone.
pub type FrameStream = BoxStream<'static, SyncResult<Inbound>>;

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one text frame.
    async fn send_text(&mut self, text: String) -> SyncResult<()>;

    /// Closes the connection.
    async fn close(&mut self) -> SyncResult<()>;
}

/// An open connection.
pub struct Link {
    /// Outbound half.
    pub sink: Box<dyn FrameSink>,
    /// Inbound half.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens connections to a push server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> SyncResult<Link>;
}

/// In-process connector.
///
/// Every successful [`connect`](Connector::connect) produces a
/// [`MemoryPeer`] that the test (playing the server) picks up with
/// [`accept`](Self::accept).
#[derive(Debug)]
pub struct MemoryConnector {
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
    fail_next: AtomicU32,
    connects: AtomicU32,
}

impl MemoryConnector {
    /// Creates a connector.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
            fail_next: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Waits for the next client connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SyncResult<Link> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SyncError::transport_retryable("connection refused"));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.peers_tx
            .send(MemoryPeer {
                from_client,
                to_client,
            })
            .map_err(|_| SyncError::transport_fatal("memory connector has no listener"))?;

        let stream = stream::unfold(from_server, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(Link {
            sink: Box::new(MemorySink { tx: Some(to_server) }),
            stream,
        })
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        let tx = self.tx.as_ref().ok_or(SyncError::NotConnected)?;
        tx.send(text)
            .map_err(|_| SyncError::transport_retryable("peer went away"))
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.tx = None;
        Ok(())
    }
}

/// Server side of a [`MemoryConnector`] connection.
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<SyncResult<Inbound>>,
}

impl MemoryPeer {
    /// Receives the next raw frame from the client. `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Receives the next decodable client frame, skipping anything else.
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        loop {
            let text = self.recv().await?;
            if let Ok(frame) = decode_outbound(&text) {
                return Some(frame);
            }
        }
    }

    /// Sends a frame to the client. Returns false if the client is gone.
    pub fn send_frame(&self, frame: &InboundFrame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Sends raw text to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(Inbound::Text(text.into()))).is_ok()
    }

    /// Fails the client's read side with a transport error.
    pub fn fail(&self, message: &str) -> bool {
        self.to_client
            .send(Err(SyncError::transport_retryable(message)))
            .is_ok()
    }

    /// Closes the connection from the server side.
    pub fn close(self, reason: Option<&str>) {
        let _ = self
            .to_client
            .send(Ok(Inbound::Closed(reason.map(str::to_owned))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertline_protocol::{AckFrame, ChannelId, SyncComplete};

    #[tokio::test]
    async fn memory_link_carries_frames_both_ways() {
        let connector = MemoryConnector::new();
        let Link { mut sink, mut stream } = connector.connect().await.unwrap();
        let mut peer = connector.accept().await.unwrap();

        let ack = OutboundFrame::Ack(AckFrame::for_ids("c1", vec!["e1".into()]));
        sink.send_text(ack.encode().unwrap()).await.unwrap();
        assert_eq!(peer.recv_frame().await, Some(ack));

        assert!(peer.send_frame(&InboundFrame::SyncComplete(SyncComplete::new(
            ChannelId::from("giridih_id")
        ))));
        let Some(Ok(Inbound::Text(text))) = stream.next().await else {
            panic!("expected text frame");
        };
        assert!(text.contains("sync_complete"));

        peer.close(Some("bye"));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Inbound::Closed(Some("bye".into()))
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn memory_connector_fails_on_request() {
        let connector = MemoryConnector::new();
        connector.fail_next(2);

        assert!(connector.connect().await.unwrap_err().is_retryable());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn closed_sink_reports_not_connected() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();
        let mut peer = connector.accept().await.unwrap();

        link.sink.close().await.unwrap();
        assert!(matches!(
            link.sink.send_text("x".into()).await,
            Err(SyncError::NotConnected)
        ));
        assert!(peer.recv().await.is_none());
    }
}
