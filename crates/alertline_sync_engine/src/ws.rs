//! WebSocket transport.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Connector, FrameSink, Inbound, Link};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::{future, SinkExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens websocket connections with `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for a `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> SyncResult<Link> {
        tracing::debug!(url = %self.url, "opening websocket");
        let (ws, response) = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(classify(e)),
            Err(_) => return Err(SyncError::Timeout),
        };
        tracing::debug!(status = %response.status(), "websocket open");

        let (sink, stream) = ws.split();
        let stream = stream
            .filter_map(|message| future::ready(map_message(message)))
            .boxed();

        Ok(Link {
            sink: Box::new(WsSink { sink }),
            stream,
        })
    }
}

fn map_message(message: Result<Message, tungstenite::Error>) -> Option<SyncResult<Inbound>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text))),
        Ok(Message::Binary(bytes)) => Some(Ok(Inbound::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))),
        Ok(Message::Close(frame)) => Some(Ok(Inbound::Closed(
            frame.map(|f| f.reason.into_owned()),
        ))),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(classify(e))),
    }
}

fn classify(error: tungstenite::Error) -> SyncError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            SyncError::ConnectionClosed(None)
        }
        tungstenite::Error::Url(e) => SyncError::transport_fatal(format!("invalid url: {e}")),
        other => SyncError::transport_retryable(other.to_string()),
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        self.sink.send(Message::Text(text)).await.map_err(classify)
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.sink.close().await.map_err(classify)
    }
}
