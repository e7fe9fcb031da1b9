//! WebSocket push server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::log::EventLog;
use alertline_protocol::{
    decode_outbound, ChannelId, EventEnvelope, InboundFrame, OutboundFrame, ServerNotice,
    SubscribeRequest, SubscriptionAck, SyncComplete, Value,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct ServerShared {
    config: ServerConfig,
    log: Arc<EventLog>,
    acks: Mutex<HashMap<String, Vec<String>>>,
    subscribes: Mutex<Vec<SubscribeRequest>>,
    sessions: AtomicUsize,
    kick: Mutex<CancellationToken>,
}

/// Reference push server.
///
/// On `subscribe` it replies with a `subscription_ack` carrying each
/// channel's backlog, streams the backlog in shuffled bursts (optionally
/// with duplicates), then sends `sync_complete` per channel. Events
/// published afterwards are pushed live.
pub struct PushServer {
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl PushServer {
    /// Binds and starts accepting connections with an empty log.
    pub async fn bind(config: ServerConfig) -> ServerResult<(Self, SocketAddr)> {
        Self::bind_with_log(config, Arc::new(EventLog::new())).await
    }

    /// Binds and starts accepting connections over an existing log.
    pub async fn bind_with_log(
        config: ServerConfig,
        log: Arc<EventLog>,
    ) -> ServerResult<(Self, SocketAddr)> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "push server listening");

        let shared = Arc::new(ServerShared {
            config,
            log,
            acks: Mutex::new(HashMap::new()),
            subscribes: Mutex::new(Vec::new()),
            sessions: AtomicUsize::new(0),
            kick: Mutex::new(CancellationToken::new()),
        });
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&shared),
            listener,
            shutdown.clone(),
        ));

        Ok((
            Self {
                shared,
                shutdown,
                accept_task,
            },
            addr,
        ))
    }

    /// The event log.
    pub fn log(&self) -> &Arc<EventLog> {
        &self.shared.log
    }

    /// Publishes an event to the log and to live sessions.
    pub fn publish(
        &self,
        area: &str,
        event_type: &str,
        data: Value,
        require_ack: bool,
    ) -> EventEnvelope {
        self.shared.log.publish(area, event_type, data, require_ack)
    }

    /// Event ids acknowledged by a client, in arrival order, repeats included.
    pub fn acked_ids(&self, client_id: &str) -> Vec<String> {
        self.shared
            .acks
            .lock()
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every subscription request received so far.
    pub fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.shared.subscribes.lock().clone()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    /// Drops every open connection without a close frame.
    pub fn disconnect_all(&self) {
        let token = std::mem::replace(&mut *self.shared.kick.lock(), CancellationToken::new());
        token.cancel();
        tracing::info!("dropping all sessions");
    }

    /// Stops accepting and drops every session.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.disconnect_all();
        if let Err(e) = self.accept_task.await {
            tracing::warn!(error = %e, "accept loop ended abnormally");
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        if shared.sessions.load(Ordering::SeqCst) >= shared.config.max_connections {
            tracing::warn!(peer = %peer, "connection limit reached, refusing");
            continue;
        }

        let kick = shared.kick.lock().clone();
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            shared.sessions.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = serve_connection(&shared, stream, kick).await {
                tracing::debug!(peer = %peer, error = %e, "session ended with error");
            }
            shared.sessions.fetch_sub(1, Ordering::SeqCst);
        });
    }
    tracing::info!("push server stopped");
}

#[derive(Default)]
struct Session {
    client_id: Option<String>,
    sent: HashMap<ChannelId, u64>,
}

async fn serve_connection(
    shared: &ServerShared,
    stream: TcpStream,
    kick: CancellationToken,
) -> ServerResult<()> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let mut live = shared.log.subscribe_live();
    let mut session = Session::default();

    loop {
        tokio::select! {
            _ = kick.cancelled() => {
                tracing::debug!(client_id = ?session.client_id, "session dropped");
                return Ok(());
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(shared, &mut session, &mut sink, &text).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(client_id = ?session.client_id, "session closed by client");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            event = live.recv() => match event {
                Ok(event) => send_live(&mut session, &mut sink, event).await?,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "live feed lagged");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn handle_client_frame(
    shared: &ServerShared,
    session: &mut Session,
    sink: &mut WsSink,
    text: &str,
) -> ServerResult<()> {
    let frame = match decode_outbound(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "bad client frame");
            let notice = InboundFrame::Error(ServerNotice {
                message: format!("invalid request: {e}"),
            });
            return send(sink, &notice).await;
        }
    };

    match frame {
        OutboundFrame::Subscribe(request) => subscribe(shared, session, sink, request).await,
        OutboundFrame::Unsubscribe(request) => {
            for channel in &request.channels {
                session.sent.remove(channel);
            }
            tracing::debug!(client_id = %request.client_id, channels = request.channels.len(), "unsubscribed");
            Ok(())
        }
        OutboundFrame::Ack(ack) => {
            let ids = ack.ids();
            tracing::trace!(client_id = %ack.client_id, count = ids.len(), "ack");
            shared
                .acks
                .lock()
                .entry(ack.client_id)
                .or_default()
                .extend(ids);
            Ok(())
        }
    }
}

async fn subscribe(
    shared: &ServerShared,
    session: &mut Session,
    sink: &mut WsSink,
    request: SubscribeRequest,
) -> ServerResult<()> {
    shared.subscribes.lock().push(request.clone());
    session.client_id = Some(request.client_id.clone());

    let mut ack = SubscriptionAck::default();
    let mut backlog: Vec<EventEnvelope> = Vec::new();
    let mut pending_channels = Vec::new();
    for filter in &request.filters {
        let channel = filter.channel_id();
        let after = if request.reset_consumers {
            None
        } else {
            request
                .sync_state
                .get(&channel)
                .and_then(|record| record.last_seq)
        };
        let events = shared.log.backlog(&channel, after);
        let sent_up_to = events
            .iter()
            .filter_map(|e| e.sequence)
            .max()
            .or(after)
            .unwrap_or(0);
        session.sent.insert(channel.clone(), sent_up_to);
        ack = ack.with_channel(channel.clone(), events.len() as u64);
        if !events.is_empty() {
            pending_channels.push(channel);
        }
        backlog.extend(events);
    }
    tracing::info!(
        client_id = %request.client_id,
        channels = request.filters.len(),
        backlog = backlog.len(),
        reset = request.reset_consumers,
        "subscribed"
    );

    send(sink, &InboundFrame::SubscriptionAck(ack)).await?;
    send_backlog(&shared.config, sink, backlog).await?;
    if shared.config.send_completion {
        for channel in pending_channels {
            send(sink, &InboundFrame::SyncComplete(SyncComplete::new(channel))).await?;
        }
    }
    Ok(())
}

async fn send_backlog(
    config: &ServerConfig,
    sink: &mut WsSink,
    backlog: Vec<EventEnvelope>,
) -> ServerResult<()> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    for (index, chunk) in backlog.chunks(config.burst_size.max(1)).enumerate() {
        if index > 0 && !config.burst_pause.is_zero() {
            tokio::time::sleep(config.burst_pause).await;
        }
        let mut burst = plan_burst(chunk, config.duplicate_ratio, &mut rng);
        if config.shuffle {
            burst.shuffle(&mut rng);
        }
        for event in burst {
            send(sink, &InboundFrame::Event(event)).await?;
        }
    }
    Ok(())
}

/// A burst plus re-sent copies of a random share of it.
fn plan_burst(chunk: &[EventEnvelope], duplicate_ratio: f64, rng: &mut StdRng) -> Vec<EventEnvelope> {
    let duplicates = (chunk.len() as f64 * duplicate_ratio).round() as usize;
    let mut burst = chunk.to_vec();
    burst.extend(chunk.choose_multiple(rng, duplicates).cloned());
    burst
}

async fn send_live(session: &mut Session, sink: &mut WsSink, event: EventEnvelope) -> ServerResult<()> {
    let (Some(sent), Some(seq)) = (session.sent.get_mut(&event.channel), event.sequence) else {
        return Ok(());
    };
    if seq <= *sent {
        return Ok(());
    }
    *sent = seq;
    send(sink, &InboundFrame::Event(event)).await
}

async fn send(sink: &mut WsSink, frame: &InboundFrame) -> ServerResult<()> {
    sink.send(Message::Text(frame.encode()?)).await?;
    Ok(())
}
