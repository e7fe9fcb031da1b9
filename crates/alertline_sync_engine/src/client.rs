//! The sync client: driver task and application handle.
//!
//! [`SyncClient::start`] spawns one driver task that owns the receive loop.
//! Per session it connects, subscribes with the current sync state, resends
//! pending ACKs, then processes frames until the connection fails. On
//! failure every catch-up channel is forced live, and the driver waits out a
//! backoff before reconnecting. The wait is cancelled by
//! [`SyncHandle::disconnect`].

use crate::ack::AckDispatcher;
use crate::config::{Backoff, SyncConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::coordinator::{ChannelSyncCoordinator, ModeTransition, TransitionReason};
use crate::detector::{CompletionDetector, CompletionReason};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::router::{FrameRouter, Routed};
use crate::store::{StateStore, SyncStateCache};
use crate::tracker::SyncMode;
use crate::transport::{Connector, FrameStream, Inbound};
use alertline_protocol::{
    ChannelId, EventEnvelope, Filter, OutboundFrame, SubscribeRequest, SyncStateMap,
    UnsubscribeRequest,
};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// An accepted event handed to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredEvent {
    /// The event.
    pub event: EventEnvelope,
    /// Mode of its channel when the event was accepted.
    pub mode: SyncMode,
}

/// Everything the client reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A new event.
    Event(DeliveredEvent),
    /// A channel changed mode.
    ModeChanged(ModeTransition),
    /// The connection changed state.
    Connection(ConnectionState),
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Events accepted as new.
    pub events_accepted: u64,
    /// Events dropped as duplicates.
    pub duplicates_dropped: u64,
    /// Frames dropped because they could not be decoded.
    pub malformed_frames: u64,
    /// ACK frames sent.
    pub ack_frames_sent: u64,
    /// Event ids acknowledged.
    pub acks_sent: u64,
    /// Connections opened.
    pub connects: u64,
    /// Reconnects scheduled after a failure.
    pub reconnect_attempts: u64,
    /// Catch-ups ended by the server signal.
    pub completed_by_signal: u64,
    /// Catch-ups ended by inactivity.
    pub completed_by_inactivity: u64,
    /// Catch-ups ended by the hard timeout.
    pub completed_by_timeout: u64,
    /// Catch-ups forced to end by a transport failure.
    pub completed_by_transport_failure: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

impl SyncStats {
    fn record_completion(&mut self, reason: CompletionReason) {
        match reason {
            CompletionReason::Signal => self.completed_by_signal += 1,
            CompletionReason::Inactivity => self.completed_by_inactivity += 1,
            CompletionReason::Timeout => self.completed_by_timeout += 1,
            CompletionReason::TransportFailure => self.completed_by_transport_failure += 1,
        }
    }
}

struct Shared {
    config: SyncConfig,
    connection: ConnectionManager,
    coordinator: Mutex<ChannelSyncCoordinator>,
    acks: Mutex<AckDispatcher>,
    filters: RwLock<Vec<Filter>>,
    state: Arc<SyncStateCache>,
    stats: RwLock<SyncStats>,
    reset_pending: AtomicBool,
    published: Mutex<ConnectionState>,
    events: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    cancel: CancellationToken,
}

enum SessionEnd {
    Cancelled,
    Failed(SyncError),
}

/// Entry point.
#[derive(Debug)]
pub struct SyncClient;

impl SyncClient {
    /// Validates the configuration, loads the sync state and spawns the
    /// driver. Must be called inside a tokio runtime.
    ///
    /// The returned receiver ends once the driver stops, whether through
    /// [`SyncHandle::disconnect`] or because the client gave up.
    pub fn start(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn StateStore>,
    ) -> SyncResult<(SyncHandle, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate()?;

        let state = Arc::new(SyncStateCache::load(store));
        let detector = CompletionDetector::new(config.inactivity_timeout, config.catch_up_timeout);
        let mut coordinator = ChannelSyncCoordinator::new(detector);
        for filter in &config.filters {
            let channel = filter.channel_id();
            let baseline = state.last_seq(&channel);
            coordinator.register(channel, baseline);
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connection: ConnectionManager::new(connector),
            coordinator: Mutex::new(coordinator),
            acks: Mutex::new(AckDispatcher::new(config.client_id.clone(), config.ack.clone())),
            filters: RwLock::new(config.filters.clone()),
            state,
            stats: RwLock::new(SyncStats::default()),
            reset_pending: AtomicBool::new(config.reset_consumers),
            published: Mutex::new(ConnectionState::Closed),
            events: Mutex::new(Some(events)),
            cancel: CancellationToken::new(),
            config,
        });

        tracing::info!(
            client_id = %shared.config.client_id,
            url = %shared.config.server_url,
            channels = shared.config.filters.len(),
            "starting sync client"
        );
        let driver = tokio::spawn(Arc::clone(&shared).drive());

        let handle = SyncHandle {
            shared,
            driver: Arc::new(Mutex::new(Some(driver))),
        };
        Ok((handle, receiver))
    }
}

impl Shared {
    async fn drive(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let router = FrameRouter::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let (end, opened_at) = match self.open_session().await {
                Ok(Some(stream)) => {
                    let opened_at = Instant::now();
                    (self.run_session(stream, &router).await, Some(opened_at))
                }
                Ok(None) => (SessionEnd::Cancelled, None),
                Err(e) => (SessionEnd::Failed(e), None),
            };

            let error = match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(error) => error,
            };
            self.on_transport_failure(&error).await;

            if opened_at.is_some_and(|at| backoff.is_stable(at.elapsed())) {
                backoff.reset();
            }
            if !error.is_retryable() {
                tracing::error!(error = %error, "giving up, error is not retryable");
                break;
            }
            let Some(delay) = backoff.next_delay() else {
                let exhausted = SyncError::ReconnectExhausted(backoff.attempt());
                tracing::error!(error = %exhausted, "giving up");
                self.stats.write().last_error = Some(exhausted.to_string());
                break;
            };

            self.stats.write().reconnect_attempts += 1;
            tracing::info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shutdown().await;
    }

    /// Connects, subscribes and resends pending ACKs. `None` if cancelled
    /// before the connection opened.
    async fn open_session(&self) -> SyncResult<Option<FrameStream>> {
        self.publish_connection(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            connected = self.connection.connect() => connected,
        };
        self.publish_connection(self.connection.state());
        let stream = connected?;
        self.stats.write().connects += 1;

        let reset = self.reset_pending.swap(false, Ordering::SeqCst);
        let filters = self.filters.read().clone();
        let request = self.subscribe_request(filters, reset);
        if let Err(e) = self.connection.send(&OutboundFrame::Subscribe(request)).await {
            if reset {
                self.reset_pending.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }

        self.flush_acks().await?;
        Ok(Some(stream))
    }

    fn subscribe_request(&self, filters: Vec<Filter>, reset_consumers: bool) -> SubscribeRequest {
        let channels: Vec<ChannelId> = filters.iter().map(Filter::channel_id).collect();
        SubscribeRequest {
            client_id: self.config.client_id.clone(),
            sync_state: self.state.snapshot_for(&channels),
            filters,
            reset_consumers,
        }
    }

    async fn run_session(&self, mut stream: FrameStream, router: &FrameRouter) -> SessionEnd {
        let start = tokio::time::Instant::now();
        let ticker = |period: Duration| tokio::time::interval_at(start + period, period);
        let mut completion_tick = ticker(self.config.completion_check_interval);
        let mut ack_tick = ticker(self.config.ack.flush_interval);
        let mut flush_tick = ticker(self.config.state_flush_interval);
        for tick in [&mut completion_tick, &mut ack_tick, &mut flush_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        let mut flush_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                inbound = stream.next() => {
                    let result = match inbound {
                        Some(Ok(Inbound::Text(text))) => self.handle_frame(&text, router).await,
                        Some(Ok(Inbound::Closed(reason))) => Err(SyncError::ConnectionClosed(reason)),
                        Some(Err(e)) => Err(e),
                        None => Err(SyncError::ConnectionClosed(None)),
                    };
                    if let Err(e) = result {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = completion_tick.tick() => {
                    let transitions = self.coordinator.lock().check_completions(Instant::now());
                    self.publish_transitions(transitions);
                }
                _ = ack_tick.tick() => {
                    if let Err(e) = self.flush_acks().await {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = flush_tick.tick() => self.spawn_state_flush(&mut flush_task),
            }
        }
    }

    async fn handle_frame(&self, text: &str, router: &FrameRouter) -> SyncResult<()> {
        match router.route(text) {
            Routed::Event(event) => self.on_event(event).await?,
            Routed::Completion(channel) => {
                let transition = self
                    .coordinator
                    .lock()
                    .complete(&channel, CompletionReason::Signal);
                self.publish_transitions(transition);
            }
            Routed::SubscriptionAck(ack) => {
                let transitions = self
                    .coordinator
                    .lock()
                    .apply_subscription_ack(&ack, Instant::now());
                self.publish_transitions(transitions);
            }
            Routed::Malformed(_) => self.stats.write().malformed_frames += 1,
            Routed::Ignored => {}
        }
        Ok(())
    }

    async fn on_event(&self, event: EventEnvelope) -> SyncResult<()> {
        let (outcome, mode, catching_up) = {
            let mut coordinator = self.coordinator.lock();
            if !coordinator.contains(&event.channel) {
                let baseline = self.state.last_seq(&event.channel);
                coordinator.register(event.channel.clone(), baseline);
            }
            let outcome = coordinator.on_event(&event, Instant::now());
            let mode = match &outcome.completion {
                Some(transition) => transition.from,
                None => coordinator.mode(&event.channel).unwrap_or(SyncMode::Live),
            };
            (outcome, mode, coordinator.is_catching_up())
        };

        if outcome.acceptance.is_new() {
            self.state.observe(&event);
            let flush_now = {
                let mut acks = self.acks.lock();
                if event.require_ack {
                    acks.enqueue(event.id.clone());
                }
                acks.should_flush_now(catching_up)
            };
            self.stats.write().events_accepted += 1;
            self.emit(ClientEvent::Event(DeliveredEvent { event, mode }));
            self.publish_transitions(outcome.completion);
            if flush_now {
                self.flush_acks().await?;
            }
        } else {
            self.stats.write().duplicates_dropped += 1;
            self.publish_transitions(outcome.completion);
        }
        Ok(())
    }

    async fn flush_acks(&self) -> SyncResult<()> {
        loop {
            let batch = self.acks.lock().take_batch();
            let Some(frame) = batch else {
                return Ok(());
            };
            let ids = frame.ids();
            match self.connection.send(&OutboundFrame::Ack(frame)).await {
                Ok(()) => {
                    let mut stats = self.stats.write();
                    stats.ack_frames_sent += 1;
                    stats.acks_sent += ids.len() as u64;
                }
                Err(e) => {
                    tracing::debug!(count = ids.len(), "ack batch kept for retry");
                    self.acks.lock().restore(ids);
                    return Err(e);
                }
            }
        }
    }

    fn spawn_state_flush(&self, running: &mut Option<JoinHandle<()>>) {
        if running.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if !self.state.is_dirty() {
            return;
        }
        let cache = Arc::clone(&self.state);
        *running = Some(tokio::spawn(async move {
            if let Err(e) = cache.flush_async(false).await {
                tracing::warn!(error = %e, "sync state flush failed, will retry");
            }
        }));
    }

    async fn on_transport_failure(&self, error: &SyncError) {
        self.connection.report_failure(error).await;
        self.publish_connection(self.connection.state());
        let transitions = self.coordinator.lock().force_live_all();
        self.publish_transitions(transitions);
        self.stats.write().last_error = Some(error.to_string());
    }

    async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.publish_connection(self.connection.state());
        if let Err(e) = self.state.flush_async(true).await {
            tracing::warn!(error = %e, "final sync state flush failed");
        }
        // Ends the application's event stream.
        self.events.lock().take();
        tracing::info!("sync client stopped");
    }

    fn publish_transitions(&self, transitions: impl IntoIterator<Item = ModeTransition>) {
        for transition in transitions {
            if let TransitionReason::Completed(reason) = transition.reason {
                self.stats.write().record_completion(reason);
            }
            self.emit(ClientEvent::ModeChanged(transition));
        }
    }

    fn publish_connection(&self, state: ConnectionState) {
        {
            let mut published = self.published.lock();
            if *published == state {
                return;
            }
            *published = state;
        }
        self.emit(ClientEvent::Connection(state));
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }
}

/// Application handle to a running client. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<Shared>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Adds channels. They are subscribed right away if connected, and on
    /// every reconnect either way.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> SyncResult<()> {
        let added: Vec<Filter> = {
            let mut current = self.shared.filters.write();
            let mut added = Vec::new();
            for filter in filters {
                if !current.contains(&filter) && !added.contains(&filter) {
                    added.push(filter);
                }
            }
            current.extend(added.iter().cloned());
            added
        };
        if added.is_empty() {
            return Ok(());
        }
        {
            let mut coordinator = self.shared.coordinator.lock();
            for filter in &added {
                let channel = filter.channel_id();
                let baseline = self.shared.state.last_seq(&channel);
                coordinator.register(channel, baseline);
            }
        }
        tracing::info!(count = added.len(), "subscribing");

        if self.shared.connection.is_open() {
            let request = self.shared.subscribe_request(added, false);
            self.shared
                .connection
                .send(&OutboundFrame::Subscribe(request))
                .await?;
        }
        Ok(())
    }

    /// Drops a channel. Its persisted record is kept so a later
    /// subscription resumes where it left off.
    pub async fn unsubscribe(&self, channel: &ChannelId) -> SyncResult<bool> {
        let removed = {
            let mut filters = self.shared.filters.write();
            let before = filters.len();
            filters.retain(|f| f.channel_id() != *channel);
            before != filters.len()
        };
        let known = self.shared.coordinator.lock().unregister(channel);
        if !removed && !known {
            return Ok(false);
        }
        tracing::info!(channel = %channel, "unsubscribing");

        if self.shared.connection.is_open() {
            let request = UnsubscribeRequest {
                client_id: self.shared.config.client_id.clone(),
                channels: vec![channel.clone()],
            };
            self.shared
                .connection
                .send(&OutboundFrame::Unsubscribe(request))
                .await?;
        }
        Ok(true)
    }

    /// Drops every channel, pending ACKs and the persisted state.
    pub async fn logout(&self) -> SyncResult<()> {
        let channels: Vec<ChannelId> = {
            let mut filters = self.shared.filters.write();
            filters.drain(..).map(|f| f.channel_id()).collect()
        };
        self.shared.coordinator.lock().clear();
        self.shared.acks.lock().clear();
        tracing::info!(channels = channels.len(), "logging out");

        if self.shared.connection.is_open() && !channels.is_empty() {
            let request = UnsubscribeRequest {
                client_id: self.shared.config.client_id.clone(),
                channels,
            };
            if let Err(e) = self
                .shared
                .connection
                .send(&OutboundFrame::Unsubscribe(request))
                .await
            {
                tracing::debug!(error = %e, "unsubscribe on logout not delivered");
            }
        }

        let cache = Arc::clone(&self.shared.state);
        tokio::task::spawn_blocking(move || cache.clear())
            .await
            .map_err(|e| StoreError::Unavailable(format!("clear task failed: {e}")))??;
        Ok(())
    }

    /// Writes the sync state now, dirty or not.
    pub async fn flush_state(&self) -> SyncResult<()> {
        self.shared.state.flush_async(true).await?;
        Ok(())
    }

    /// Stops the client: cancels the driver (and any backoff wait), closes
    /// the connection and flushes the sync state.
    pub async fn disconnect(&self) {
        self.shared.cancel.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::warn!(error = %e, "sync driver ended abnormally");
            }
        }
    }

    /// Returns true once the driver has stopped.
    pub fn is_stopped(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .map_or(true, |driver| driver.is_finished())
    }

    /// Mode of a channel.
    pub fn channel_mode(&self, channel: &ChannelId) -> Option<SyncMode> {
        self.shared.coordinator.lock().mode(channel)
    }

    /// Live baseline of a channel.
    pub fn baseline(&self, channel: &ChannelId) -> Option<u64> {
        self.shared.coordinator.lock().baseline(channel)
    }

    /// All channels with their modes.
    pub fn channels(&self) -> Vec<(ChannelId, SyncMode)> {
        self.shared.coordinator.lock().channels()
    }

    /// Current counters.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Observes connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe_state()
    }

    /// Number of ACKs waiting to be sent.
    pub fn pending_acks(&self) -> usize {
        self.shared.acks.lock().pending_count()
    }

    /// In-memory sync state.
    pub fn sync_state(&self) -> SyncStateMap {
        self.shared.state.snapshot()
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("client_id", &self.shared.config.client_id)
            .field("connection", &self.shared.connection.state())
            .finish_non_exhaustive()
    }
}
