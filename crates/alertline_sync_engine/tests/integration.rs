//! Integration tests for the sync client against in-process and websocket servers.

use alertline_protocol::{
    ChannelId, EventEnvelope, Filter, InboundFrame, OutboundFrame, SubscribeRequest,
    SubscriptionAck, SyncComplete, SyncStateMap, SyncStateRecord, Value,
};
use alertline_push_server::{PushServer, ServerConfig};
use alertline_sync_engine::{
    AckConfig, BackoffConfig, ClientEvent, CompletionReason, DeliveredEvent, FileStateStore,
    MemoryConnector, MemoryPeer, MemoryStateStore, ModeTransition, StateStore, SyncClient,
    SyncConfig, SyncHandle, SyncMode, TransitionReason, WsConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn giridih() -> ChannelId {
    ChannelId::from("giridih_id")
}

fn fast_config() -> SyncConfig {
    SyncConfig::new("desk-1", "memory://alerts")
        .with_filter(Filter::new("giridih", "id"))
        .with_inactivity_timeout(Duration::from_millis(300))
        .with_catch_up_timeout(Duration::from_secs(5))
        .with_completion_check_interval(Duration::from_millis(50))
        .with_state_flush_interval(Duration::from_millis(50))
        .with_ack(AckConfig::default().with_flush_interval(Duration::from_millis(50)))
        .with_backoff(
            BackoffConfig::new(Duration::from_millis(20), Duration::from_millis(100))
                .with_jitter(false),
        )
}

fn event(seq: u64) -> InboundFrame {
    InboundFrame::Event(
        EventEnvelope::new(format!("evt-{seq}"), "giridih", "id")
            .with_sequence(seq)
            .with_require_ack(true),
    )
}

fn backlog(pending: u64) -> InboundFrame {
    InboundFrame::SubscriptionAck(SubscriptionAck::default().with_channel(giridih(), pending))
}

fn store_with_last_seq(seq: u64) -> MemoryStateStore {
    let mut state = SyncStateMap::new();
    state.insert(
        giridih(),
        SyncStateRecord {
            last_seq: Some(seq),
            ..SyncStateRecord::default()
        },
    );
    MemoryStateStore::with_state(state)
}

async fn recv(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("client event channel closed")
}

async fn next_delivered(events: &mut UnboundedReceiver<ClientEvent>) -> DeliveredEvent {
    loop {
        if let ClientEvent::Event(delivered) = recv(events).await {
            return delivered;
        }
    }
}

async fn next_transition(events: &mut UnboundedReceiver<ClientEvent>) -> ModeTransition {
    loop {
        if let ClientEvent::ModeChanged(transition) = recv(events).await {
            return transition;
        }
    }
}

/// Collects delivered sequences until the channel goes live.
async fn deliveries_until_live(
    events: &mut UnboundedReceiver<ClientEvent>,
) -> (Vec<u64>, ModeTransition) {
    let mut sequences = Vec::new();
    loop {
        match recv(events).await {
            ClientEvent::Event(delivered) => {
                assert_eq!(delivered.mode, SyncMode::CatchUp);
                sequences.extend(delivered.event.sequence);
            }
            ClientEvent::ModeChanged(transition) if transition.to == SyncMode::Live => {
                return (sequences, transition);
            }
            _ => {}
        }
    }
}

async fn accept(connector: &MemoryConnector) -> MemoryPeer {
    timeout(WAIT, connector.accept())
        .await
        .expect("client never connected")
        .expect("connector closed")
}

async fn expect_subscribe(peer: &mut MemoryPeer) -> SubscribeRequest {
    match timeout(WAIT, peer.recv_frame()).await.expect("no frame") {
        Some(OutboundFrame::Subscribe(request)) => request,
        other => panic!("expected subscribe, got {other:?}"),
    }
}

async fn start(
    config: SyncConfig,
    store: Arc<dyn StateStore>,
) -> (
    SyncHandle,
    UnboundedReceiver<ClientEvent>,
    Arc<MemoryConnector>,
    MemoryPeer,
) {
    let connector = Arc::new(MemoryConnector::new());
    let (handle, events) = SyncClient::start(config, connector.clone(), store).unwrap();
    let peer = accept(&connector).await;
    (handle, events, connector, peer)
}

#[tokio::test]
async fn catch_up_ends_on_inactivity_then_live_filters_old_sequences() {
    let store = Arc::new(store_with_last_seq(150));
    let (handle, mut events, _connector, mut peer) = start(fast_config(), store).await;

    let request = expect_subscribe(&mut peer).await;
    assert_eq!(request.client_id, "desk-1");
    assert_eq!(request.sync_state[&giridih()].last_seq, Some(150));
    assert!(!request.reset_consumers);

    peer.send_frame(&backlog(50));
    let entered = next_transition(&mut events).await;
    assert_eq!(entered.to, SyncMode::CatchUp);
    assert_eq!(entered.reason, TransitionReason::Backlog { pending: 50 });

    // Backlog arrives out of order with one duplicate.
    for seq in (151..=200).rev() {
        peer.send_frame(&event(seq));
    }
    peer.send_frame(&event(160));

    let (mut sequences, live) = deliveries_until_live(&mut events).await;
    sequences.sort_unstable();
    assert_eq!(sequences, (151..=200).collect::<Vec<_>>());
    assert_eq!(
        live.reason,
        TransitionReason::Completed(CompletionReason::Inactivity)
    );
    assert_eq!(live.baseline, Some(200));
    assert_eq!(handle.baseline(&giridih()), Some(200));

    peer.send_frame(&event(201));
    peer.send_frame(&event(155));
    peer.send_frame(&event(202));
    let first = next_delivered(&mut events).await;
    assert_eq!(first.event.sequence, Some(201));
    assert_eq!(first.mode, SyncMode::Live);
    let second = next_delivered(&mut events).await;
    assert_eq!(second.event.sequence, Some(202));

    let stats = handle.stats();
    assert_eq!(stats.events_accepted, 52);
    assert_eq!(stats.duplicates_dropped, 2);
    assert_eq!(stats.completed_by_inactivity, 1);

    handle.disconnect().await;
}

#[tokio::test]
async fn sync_complete_signal_ends_catch_up() {
    let config = fast_config().with_inactivity_timeout(Duration::from_secs(10));
    let (handle, mut events, _connector, mut peer) =
        start(config, Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    peer.send_frame(&backlog(3));
    for seq in [3, 1, 2] {
        peer.send_frame(&event(seq));
    }
    peer.send_frame(&InboundFrame::SyncComplete(SyncComplete::new(giridih())));

    let (sequences, live) = deliveries_until_live(&mut events).await;
    assert_eq!(sequences, vec![3, 1, 2]);
    assert_eq!(live.reason, TransitionReason::Completed(CompletionReason::Signal));
    assert_eq!(live.baseline, Some(3));
    assert_eq!(handle.channel_mode(&giridih()), Some(SyncMode::Live));

    // A second signal for a live channel changes nothing.
    peer.send_frame(&InboundFrame::SyncComplete(SyncComplete::new(giridih())));
    peer.send_frame(&event(4));
    assert_eq!(next_delivered(&mut events).await.event.sequence, Some(4));
    assert_eq!(handle.stats().completed_by_signal, 1);

    handle.disconnect().await;
}

#[tokio::test]
async fn bare_sync_complete_frame_ends_catch_up() {
    let config = fast_config().with_inactivity_timeout(Duration::from_secs(10));
    let (handle, mut events, _connector, mut peer) =
        start(config, Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    peer.send_frame(&backlog(2));
    peer.send_frame(&event(2));
    peer.send_frame(&event(1));
    peer.send_text(r#"{"type":"sync_complete","channelId":"giridih_id"}"#);

    let (sequences, live) = deliveries_until_live(&mut events).await;
    assert_eq!(sequences, vec![2, 1]);
    assert_eq!(live.reason, TransitionReason::Completed(CompletionReason::Signal));
    assert_eq!(handle.stats().completed_by_signal, 1);

    handle.disconnect().await;
}

#[tokio::test]
async fn embedded_flag_ends_catch_up_after_delivery() {
    let config = fast_config().with_inactivity_timeout(Duration::from_secs(10));
    let (handle, mut events, _connector, mut peer) =
        start(config, Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    peer.send_frame(&backlog(2));
    peer.send_frame(&event(1));
    peer.send_frame(&InboundFrame::Event(
        EventEnvelope::new("evt-2", "giridih", "id")
            .with_sequence(2)
            .with_catch_up_complete(true),
    ));

    let (sequences, live) = deliveries_until_live(&mut events).await;
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(live.reason, TransitionReason::Completed(CompletionReason::Signal));
    assert_eq!(live.baseline, Some(2));

    handle.disconnect().await;
}

#[tokio::test]
async fn transport_failure_forces_live_and_resubscribes() {
    let config = fast_config()
        .with_inactivity_timeout(Duration::from_secs(10))
        .with_reset_consumers(true);
    let (handle, mut events, connector, mut peer) =
        start(config, Arc::new(MemoryStateStore::new())).await;
    let first = expect_subscribe(&mut peer).await;
    assert!(first.reset_consumers);

    peer.send_frame(&backlog(10));
    for seq in [2, 4, 1, 3] {
        peer.send_frame(&event(seq));
    }
    for _ in 0..4 {
        next_delivered(&mut events).await;
    }
    peer.fail("connection reset by peer");

    let (_, forced) = deliveries_until_live(&mut events).await;
    assert_eq!(
        forced.reason,
        TransitionReason::Completed(CompletionReason::TransportFailure)
    );
    assert_eq!(forced.baseline, Some(4));

    let mut second_peer = accept(&connector).await;
    let second = expect_subscribe(&mut second_peer).await;
    assert!(!second.reset_consumers);
    assert_eq!(second.sync_state[&giridih()].last_seq, Some(4));

    second_peer.send_frame(&event(3));
    second_peer.send_frame(&event(5));
    let next = next_delivered(&mut events).await;
    assert_eq!(next.event.sequence, Some(5));
    assert_eq!(next.mode, SyncMode::Live);

    let stats = handle.stats();
    assert_eq!(stats.completed_by_transport_failure, 1);
    assert!(stats.reconnect_attempts >= 1);
    assert_eq!(stats.connects, 2);
    assert!(stats.last_error.is_some());

    handle.disconnect().await;
}

#[tokio::test]
async fn pending_acks_are_resent_after_reconnect() {
    let ack = AckConfig::default()
        .with_batch_size(100)
        .with_immediate_threshold(0)
        .with_flush_interval(Duration::from_secs(30));
    let config = fast_config().with_ack(ack);
    let (handle, mut events, connector, mut peer) =
        start(config, Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    for seq in 1..=3 {
        peer.send_frame(&event(seq));
    }
    for _ in 0..3 {
        next_delivered(&mut events).await;
    }
    assert_eq!(handle.pending_acks(), 3);
    peer.fail("gone");

    let mut second_peer = accept(&connector).await;
    expect_subscribe(&mut second_peer).await;
    let frame = timeout(WAIT, second_peer.recv_frame()).await.unwrap();
    let Some(OutboundFrame::Ack(ack)) = frame else {
        panic!("expected ack frame, got {frame:?}");
    };
    let mut ids = ack.ids();
    ids.sort();
    assert_eq!(ids, vec!["evt-1", "evt-2", "evt-3"]);
    assert_eq!(ack.client_id, "desk-1");
    assert_eq!(handle.pending_acks(), 0);

    handle.disconnect().await;
}

#[tokio::test]
async fn live_acks_flush_immediately_when_few_are_pending() {
    let (handle, mut events, _connector, mut peer) =
        start(fast_config(), Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    peer.send_frame(&event(1));
    next_delivered(&mut events).await;

    let frame = timeout(WAIT, peer.recv_frame()).await.unwrap();
    let Some(OutboundFrame::Ack(ack)) = frame else {
        panic!("expected ack frame, got {frame:?}");
    };
    assert_eq!(ack.event_id.as_deref(), Some("evt-1"));
    assert!(ack.event_ids.is_none());

    handle.disconnect().await;
}

#[tokio::test]
async fn sync_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("sync.json");

    {
        let store = Arc::new(FileStateStore::open(&path).unwrap());
        let (handle, mut events, _connector, mut peer) = start(fast_config(), store).await;
        expect_subscribe(&mut peer).await;
        for seq in [198, 199, 200] {
            peer.send_frame(&event(seq));
        }
        for _ in 0..3 {
            next_delivered(&mut events).await;
        }
        handle.disconnect().await;
    }

    let persisted = FileStateStore::open(&path).unwrap().load().unwrap();
    assert_eq!(persisted[&giridih()].last_seq, Some(200));
    assert_eq!(persisted[&giridih()].last_event_id.as_deref(), Some("evt-200"));

    let store = Arc::new(FileStateStore::open(&path).unwrap());
    let (handle, mut events, _connector, mut peer) = start(fast_config(), store).await;
    let request = expect_subscribe(&mut peer).await;
    assert_eq!(request.sync_state[&giridih()].last_seq, Some(200));
    assert_eq!(handle.baseline(&giridih()), Some(200));

    peer.send_frame(&event(200));
    peer.send_frame(&event(201));
    assert_eq!(next_delivered(&mut events).await.event.sequence, Some(201));
    assert_eq!(handle.stats().duplicates_dropped, 1);

    handle.disconnect().await;
}

#[tokio::test]
async fn unsequenced_events_are_deduplicated_by_id() {
    let (handle, mut events, _connector, mut peer) =
        start(fast_config(), Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    let plain = InboundFrame::Event(EventEnvelope::new("no-seq", "giridih", "id"));
    peer.send_frame(&plain);
    peer.send_frame(&plain);
    peer.send_frame(&event(1));

    assert_eq!(next_delivered(&mut events).await.event.id, "no-seq");
    assert_eq!(next_delivered(&mut events).await.event.id, "evt-1");
    assert_eq!(handle.stats().duplicates_dropped, 1);

    handle.disconnect().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let (handle, mut events, _connector, mut peer) =
        start(fast_config(), Arc::new(MemoryStateStore::new())).await;
    expect_subscribe(&mut peer).await;

    peer.send_text("definitely not json");
    peer.send_text("[1, 2, 3]");
    peer.send_frame(&event(1));

    assert_eq!(next_delivered(&mut events).await.event.sequence, Some(1));
    let stats = handle.stats();
    assert_eq!(stats.malformed_frames, 2);
    assert_eq!(stats.connects, 1);

    handle.disconnect().await;
}

#[tokio::test]
async fn subscribe_and_unsubscribe_at_runtime() {
    let (handle, _events, _connector, mut peer) =
        start(fast_config(), Arc::new(store_with_last_seq(9))).await;
    expect_subscribe(&mut peer).await;

    handle
        .subscribe(vec![Filter::new("north", "motion"), Filter::new("giridih", "id")])
        .await
        .unwrap();
    let added = expect_subscribe(&mut peer).await;
    assert_eq!(added.filters, vec![Filter::new("north", "motion")]);
    assert!(added.sync_state.is_empty());
    assert_eq!(
        handle.channels(),
        vec![
            (giridih(), SyncMode::Live),
            (ChannelId::from("north_motion"), SyncMode::Live)
        ]
    );

    assert!(handle.unsubscribe(&giridih()).await.unwrap());
    let frame = timeout(WAIT, peer.recv_frame()).await.unwrap();
    let Some(OutboundFrame::Unsubscribe(request)) = frame else {
        panic!("expected unsubscribe, got {frame:?}");
    };
    assert_eq!(request.channels, vec![giridih()]);
    assert!(!handle.unsubscribe(&giridih()).await.unwrap());

    // The resume point outlives the subscription.
    assert_eq!(handle.sync_state()[&giridih()].last_seq, Some(9));

    handle.disconnect().await;
}

#[tokio::test]
async fn logout_forgets_everything() {
    let store = Arc::new(store_with_last_seq(9));
    let (handle, mut events, _connector, mut peer) = start(fast_config(), store.clone()).await;
    expect_subscribe(&mut peer).await;

    peer.send_frame(&event(10));
    next_delivered(&mut events).await;

    handle.logout().await.unwrap();
    assert!(handle.channels().is_empty());
    assert!(handle.sync_state().is_empty());
    assert_eq!(handle.pending_acks(), 0);
    assert!(store.snapshot().is_empty());

    loop {
        let frame = timeout(WAIT, peer.recv_frame()).await.unwrap();
        if let Some(OutboundFrame::Unsubscribe(request)) = frame {
            assert_eq!(request.channels, vec![giridih()]);
            break;
        }
    }

    handle.disconnect().await;
}

#[tokio::test]
async fn disconnect_cancels_backoff_wait() {
    let config = fast_config().with_backoff(
        BackoffConfig::new(Duration::from_secs(60), Duration::from_secs(60)).with_jitter(false),
    );
    let connector = Arc::new(MemoryConnector::new());
    connector.fail_next(10);
    let (handle, _events) =
        SyncClient::start(config, connector.clone(), Arc::new(MemoryStateStore::new())).unwrap();

    for _ in 0..100 {
        if handle.stats().reconnect_attempts > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.stats().reconnect_attempts, 1);

    timeout(Duration::from_secs(1), handle.disconnect())
        .await
        .expect("disconnect waited out the backoff");
    assert!(handle.is_stopped());
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let config = fast_config().with_backoff(
        BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(10))
            .with_jitter(false)
            .with_max_attempts(2),
    );
    let connector = Arc::new(MemoryConnector::new());
    connector.fail_next(100);
    let (handle, mut events) =
        SyncClient::start(config, connector.clone(), Arc::new(MemoryStateStore::new())).unwrap();

    // The event stream ends once the client gives up.
    timeout(WAIT, async { while events.recv().await.is_some() {} })
        .await
        .expect("event stream stayed open after the client gave up");
    handle.disconnect().await;
    assert!(handle.is_stopped());
    assert_eq!(connector.connect_count(), 3);
    let stats = handle.stats();
    assert_eq!(stats.reconnect_attempts, 2);
    assert!(stats
        .last_error
        .is_some_and(|e| e.contains("gave up after 2")));
}

#[tokio::test]
async fn push_server_duplicates_are_dropped_over_websocket() {
    let server_config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_burst_size(4)
        .with_burst_pause(Duration::ZERO)
        .with_shuffle(11)
        .with_duplicate_ratio(0.5);
    let (server, addr) = PushServer::bind(server_config).await.unwrap();
    for _ in 0..10 {
        server.publish("giridih", "id", Value::object(), true);
    }

    let config = fast_config().with_inactivity_timeout(Duration::from_secs(5));
    let connector = Arc::new(WsConnector::new(format!("ws://{addr}")));
    let (handle, mut events) =
        SyncClient::start(config, connector, Arc::new(MemoryStateStore::new())).unwrap();

    let entered = next_transition(&mut events).await;
    assert_eq!(entered.reason, TransitionReason::Backlog { pending: 10 });

    let (mut sequences, live) = deliveries_until_live(&mut events).await;
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
    assert_eq!(live.reason, TransitionReason::Completed(CompletionReason::Signal));
    assert_eq!(live.baseline, Some(10));
    assert_eq!(handle.stats().duplicates_dropped, 5);

    let mut acked = Vec::new();
    for _ in 0..100 {
        acked = server.acked_ids("desk-1");
        if acked.len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(acked.len(), 10);

    let published = server.publish("giridih", "id", Value::object(), false);
    let delivered = next_delivered(&mut events).await;
    assert_eq!(delivered.event.id, published.id);
    assert_eq!(delivered.event.sequence, Some(11));
    assert_eq!(delivered.mode, SyncMode::Live);

    handle.disconnect().await;
    server.shutdown().await;
}
