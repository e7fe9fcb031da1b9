//! Per-channel event log.

use alertline_protocol::{ChannelId, EventEnvelope, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

const LIVE_CAPACITY: usize = 4096;

/// Append-only event log, one sequence space per channel.
///
/// Every published event is also broadcast to live subscribers.
pub struct EventLog {
    channels: RwLock<HashMap<ChannelId, Vec<EventEnvelope>>>,
    live: broadcast::Sender<EventEnvelope>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            channels: RwLock::new(HashMap::new()),
            live,
        }
    }

    /// Appends an event, assigning the next sequence of its channel and a
    /// fresh id.
    pub fn publish(
        &self,
        area: &str,
        event_type: &str,
        data: Value,
        require_ack: bool,
    ) -> EventEnvelope {
        let event = {
            let mut channels = self.channels.write();
            let log = channels
                .entry(ChannelId::from_parts(area, event_type))
                .or_default();
            let event = EventEnvelope::new(uuid::Uuid::new_v4().to_string(), area, event_type)
                .with_sequence(log.len() as u64 + 1)
                .with_require_ack(require_ack)
                .with_timestamp(now_millis().to_string())
                .with_data(data);
            log.push(event.clone());
            event
        };
        tracing::trace!(channel = %event.channel, seq = ?event.sequence, "published");
        let _ = self.live.send(event.clone());
        event
    }

    /// Events of a channel with a sequence above `after` (all of them for `None`).
    pub fn backlog(&self, channel: &ChannelId, after: Option<u64>) -> Vec<EventEnvelope> {
        let channels = self.channels.read();
        let Some(log) = channels.get(channel) else {
            return Vec::new();
        };
        let skip = after.map_or(0, |seq| usize::try_from(seq).unwrap_or(usize::MAX));
        log.iter().skip(skip).cloned().collect()
    }

    /// Highest sequence of a channel.
    pub fn last_seq(&self, channel: &ChannelId) -> Option<u64> {
        self.channels
            .read()
            .get(channel)
            .and_then(|log| log.last())
            .and_then(|event| event.sequence)
    }

    /// Total number of events.
    pub fn len(&self) -> usize {
        self.channels.read().values().map(Vec::len).sum()
    }

    /// Returns true if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channels with at least one event, sorted.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.channels.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Receives every event published from now on.
    pub fn subscribe_live(&self) -> broadcast::Receiver<EventEnvelope> {
        self.live.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
