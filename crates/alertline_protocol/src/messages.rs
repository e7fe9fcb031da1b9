//! Protocol messages.

use crate::channel::{ChannelId, Filter};
use crate::error::{ProtocolError, ProtocolResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload key carrying the per-channel sequence.
pub(crate) const SEQ_KEY: &str = "_seq";
/// Payload key carrying the acknowledgment flag.
pub(crate) const REQUIRE_ACK_KEY: &str = "_requireAck";
/// Payload key carrying an embedded catch-up completion flag.
pub(crate) const CATCH_UP_COMPLETE_KEY: &str = "isCatchUpComplete";

/// Durable resume point for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateRecord {
    /// Id of the last accepted event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    /// Timestamp of the last accepted event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    /// Highest accepted sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

impl SyncStateRecord {
    /// Folds an accepted event into the record.
    ///
    /// Event id and timestamp follow the latest event; the sequence only
    /// moves forward.
    pub fn observe(&mut self, event: &EventEnvelope) {
        self.last_event_id = Some(event.id.clone());
        if event.timestamp.is_some() {
            self.last_timestamp = event.timestamp.clone();
        }
        if let Some(seq) = event.sequence {
            self.last_seq = Some(self.last_seq.map_or(seq, |last| last.max(seq)));
        }
    }
}

/// Resume points keyed by channel.
pub type SyncStateMap = BTreeMap<ChannelId, SyncStateRecord>;

/// Subscription request sent on every connection open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Client identity.
    pub client_id: String,
    /// Channels to subscribe to.
    pub filters: Vec<Filter>,
    /// Where each channel should resume.
    #[serde(default)]
    pub sync_state: SyncStateMap,
    /// Asks the server to discard consumer positions and replay from scratch.
    #[serde(default)]
    pub reset_consumers: bool,
}

/// Request to stop delivery for some channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    /// Client identity.
    pub client_id: String,
    /// Channels to drop.
    pub channels: Vec<ChannelId>,
}

/// Acknowledgment for one or more events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    /// Single acknowledged event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Batch of acknowledged events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ids: Option<Vec<String>>,
    /// Client identity.
    pub client_id: String,
}

impl AckFrame {
    /// Builds an ack for the given ids, using the single-id form for one id.
    pub fn for_ids(client_id: impl Into<String>, mut ids: Vec<String>) -> Self {
        let client_id = client_id.into();
        if ids.len() == 1 {
            Self {
                event_id: ids.pop(),
                event_ids: None,
                client_id,
            }
        } else {
            Self {
                event_id: None,
                event_ids: Some(ids),
                client_id,
            }
        }
    }

    /// Returns every id this frame acknowledges.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.event_id.iter().cloned().collect();
        if let Some(batch) = &self.event_ids {
            ids.extend(batch.iter().cloned());
        }
        ids
    }
}

/// A data event pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Idempotency key, independent of the sequence.
    pub id: String,
    /// Area the event belongs to.
    pub area: String,
    /// Event type.
    pub event_type: String,
    /// Channel derived from area and type.
    pub channel: ChannelId,
    /// Server timestamp, normalized to text.
    pub timestamp: Option<String>,
    /// Per-channel sequence (`data._seq`).
    pub sequence: Option<u64>,
    /// Whether the server expects an ack (`data._requireAck`).
    pub require_ack: bool,
    /// Embedded completion flag (`data.isCatchUpComplete`).
    pub catch_up_complete: bool,
    /// Payload object as received.
    pub data: Value,
}

impl EventEnvelope {
    /// Creates an event with an empty payload.
    pub fn new(id: impl Into<String>, area: impl Into<String>, event_type: impl Into<String>) -> Self {
        let area = area.into();
        let event_type = event_type.into();
        Self {
            id: id.into(),
            channel: ChannelId::from_parts(&area, &event_type),
            area,
            event_type,
            timestamp: None,
            sequence: None,
            require_ack: false,
            catch_up_complete: false,
            data: Value::object(),
        }
    }

    /// Sets the sequence.
    pub fn with_sequence(mut self, seq: u64) -> Self {
        self.sequence = Some(seq);
        self
    }

    /// Marks the event as requiring acknowledgment.
    pub fn with_require_ack(mut self, require_ack: bool) -> Self {
        self.require_ack = require_ack;
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Sets the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Sets the embedded completion flag.
    pub fn with_catch_up_complete(mut self, complete: bool) -> Self {
        self.catch_up_complete = complete;
        self
    }

    /// Decodes an event from a parsed JSON object.
    pub fn from_json(raw: serde_json::Value) -> ProtocolResult<Self> {
        let Value::Object(mut map) = Value::from(raw) else {
            return Err(ProtocolError::invalid_structure("event must be an object"));
        };

        let id = match map.remove("id") {
            Some(Value::Text(s)) if !s.is_empty() => s,
            Some(Value::Integer(n)) => n.to_string(),
            Some(other) => {
                return Err(ProtocolError::invalid_field(
                    "id",
                    format!("expected non-empty text, got {}", other.type_name()),
                ))
            }
            None => return Err(ProtocolError::MissingField("id")),
        };
        let area = take_text(&mut map, "area")?;
        let event_type = take_text(&mut map, "type")?;

        let timestamp = match map.remove("timestamp") {
            None | Some(Value::Null) => None,
            Some(Value::Text(s)) => Some(s),
            Some(Value::Integer(n)) => Some(n.to_string()),
            Some(Value::Float(f)) => Some(f.to_string()),
            Some(other) => {
                return Err(ProtocolError::invalid_field(
                    "timestamp",
                    format!("expected text or number, got {}", other.type_name()),
                ))
            }
        };

        let data = match map.remove("data") {
            None | Some(Value::Null) => Value::object(),
            Some(obj @ Value::Object(_)) => obj,
            Some(other) => {
                return Err(ProtocolError::invalid_field(
                    "data",
                    format!("expected object, got {}", other.type_name()),
                ))
            }
        };

        let sequence = match data.get(SEQ_KEY) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                ProtocolError::invalid_field(SEQ_KEY, "expected unsigned integer")
            })?),
        };
        let require_ack = data
            .get(REQUIRE_ACK_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let catch_up_complete = data
            .get(CATCH_UP_COMPLETE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            id,
            channel: ChannelId::from_parts(&area, &event_type),
            area,
            event_type,
            timestamp,
            sequence,
            require_ack,
            catch_up_complete,
            data,
        })
    }

    /// Encodes the event into its wire object.
    ///
    /// The sequence and flags are written into `data`, overriding any
    /// stale values already present there.
    pub fn to_json(&self) -> serde_json::Value {
        let mut data = match &self.data {
            Value::Object(_) => self.data.clone(),
            _ => Value::object(),
        };
        match self.sequence {
            Some(seq) => {
                data.insert(SEQ_KEY, seq);
            }
            None => {
                if let Some(map) = data.as_object_mut() {
                    map.remove(SEQ_KEY);
                }
            }
        }
        data.insert(REQUIRE_ACK_KEY, self.require_ack);
        if self.catch_up_complete {
            data.insert(CATCH_UP_COMPLETE_KEY, true);
        }

        let mut obj = serde_json::Map::new();
        obj.insert("id".into(), self.id.clone().into());
        obj.insert("area".into(), self.area.clone().into());
        obj.insert("type".into(), self.event_type.clone().into());
        if let Some(ts) = &self.timestamp {
            obj.insert("timestamp".into(), ts.clone().into());
        }
        obj.insert("data".into(), data.into());
        serde_json::Value::Object(obj)
    }
}

fn take_text(map: &mut BTreeMap<String, Value>, field: &'static str) -> ProtocolResult<String> {
    match map.remove(field) {
        Some(Value::Text(s)) if !s.is_empty() => Ok(s),
        Some(other) => Err(ProtocolError::invalid_field(
            field,
            format!("expected non-empty text, got {}", other.type_name()),
        )),
        None => Err(ProtocolError::MissingField(field)),
    }
}

/// Explicit server signal that a channel's backlog is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncComplete {
    /// Channel whose catch-up finished.
    pub channel_id: ChannelId,
    /// An explicit `false` withdraws the signal; absent means complete.
    #[serde(default = "signal_default")]
    pub catch_up_complete: bool,
    /// Server timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

fn signal_default() -> bool {
    true
}

impl SyncComplete {
    /// Creates a completion signal for a channel.
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            catch_up_complete: true,
            timestamp: None,
        }
    }
}

/// Backlog reported for one channel in a subscription ack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBacklog {
    /// Number of events waiting to be replayed.
    #[serde(default)]
    pub pending_count: u64,
}

/// Server reply to a subscription request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAck {
    /// Backlog per subscribed channel.
    #[serde(default)]
    pub channels: BTreeMap<ChannelId, ChannelBacklog>,
}

impl SubscriptionAck {
    /// Adds a channel entry.
    pub fn with_channel(mut self, channel: ChannelId, pending_count: u64) -> Self {
        self.channels.insert(channel, ChannelBacklog { pending_count });
        self
    }
}

/// Error notice from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNotice {
    /// Human-readable reason.
    #[serde(default)]
    pub message: String,
}
