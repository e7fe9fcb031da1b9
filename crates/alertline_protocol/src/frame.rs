//! Frame classification and encoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{
    AckFrame, EventEnvelope, ServerNotice, SubscribeRequest, SubscriptionAck, SyncComplete,
    UnsubscribeRequest,
};
use serde::{Deserialize, Serialize};

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Subscription request.
    Subscribe(SubscribeRequest),
    /// Unsubscription request.
    Unsubscribe(UnsubscribeRequest),
    /// Event acknowledgment.
    Ack(AckFrame),
}

impl OutboundFrame {
    /// Encodes the frame as JSON text.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Subscribe(_) => "subscribe",
            OutboundFrame::Unsubscribe(_) => "unsubscribe",
            OutboundFrame::Ack(_) => "ack",
        }
    }
}

/// Decodes a client frame (used by servers).
pub fn decode_outbound(text: &str) -> ProtocolResult<OutboundFrame> {
    Ok(serde_json::from_str(text)?)
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A data event.
    Event(EventEnvelope),
    /// Explicit catch-up completion for one channel.
    SyncComplete(SyncComplete),
    /// Reply to a subscription request.
    SubscriptionAck(SubscriptionAck),
    /// Error notice.
    Error(ServerNotice),
    /// A control frame this client does not understand.
    Unknown(String),
}

const SYNC_COMPLETE: &str = "sync_complete";
const SUBSCRIPTION_ACK: &str = "subscription_ack";
const ERROR: &str = "error";

impl InboundFrame {
    /// Encodes the frame as JSON text (used by servers).
    pub fn encode(&self) -> ProtocolResult<String> {
        let value = match self {
            InboundFrame::Event(event) => event.to_json(),
            InboundFrame::SyncComplete(signal) => tagged(SYNC_COMPLETE, signal)?,
            InboundFrame::SubscriptionAck(ack) => tagged(SUBSCRIPTION_ACK, ack)?,
            InboundFrame::Error(notice) => tagged(ERROR, notice)?,
            InboundFrame::Unknown(kind) => serde_json::json!({ "type": kind }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

fn tagged<T: Serialize>(kind: &str, body: &T) -> ProtocolResult<serde_json::Value> {
    let mut value = serde_json::to_value(body)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| ProtocolError::invalid_structure("control frame must be an object"))?;
    obj.insert("type".into(), kind.into());
    Ok(value)
}

/// Decodes and classifies a server frame.
///
/// Control frames are recognized by their `type`. Anything else carrying
/// an `id` is decoded as a data event, whose `type` is the event type.
pub fn decode_inbound(text: &str) -> ProtocolResult<InboundFrame> {
    let raw: serde_json::Value = serde_json::from_str(text)?;
    let obj = raw
        .as_object()
        .ok_or_else(|| ProtocolError::invalid_structure("frame must be a JSON object"))?;

    let kind = obj.get("type").and_then(|v| v.as_str()).map(str::to_owned);
    let has_id = obj.contains_key("id");

    match kind.as_deref() {
        Some(SYNC_COMPLETE) => Ok(InboundFrame::SyncComplete(serde_json::from_value(raw)?)),
        Some(SUBSCRIPTION_ACK) => Ok(InboundFrame::SubscriptionAck(serde_json::from_value(raw)?)),
        Some(ERROR) if !has_id => Ok(InboundFrame::Error(serde_json::from_value(raw)?)),
        _ if has_id => EventEnvelope::from_json(raw).map(InboundFrame::Event),
        Some(other) => Ok(InboundFrame::Unknown(other.to_owned())),
        None => Err(ProtocolError::MissingField("type")),
    }
}
