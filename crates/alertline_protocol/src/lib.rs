//! # Alertline Protocol
//!
//! Wire types and JSON codec for the Alertline push protocol.
//!
//! This crate provides:
//! - [`Value`], the dynamic payload type carried by events
//! - [`ChannelId`] and [`Filter`] for channel addressing
//! - Outbound frames (subscribe, unsubscribe, ack)
//! - Inbound frames (events, completion signals, subscription acks)
//! - [`SyncStateRecord`], the per-channel resume point
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Example
//!
//! ```rust
//! use alertline_protocol::{decode_inbound, InboundFrame};
//!
//! let frame = decode_inbound(
//!     r#"{"id":"e1","area":"giridih","type":"id","data":{"_seq":156,"_requireAck":true}}"#,
//! )
//! .unwrap();
//!
//! match frame {
//!     InboundFrame::Event(event) => {
//!         assert_eq!(event.channel.as_str(), "giridih_id");
//!         assert_eq!(event.sequence, Some(156));
//!         assert!(event.require_ack);
//!     }
//!     _ => unreachable!(),
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod error;
mod frame;
mod messages;
mod value;

pub use channel::{ChannelId, Filter};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{decode_inbound, decode_outbound, InboundFrame, OutboundFrame};
pub use messages::{
    AckFrame, ChannelBacklog, EventEnvelope, ServerNotice, SubscribeRequest, SubscriptionAck,
    SyncComplete, SyncStateMap, SyncStateRecord, UnsubscribeRequest,
};
pub use value::Value;
