//! # Alertline Sync Engine
//!
//! Catch-up/live synchronization for the Alertline push client.
//!
//! This crate provides:
//! - Connection lifecycle with reconnect backoff
//! - Per-channel sequence tracking in two modes (catch-up and live)
//! - Catch-up completion by server signal, inactivity, hard timeout or
//!   transport failure
//! - Batched event acknowledgment with retry after reconnect
//! - Durable per-channel resume points
//!
//! ## Architecture
//!
//! ```text
//! ConnectionManager -> FrameRouter -> ChannelSyncCoordinator -> AckDispatcher
//!                                        |          |
//!                                 SequenceTracker  CompletionDetector
//!                                        |
//!                                  SyncStateCache -> StateStore
//! ```
//!
//! One driver task owns the receive loop; the coordinator sits behind a
//! single mutex shared with the periodic completion check.
//!
//! ## Key Invariants
//!
//! - In catch-up a sequence is accepted iff it is not in the seen-set
//! - In live mode a sequence is accepted iff it exceeds the baseline
//! - Leaving catch-up never lowers the baseline
//! - The first completion wins; later ones are no-ops
//! - No failure stops the process: transport errors reconnect, bad frames are dropped
//!
//! ## Example
//!
//! ```no_run
//! use alertline_protocol::Filter;
//! use alertline_sync_engine::{ClientEvent, MemoryStateStore, SyncClient, SyncConfig, WsConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> alertline_sync_engine::SyncResult<()> {
//! let config = SyncConfig::new("desk-7", "ws://localhost:9400/events")
//!     .with_filter(Filter::new("giridih", "id"));
//! let connector = Arc::new(WsConnector::new(config.server_url.clone()));
//! let (handle, mut events) = SyncClient::start(config, connector, Arc::new(MemoryStateStore::new()))?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Event(delivered) = event {
//!         println!("{} #{:?}", delivered.event.channel, delivered.event.sequence);
//!     }
//! }
//! handle.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod client;
mod config;
mod connection;
mod coordinator;
mod detector;
mod error;
mod router;
mod store;
mod tracker;
mod transport;
mod ws;

pub use ack::AckDispatcher;
pub use client::{ClientEvent, DeliveredEvent, SyncClient, SyncHandle, SyncStats};
pub use config::{AckConfig, Backoff, BackoffConfig, SyncConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use coordinator::{
    ChannelSyncCoordinator, EventOutcome, ModeTransition, TransitionReason, RECENT_ID_CAPACITY,
};
pub use detector::{CatchUpClock, CompletionDetector, CompletionReason};
pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use router::{FrameRouter, Routed};
pub use store::{FileStateStore, MemoryStateStore, StateStore, SyncStateCache};
pub use tracker::{Acceptance, SequenceTracker, SyncMode};
pub use transport::{Connector, FrameSink, FrameStream, Inbound, Link, MemoryConnector, MemoryPeer};
pub use ws::WsConnector;
