//! # Alertline Push Server
//!
//! Reference websocket push server for Alertline clients.
//!
//! This crate provides:
//! - A per-channel event log with server-assigned sequences
//! - Subscription handling with resume from each channel's `lastSeq`
//! - Backlog replay in shuffled bursts, with optional duplicates
//! - Explicit `sync_complete` signals
//! - Live fan-out of newly published events
//! - ACK recording per client
//!
//! It exists to exercise clients the way a production server behaves
//! under load: backlog arrives out of order and sometimes twice.
//!
//! ```no_run
//! use alertline_protocol::Value;
//! use alertline_push_server::{PushServer, ServerConfig};
//!
//! # async fn run() -> alertline_push_server::ServerResult<()> {
//! let (server, addr) = PushServer::bind(ServerConfig::default()).await?;
//! server.publish("giridih", "id", Value::object(), true);
//! println!("listening on ws://{addr}");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod log;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use log::EventLog;
pub use server::PushServer;
