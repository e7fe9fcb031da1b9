//! CLI command implementations.

pub mod serve;
pub mod state;
pub mod watch;
