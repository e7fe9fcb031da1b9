//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the push server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Backlog events sent per burst.
    pub burst_size: usize,
    /// Pause between bursts.
    pub burst_pause: Duration,
    /// Whether each burst is shuffled.
    pub shuffle: bool,
    /// Seed for shuffling and duplicate selection.
    pub seed: u64,
    /// Fraction of each burst sent a second time (0.0 to 1.0).
    pub duplicate_ratio: f64,
    /// Whether to send `sync_complete` after a channel's backlog.
    pub send_completion: bool,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            burst_size: 25,
            burst_pause: Duration::from_millis(5),
            shuffle: true,
            seed: 7,
            duplicate_ratio: 0.0,
            send_completion: true,
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the burst size.
    pub fn with_burst_size(mut self, size: usize) -> Self {
        self.burst_size = size.max(1);
        self
    }

    /// Sets the pause between bursts.
    pub fn with_burst_pause(mut self, pause: Duration) -> Self {
        self.burst_pause = pause;
        self
    }

    /// Enables shuffling with the given seed.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    /// Sends backlogs in sequence order.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    /// Sets the fraction of each burst that is re-sent.
    pub fn with_duplicate_ratio(mut self, ratio: f64) -> Self {
        self.duplicate_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Enables or disables the explicit completion signal.
    pub fn with_completion_signal(mut self, enabled: bool) -> Self {
        self.send_completion = enabled;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 9400)))
    }
}
