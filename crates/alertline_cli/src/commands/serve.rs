//! Serve command implementation.

use alertline_protocol::{Filter, Value};
use alertline_push_server::{PushServer, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Options for the serve command.
#[derive(Debug)]
pub struct ServeOptions {
    /// Listen address.
    pub bind: SocketAddr,
    /// Channels to seed and to publish live events on.
    pub channels: Vec<Filter>,
    /// Events published per channel at startup.
    pub seed_backlog: usize,
    /// Events per replay burst.
    pub burst_size: usize,
    /// Share of each burst sent twice.
    pub duplicate_ratio: f64,
    /// Replay shuffle seed.
    pub seed: u64,
    /// Send sync_complete after each backlog.
    pub send_completion: bool,
    /// Live publish interval in milliseconds.
    pub live_interval_ms: Option<u64>,
}

/// Runs the push server until Ctrl-C.
pub async fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::new(options.bind)
        .with_burst_size(options.burst_size)
        .with_duplicate_ratio(options.duplicate_ratio)
        .with_shuffle(options.seed)
        .with_completion_signal(options.send_completion);
    let (server, addr) = PushServer::bind(config).await?;

    let mut published = 0u64;
    for filter in &options.channels {
        for _ in 0..options.seed_backlog {
            server.publish(&filter.area, &filter.event_type, payload(published), true);
            published += 1;
        }
    }
    tracing::info!(
        addr = %addr,
        channels = options.channels.len(),
        seeded = published,
        "push server listening"
    );

    let live_interval = options
        .live_interval_ms
        .filter(|ms| *ms > 0 && !options.channels.is_empty())
        .map(Duration::from_millis);
    let mut live = tokio::time::interval(live_interval.unwrap_or(Duration::from_secs(3600)));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "could not listen for ctrl-c");
                }
                break;
            }
            _ = live.tick(), if live_interval.is_some() => {
                for filter in &options.channels {
                    let event = server.publish(&filter.area, &filter.event_type, payload(published), true);
                    tracing::debug!(channel = %event.channel, seq = ?event.sequence, "published live event");
                    published += 1;
                }
            }
        }
    }

    tracing::info!(published, sessions = server.session_count(), "shutting down");
    server.shutdown().await;
    Ok(())
}

fn payload(index: u64) -> Value {
    let mut data = Value::object();
    data.insert("index", index);
    data.insert("source", "alertline serve");
    data
}
