//! Watch command implementation.

use alertline_protocol::Filter;
use alertline_sync_engine::{
    ClientEvent, DeliveredEvent, FileStateStore, MemoryStateStore, ModeTransition, StateStore,
    SyncClient, SyncConfig, WsConnector,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Options for the watch command.
#[derive(Debug)]
pub struct WatchOptions {
    /// Push server URL.
    pub url: String,
    /// Client identity.
    pub client_id: String,
    /// Channels to subscribe to.
    pub filters: Vec<Filter>,
    /// Sync state file; state is kept in memory only when absent.
    pub state_file: Option<PathBuf>,
    /// Replay every channel from scratch.
    pub reset: bool,
    /// Catch-up inactivity window in seconds.
    pub inactivity_secs: u64,
    /// Hard catch-up timeout in seconds.
    pub catch_up_secs: u64,
}

/// Runs the watch command until Ctrl-C or until the client gives up.
pub async fn run(options: WatchOptions) -> Result<(), Box<dyn std::error::Error>> {
    let inactivity = Duration::from_secs(options.inactivity_secs);
    let config = SyncConfig::new(options.client_id, options.url)
        .with_filters(options.filters)
        .with_reset_consumers(options.reset)
        .with_inactivity_timeout(inactivity)
        .with_catch_up_timeout(Duration::from_secs(options.catch_up_secs))
        .with_completion_check_interval(check_interval(inactivity));

    let store: Arc<dyn StateStore> = match &options.state_file {
        Some(path) => Arc::new(FileStateStore::open(path)?),
        None => Arc::new(MemoryStateStore::new()),
    };
    let connector = Arc::new(WsConnector::new(config.server_url.clone()));
    let (handle, mut events) = SyncClient::start(config, connector, store)?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", render(&event)),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "could not listen for ctrl-c");
                }
                tracing::info!("interrupted, flushing sync state");
                if let Err(e) = handle.flush_state().await {
                    tracing::warn!(error = %e, "sync state flush failed");
                }
                interrupted = true;
                break;
            }
        }
    }

    handle.disconnect().await;
    let stats = handle.stats();
    tracing::info!(
        accepted = stats.events_accepted,
        duplicates = stats.duplicates_dropped,
        acks = stats.acks_sent,
        reconnects = stats.reconnect_attempts,
        "watch finished"
    );
    match stats.last_error {
        Some(error) if !interrupted => Err(error.into()),
        _ => Ok(()),
    }
}

/// Completion checks run at a tenth of the inactivity window, capped at 2s.
fn check_interval(inactivity: Duration) -> Duration {
    (inactivity / 10).clamp(Duration::from_millis(10), Duration::from_secs(2))
}

fn render(event: &ClientEvent) -> serde_json::Value {
    match event {
        ClientEvent::Event(DeliveredEvent { event, mode }) => json!({
            "kind": "event",
            "mode": mode.to_string(),
            "event": event.to_json(),
        }),
        ClientEvent::ModeChanged(ModeTransition {
            channel,
            from,
            to,
            reason,
            baseline,
        }) => json!({
            "kind": "mode",
            "channel": channel.as_str(),
            "from": from.to_string(),
            "to": to.to_string(),
            "reason": reason.to_string(),
            "baseline": baseline,
        }),
        ClientEvent::Connection(state) => json!({
            "kind": "connection",
            "state": state.to_string(),
        }),
    }
}
