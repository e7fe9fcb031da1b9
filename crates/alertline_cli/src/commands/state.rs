//! State command implementation.

use alertline_protocol::SyncStateMap;
use alertline_sync_engine::{FileStateStore, StateStore};
use std::path::Path;

/// Runs the state command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No sync state found at {:?}", path).into());
    }
    let state = FileStateStore::open(path)?.load()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&state)?),
        _ => print!("{}", render_text(path, &state)),
    }
    Ok(())
}

fn render_text(path: &Path, state: &SyncStateMap) -> String {
    let mut out = format!("Sync state: {}\n", path.display());
    out.push_str(&format!("Channels:   {}\n", state.len()));
    for (channel, record) in state {
        out.push('\n');
        out.push_str(&format!("  {channel}\n"));
        out.push_str(&format!("    last seq:   {}\n", display_or_dash(record.last_seq)));
        out.push_str(&format!(
            "    last event: {}\n",
            display_or_dash(record.last_event_id.as_deref())
        ));
        out.push_str(&format!(
            "    last time:  {}\n",
            display_or_dash(record.last_timestamp.as_deref())
        ));
    }
    out
}

fn display_or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertline_protocol::{ChannelId, SyncStateRecord};

    #[test]
    fn text_lists_every_channel() {
        let mut state = SyncStateMap::new();
        state.insert(
            ChannelId::from("giridih_id"),
            SyncStateRecord {
                last_event_id: Some("evt-200".into()),
                last_timestamp: None,
                last_seq: Some(200),
            },
        );
        state.insert(ChannelId::from("north_motion"), SyncStateRecord::default());

        let text = render_text(Path::new("sync.json"), &state);
        assert!(text.contains("Channels:   2"));
        assert!(text.contains("  giridih_id\n    last seq:   200"));
        assert!(text.contains("last event: evt-200"));
        assert!(text.contains("  north_motion\n    last seq:   -"));
    }
}
