//! Per-channel sequence tracking.
//!
//! Each channel is in one of two modes:
//!
//! - **Live**: events arrive in increasing order. A sequence is new iff it
//!   is strictly greater than the baseline, and accepting it moves the
//!   baseline forward.
//! - **Catch-up**: a backlog arrives in any order, possibly from several
//!   producers at once. A sequence is new iff it is not in the channel's
//!   seen-set.
//!
//! The seen-set only exists inside the catch-up variant, so leaving
//! catch-up drops it by construction.

use alertline_protocol::ChannelId;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Delivery mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Steady-state, in-order delivery.
    Live,
    /// Bulk backlog delivery in any order.
    CatchUp,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Live => f.write_str("LIVE"),
            SyncMode::CatchUp => f.write_str("CATCH_UP"),
        }
    }
}

/// Result of offering a sequence to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// First time this sequence is seen.
    New,
    /// Already seen (or behind the live baseline).
    Duplicate,
}

impl Acceptance {
    /// Returns true for [`Acceptance::New`].
    pub fn is_new(self) -> bool {
        self == Acceptance::New
    }
}

#[derive(Debug, Clone)]
enum Window {
    Live {
        baseline: Option<u64>,
    },
    CatchUp {
        seen: HashSet<u64>,
        max_seen: Option<u64>,
        prior_baseline: Option<u64>,
    },
}

impl Window {
    fn mode(&self) -> SyncMode {
        match self {
            Window::Live { .. } => SyncMode::Live,
            Window::CatchUp { .. } => SyncMode::CatchUp,
        }
    }

    fn accept(&mut self, seq: u64) -> Acceptance {
        match self {
            Window::Live { baseline } => {
                if baseline.map_or(true, |b| seq > b) {
                    *baseline = Some(seq);
                    Acceptance::New
                } else {
                    Acceptance::Duplicate
                }
            }
            Window::CatchUp { seen, max_seen, .. } => {
                if seen.insert(seq) {
                    *max_seen = Some(max_seen.map_or(seq, |m| m.max(seq)));
                    Acceptance::New
                } else {
                    Acceptance::Duplicate
                }
            }
        }
    }
}

/// Tracks sequences for every channel.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    windows: HashMap<ChannelId, Window>,
}

impl SequenceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel in live mode with an optional starting baseline.
    ///
    /// Returns false if the channel was already registered.
    pub fn register(&mut self, channel: ChannelId, baseline: Option<u64>) -> bool {
        if self.windows.contains_key(&channel) {
            return false;
        }
        self.windows.insert(channel, Window::Live { baseline });
        true
    }

    /// Forgets a channel.
    pub fn remove(&mut self, channel: &ChannelId) -> bool {
        self.windows.remove(channel).is_some()
    }

    /// Forgets every channel.
    pub fn clear(&mut self) {
        self.windows.clear();
    }

    /// Returns true if the channel is registered.
    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.windows.contains_key(channel)
    }

    /// Returns the channel's mode.
    pub fn mode(&self, channel: &ChannelId) -> Option<SyncMode> {
        self.windows.get(channel).map(Window::mode)
    }

    /// Returns the live baseline. During catch-up this is the baseline the
    /// channel had before catch-up began.
    pub fn baseline(&self, channel: &ChannelId) -> Option<u64> {
        match self.windows.get(channel)? {
            Window::Live { baseline } => *baseline,
            Window::CatchUp { prior_baseline, .. } => *prior_baseline,
        }
    }

    /// Number of distinct sequences seen during the current catch-up.
    pub fn seen_count(&self, channel: &ChannelId) -> usize {
        match self.windows.get(channel) {
            Some(Window::CatchUp { seen, .. }) => seen.len(),
            _ => 0,
        }
    }

    /// Registered channels and their modes.
    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, SyncMode)> {
        self.windows.iter().map(|(id, w)| (id, w.mode()))
    }

    /// Offers a sequence for a channel.
    ///
    /// An unregistered channel is registered in live mode first.
    pub fn accept(&mut self, channel: &ChannelId, seq: u64) -> Acceptance {
        self.windows
            .entry(channel.clone())
            .or_insert(Window::Live { baseline: None })
            .accept(seq)
    }

    /// Switches a live channel to catch-up with an empty seen-set.
    ///
    /// Returns false if the channel is unknown or already catching up.
    pub fn begin_catch_up(&mut self, channel: &ChannelId) -> bool {
        let Some(window) = self.windows.get_mut(channel) else {
            return false;
        };
        let Window::Live { baseline } = window else {
            return false;
        };
        let prior_baseline = *baseline;
        *window = Window::CatchUp {
            seen: HashSet::new(),
            max_seen: None,
            prior_baseline,
        };
        true
    }

    /// Switches a catch-up channel back to live.
    ///
    /// The new baseline is the highest sequence seen during catch-up, or
    /// the prior baseline if that is higher or nothing was seen. Returns
    /// `None` if the channel was not catching up, otherwise the new baseline.
    pub fn finish_catch_up(&mut self, channel: &ChannelId) -> Option<Option<u64>> {
        let window = self.windows.get_mut(channel)?;
        let Window::CatchUp {
            max_seen,
            prior_baseline,
            ..
        } = window
        else {
            return None;
        };
        let baseline = match (*max_seen, *prior_baseline) {
            (Some(seen), Some(prior)) => Some(seen.max(prior)),
            (seen, prior) => seen.or(prior),
        };
        *window = Window::Live { baseline };
        Some(baseline)
    }
}
