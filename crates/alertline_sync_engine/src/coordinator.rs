//! Per-channel catch-up/live state machine.
//!
//! The coordinator owns the [`SequenceTracker`], a catch-up clock for every
//! channel in catch-up, and the [`CompletionDetector`]. It is a plain
//! synchronous value; the client wraps it in a single mutex so event
//! processing and the periodic completion check never interleave.
//!
//! Time is always passed in. Nothing here reads the clock.

use crate::detector::{CatchUpClock, CompletionDetector, CompletionReason};
use crate::tracker::{Acceptance, SequenceTracker, SyncMode};
use alertline_protocol::{ChannelId, EventEnvelope, SubscriptionAck};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

/// Number of event ids remembered per channel for events without a sequence.
pub const RECENT_ID_CAPACITY: usize = 1024;

/// Why a channel changed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// The subscription ack reported a pending backlog.
    Backlog {
        /// Events waiting on the server.
        pending: u64,
    },
    /// Catch-up finished.
    Completed(CompletionReason),
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::Backlog { pending } => write!(f, "backlog({pending})"),
            TransitionReason::Completed(reason) => write!(f, "{reason}"),
        }
    }
}

/// A mode change of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTransition {
    /// The channel.
    pub channel: ChannelId,
    /// Mode before.
    pub from: SyncMode,
    /// Mode after.
    pub to: SyncMode,
    /// What caused it.
    pub reason: TransitionReason,
    /// Live baseline after the change (the prior baseline when entering catch-up).
    pub baseline: Option<u64>,
}

/// Result of feeding one event to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    /// Whether the event is new.
    pub acceptance: Acceptance,
    /// Set when the event carried an embedded completion flag that ended
    /// its channel's catch-up.
    pub completion: Option<ModeTransition>,
}

/// Bounded set of recently seen ids, oldest evicted first.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == RECENT_ID_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.ids.insert(id.to_owned());
        true
    }
}

#[derive(Debug, Default)]
struct ChannelTiming {
    clock: Option<CatchUpClock>,
    recent: RecentIds,
}

/// Drives every channel between catch-up and live.
#[derive(Debug)]
pub struct ChannelSyncCoordinator {
    tracker: SequenceTracker,
    detector: CompletionDetector,
    timing: HashMap<ChannelId, ChannelTiming>,
}

impl ChannelSyncCoordinator {
    /// Creates a coordinator with no channels.
    pub fn new(detector: CompletionDetector) -> Self {
        Self {
            tracker: SequenceTracker::new(),
            detector,
            timing: HashMap::new(),
        }
    }

    /// Registers a channel in live mode, seeding its baseline.
    ///
    /// Returns false if the channel already exists; its state is kept.
    pub fn register(&mut self, channel: ChannelId, baseline: Option<u64>) -> bool {
        if !self.tracker.register(channel.clone(), baseline) {
            return false;
        }
        self.timing.insert(channel, ChannelTiming::default());
        true
    }

    /// Drops a channel and all its state.
    pub fn unregister(&mut self, channel: &ChannelId) -> bool {
        self.timing.remove(channel);
        self.tracker.remove(channel)
    }

    /// Drops every channel.
    pub fn clear(&mut self) {
        self.timing.clear();
        self.tracker.clear();
    }

    /// Returns true if the channel is registered.
    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.tracker.contains(channel)
    }

    /// Current mode of a channel.
    pub fn mode(&self, channel: &ChannelId) -> Option<SyncMode> {
        self.tracker.mode(channel)
    }

    /// Live baseline of a channel.
    pub fn baseline(&self, channel: &ChannelId) -> Option<u64> {
        self.tracker.baseline(channel)
    }

    /// All channels with their modes, sorted by id.
    pub fn channels(&self) -> Vec<(ChannelId, SyncMode)> {
        let mut channels: Vec<_> = self
            .tracker
            .channels()
            .map(|(id, mode)| (id.clone(), mode))
            .collect();
        channels.sort_by(|a, b| a.0.cmp(&b.0));
        channels
    }

    /// Returns true if any channel is catching up.
    pub fn is_catching_up(&self) -> bool {
        self.tracker
            .channels()
            .any(|(_, mode)| mode == SyncMode::CatchUp)
    }

    /// Applies the backlog counts of a subscription ack.
    ///
    /// Live channels with a pending backlog enter catch-up. Channels already
    /// catching up keep their clock. Entries for unknown channels are ignored.
    pub fn apply_subscription_ack(
        &mut self,
        ack: &SubscriptionAck,
        now: Instant,
    ) -> Vec<ModeTransition> {
        let mut transitions = Vec::new();
        for (channel, backlog) in &ack.channels {
            if !self.tracker.contains(channel) {
                tracing::debug!(channel = %channel, "subscription ack for unknown channel ignored");
                continue;
            }
            if backlog.pending_count == 0 || !self.tracker.begin_catch_up(channel) {
                continue;
            }
            self.timing.entry(channel.clone()).or_default().clock = Some(CatchUpClock::start(now));
            let transition = ModeTransition {
                channel: channel.clone(),
                from: SyncMode::Live,
                to: SyncMode::CatchUp,
                reason: TransitionReason::Backlog {
                    pending: backlog.pending_count,
                },
                baseline: self.tracker.baseline(channel),
            };
            tracing::info!(
                channel = %channel,
                pending = backlog.pending_count,
                "channel entering catch-up"
            );
            transitions.push(transition);
        }
        transitions
    }

    /// Decides whether an event is new and updates channel state.
    ///
    /// Events for unknown channels register the channel in live mode.
    /// Events without a sequence are deduplicated by id.
    pub fn on_event(&mut self, event: &EventEnvelope, now: Instant) -> EventOutcome {
        let channel = &event.channel;
        if !self.tracker.contains(channel) {
            tracing::debug!(channel = %channel, "registering channel from first event");
            self.register(channel.clone(), None);
        }

        let timing = self.timing.entry(channel.clone()).or_default();
        let acceptance = match event.sequence {
            Some(seq) => self.tracker.accept(channel, seq),
            None => {
                if timing.recent.insert(&event.id) {
                    Acceptance::New
                } else {
                    Acceptance::Duplicate
                }
            }
        };

        if acceptance.is_new() {
            if let Some(clock) = timing.clock.as_mut() {
                clock.touch(now);
            }
        } else {
            tracing::trace!(channel = %channel, seq = ?event.sequence, id = %event.id, "duplicate event");
        }

        let completion = if event.catch_up_complete {
            self.complete(channel, CompletionReason::Signal)
        } else {
            None
        };

        EventOutcome {
            acceptance,
            completion,
        }
    }

    /// Moves a catch-up channel to live.
    ///
    /// Returns `None` for a live or unknown channel; the first completion
    /// wins and later ones are no-ops.
    pub fn complete(
        &mut self,
        channel: &ChannelId,
        reason: CompletionReason,
    ) -> Option<ModeTransition> {
        let Some(baseline) = self.tracker.finish_catch_up(channel) else {
            tracing::debug!(channel = %channel, reason = %reason, "completion ignored, channel not catching up");
            return None;
        };
        if let Some(timing) = self.timing.get_mut(channel) {
            timing.clock = None;
        }
        tracing::info!(channel = %channel, reason = %reason, baseline = ?baseline, "channel live");
        Some(ModeTransition {
            channel: channel.clone(),
            from: SyncMode::CatchUp,
            to: SyncMode::Live,
            reason: TransitionReason::Completed(reason),
            baseline,
        })
    }

    /// Runs the timeout and inactivity rules over every catch-up channel.
    pub fn check_completions(&mut self, now: Instant) -> Vec<ModeTransition> {
        let mut due: Vec<(ChannelId, CompletionReason)> = self
            .timing
            .iter()
            .filter_map(|(channel, timing)| {
                let clock = timing.clock.as_ref()?;
                self.detector
                    .evaluate(clock, now)
                    .map(|reason| (channel.clone(), reason))
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        due.into_iter()
            .filter_map(|(channel, reason)| self.complete(&channel, reason))
            .collect()
    }

    /// Forces every catch-up channel to live after a transport failure.
    pub fn force_live_all(&mut self) -> Vec<ModeTransition> {
        let mut catching_up: Vec<ChannelId> = self
            .tracker
            .channels()
            .filter(|(_, mode)| *mode == SyncMode::CatchUp)
            .map(|(id, _)| id.clone())
            .collect();
        catching_up.sort();

        catching_up
            .into_iter()
            .filter_map(|channel| self.complete(&channel, CompletionReason::TransportFailure))
            .collect()
    }
}

impl Default for ChannelSyncCoordinator {
    fn default() -> Self {
        Self::new(CompletionDetector::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn giridih() -> ChannelId {
        ChannelId::from("giridih_id")
    }

    fn event(seq: u64) -> EventEnvelope {
        EventEnvelope::new(format!("evt-{seq}"), "giridih", "id").with_sequence(seq)
    }

    fn catching_up(now: Instant) -> ChannelSyncCoordinator {
        let mut coordinator = ChannelSyncCoordinator::default();
        coordinator.register(giridih(), None);
        let ack = SubscriptionAck::default().with_channel(giridih(), 5);
        let transitions = coordinator.apply_subscription_ack(&ack, now);
        assert_eq!(transitions.len(), 1);
        coordinator
    }

    #[test]
    fn backlog_enters_catch_up() {
        let t0 = Instant::now();
        let mut coordinator = ChannelSyncCoordinator::default();
        coordinator.register(giridih(), Some(100));
        coordinator.register(ChannelId::from("north_motion"), None);

        let ack = SubscriptionAck::default()
            .with_channel(giridih(), 12)
            .with_channel(ChannelId::from("north_motion"), 0)
            .with_channel(ChannelId::from("ghost_channel"), 3);
        let transitions = coordinator.apply_subscription_ack(&ack, t0);

        assert_eq!(
            transitions,
            vec![ModeTransition {
                channel: giridih(),
                from: SyncMode::Live,
                to: SyncMode::CatchUp,
                reason: TransitionReason::Backlog { pending: 12 },
                baseline: Some(100),
            }]
        );
        assert_eq!(
            coordinator.mode(&ChannelId::from("north_motion")),
            Some(SyncMode::Live)
        );
        assert!(!coordinator.contains(&ChannelId::from("ghost_channel")));
        assert!(coordinator.is_catching_up());

        assert!(coordinator.apply_subscription_ack(&ack, t0).is_empty());
    }

    #[test]
    fn out_of_order_backlog_then_inactivity() {
        let t0 = Instant::now();
        let mut coordinator = catching_up(t0);

        for (i, seq) in [156, 200, 180, 155, 190].into_iter().enumerate() {
            let at = t0 + Duration::from_millis(100 * i as u64);
            assert_eq!(coordinator.on_event(&event(seq), at).acceptance, Acceptance::New);
        }
        let last = t0 + Duration::from_millis(400);

        assert!(coordinator
            .check_completions(last + Duration::from_secs(29))
            .is_empty());
        let transitions = coordinator.check_completions(last + Duration::from_secs(30));
        assert_eq!(transitions.len(), 1);
        assert_eq!(
            transitions[0].reason,
            TransitionReason::Completed(CompletionReason::Inactivity)
        );
        assert_eq!(transitions[0].baseline, Some(200));
        assert!(coordinator
            .check_completions(last + Duration::from_secs(45))
            .is_empty());

        let later = last + Duration::from_secs(31);
        assert_eq!(coordinator.on_event(&event(201), later).acceptance, Acceptance::New);
        assert_eq!(
            coordinator.on_event(&event(155), later).acceptance,
            Acceptance::Duplicate
        );
    }

    #[test]
    fn hard_timeout_fires_despite_activity() {
        let t0 = Instant::now();
        let mut coordinator = catching_up(t0);

        for secs in 0..60 {
            coordinator.on_event(&event(secs + 1), t0 + Duration::from_secs(secs));
        }
        let transitions = coordinator.check_completions(t0 + Duration::from_secs(60));
        assert_eq!(
            transitions[0].reason,
            TransitionReason::Completed(CompletionReason::Timeout)
        );
        assert_eq!(transitions[0].baseline, Some(60));
    }

    #[test]
    fn explicit_signal_is_idempotent() {
        let t0 = Instant::now();
        let mut coordinator = catching_up(t0);

        let first = coordinator.complete(&giridih(), CompletionReason::Signal);
        assert!(first.is_some());
        assert_eq!(coordinator.mode(&giridih()), Some(SyncMode::Live));
        assert!(coordinator
            .complete(&giridih(), CompletionReason::Signal)
            .is_none());
        assert!(coordinator
            .complete(&ChannelId::from("ghost_channel"), CompletionReason::Signal)
            .is_none());
        assert!(coordinator
            .check_completions(t0 + Duration::from_secs(120))
            .is_empty());
    }

    #[test]
    fn embedded_flag_completes_after_processing_event() {
        let t0 = Instant::now();
        let mut coordinator = catching_up(t0);
        coordinator.on_event(&event(10), t0);

        let outcome = coordinator.on_event(&event(12).with_catch_up_complete(true), t0);
        assert_eq!(outcome.acceptance, Acceptance::New);
        let transition = outcome.completion.unwrap();
        assert_eq!(transition.baseline, Some(12));
        assert_eq!(
            transition.reason,
            TransitionReason::Completed(CompletionReason::Signal)
        );
    }

    #[test]
    fn transport_failure_forces_all_live() {
        let t0 = Instant::now();
        let mut coordinator = catching_up(t0);
        coordinator.register(ChannelId::from("north_motion"), None);
        coordinator.on_event(&event(7), t0);

        let transitions = coordinator.force_live_all();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].channel, giridih());
        assert_eq!(transitions[0].baseline, Some(7));
        assert!(!coordinator.is_catching_up());
        assert!(coordinator.force_live_all().is_empty());
    }

    #[test]
    fn unknown_channel_registers_live() {
        let mut coordinator = ChannelSyncCoordinator::default();
        let outcome = coordinator.on_event(
            &EventEnvelope::new("x1", "east", "fire").with_sequence(3),
            Instant::now(),
        );
        assert!(outcome.acceptance.is_new());
        assert_eq!(
            coordinator.mode(&ChannelId::from("east_fire")),
            Some(SyncMode::Live)
        );
        assert_eq!(coordinator.baseline(&ChannelId::from("east_fire")), Some(3));
    }

    #[test]
    fn unsequenced_events_dedupe_by_id() {
        let now = Instant::now();
        let mut coordinator = ChannelSyncCoordinator::default();
        let plain = EventEnvelope::new("note-1", "north", "notice");

        assert!(coordinator.on_event(&plain, now).acceptance.is_new());
        assert!(!coordinator.on_event(&plain, now).acceptance.is_new());
        assert!(coordinator
            .on_event(&EventEnvelope::new("note-2", "north", "notice"), now)
            .acceptance
            .is_new());
    }

    #[test]
    fn recent_ids_evict_oldest() {
        let mut recent = RecentIds::default();
        for i in 0..=RECENT_ID_CAPACITY {
            assert!(recent.insert(&format!("id-{i}")));
        }
        assert_eq!(recent.order.len(), RECENT_ID_CAPACITY);
        assert!(recent.insert("id-0"));
        assert!(!recent.insert(&format!("id-{RECENT_ID_CAPACITY}")));
    }

    #[test]
    fn unregister_forgets_state() {
        let t0 = Instant::now();
        let mut coordinator = catching_up(t0);
        assert!(coordinator.unregister(&giridih()));
        assert!(!coordinator.contains(&giridih()));
        assert!(coordinator.check_completions(t0 + Duration::from_secs(90)).is_empty());
        assert!(coordinator.channels().is_empty());
    }
}
