//! Acknowledgment batching.

use crate::config::AckConfig;
use alertline_protocol::AckFrame;
use std::collections::{HashSet, VecDeque};

/// Queue of event ids waiting to be acknowledged.
///
/// Ids leave the queue when a batch is taken. If sending that batch fails
/// the caller hands the ids back with [`restore`](Self::restore) and they
/// go out first on the next successful connection.
#[derive(Debug)]
pub struct AckDispatcher {
    client_id: String,
    config: AckConfig,
    pending: VecDeque<String>,
    queued: HashSet<String>,
}

impl AckDispatcher {
    /// Creates an empty dispatcher.
    pub fn new(client_id: impl Into<String>, config: AckConfig) -> Self {
        Self {
            client_id: client_id.into(),
            config,
            pending: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    /// Queues an id. Returns false if it is already queued.
    pub fn enqueue(&mut self, event_id: impl Into<String>) -> bool {
        let event_id = event_id.into();
        if !self.queued.insert(event_id.clone()) {
            return false;
        }
        self.pending.push_back(event_id);
        true
    }

    /// Number of queued ids.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued ids, oldest first.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Whether the queue should be flushed now rather than on the next tick.
    ///
    /// A full batch always flushes. Outside catch-up a small queue flushes
    /// immediately so live events are acknowledged without delay.
    pub fn should_flush_now(&self, catching_up: bool) -> bool {
        let pending = self.pending.len();
        if pending == 0 {
            return false;
        }
        pending >= self.config.batch_size
            || (!catching_up && pending <= self.config.immediate_threshold)
    }

    /// Removes up to one batch of ids and builds its frame.
    pub fn take_batch(&mut self) -> Option<AckFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let take = self.pending.len().min(self.config.batch_size.max(1));
        let ids: Vec<String> = self.pending.drain(..take).collect();
        for id in &ids {
            self.queued.remove(id);
        }
        Some(AckFrame::for_ids(self.client_id.clone(), ids))
    }

    /// Puts ids from a failed send back at the front of the queue.
    pub fn restore(&mut self, ids: Vec<String>) {
        for id in ids.into_iter().rev() {
            if self.queued.insert(id.clone()) {
                self.pending.push_front(id);
            }
        }
    }

    /// Drops every queued id.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.queued.clear();
    }
}
