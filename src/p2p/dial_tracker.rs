//! Dial tracking for connection maintenance
//!
//! Keeps one [`RetryRecord`] per unhealthy remote (attempt count and last attempt time) and a
//! bounded history of dial events with reasons, to help diagnose why peers aren't connecting.

use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

use crate::p2p::transport::RemoteId;

/// Maximum number of dial events to keep in memory
const MAX_DIAL_EVENTS: usize = 100;

/// Retry bookkeeping for one remote; exists only while the remote is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRecord {
    pub attempts: u32,
    pub last_attempt: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialKind {
    Join,
    Allow,
    Failure,
}

/// A single dial event
#[derive(Debug, Clone)]
pub struct DialEvent {
    pub remote: Option<RemoteId>,
    pub peer: String,
    pub kind: DialKind,
    pub reason: String,
    pub at: Instant,
    pub source: &'static str, // "missing", "retry", "connect"
}

#[derive(Debug, Default)]
pub struct DialTracker {
    records: HashMap<RemoteId, RetryRecord>,
    events: VecDeque<DialEvent>,
}

impl DialTracker {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            events: VecDeque::with_capacity(MAX_DIAL_EVENTS),
        }
    }

    /// Count a retry toward `id` at `now` and return the updated record.
    pub fn record_retry(&mut self, id: RemoteId, now: Instant) -> RetryRecord {
        let record = self.records.entry(id).or_insert(RetryRecord {
            attempts: 0,
            last_attempt: now,
        });
        record.attempts += 1;
        record.last_attempt = now;
        *record
    }

    pub fn retry_record(&self, id: RemoteId) -> Option<&RetryRecord> {
        self.records.get(&id)
    }

    /// Drop the record of a remote that became healthy (or went away).
    pub fn forget(&mut self, id: RemoteId) -> Option<RetryRecord> {
        self.records.remove(&id)
    }

    /// Drop records for remotes `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(RemoteId) -> bool) {
        self.records.retain(|id, _| keep(*id));
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Record a dial event
    pub fn record(&mut self, event: DialEvent) {
        self.events.push_back(event);

        // Keep only the most recent events
        if self.events.len() > MAX_DIAL_EVENTS {
            self.events.pop_front();
        }
    }

    /// All recorded events (most recent first)
    pub fn events(&self) -> Vec<DialEvent> {
        self.events.iter().rev().cloned().collect()
    }

    /// Events for a specific peer (most recent first)
    pub fn events_for(&self, peer: &str) -> Vec<DialEvent> {
        self.events
            .iter()
            .filter(|e| e.peer == peer)
            .rev()
            .cloned()
            .collect()
    }
}
