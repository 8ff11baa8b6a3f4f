//! Structured events emitted by the registry on every engine lifecycle change.
//!
//! Consumers poll the event log to build dashboards, alerting, or audit
//! trails. The log is bounded; the oldest events are dropped first and the
//! sequence number keeps counting, so a consumer can detect that it fell
//! behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::EngineId;
use crate::sync::lock;

/// Default number of events retained by a registry.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A structured event emitted by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, starting at 1. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    EngineCreated {
        id: EngineId,
        engine_type: String,
    },
    EngineActivated {
        id: EngineId,
        capacity: usize,
        window_bits: u8,
        req_window_bits: u8,
    },
    EngineInitFailed {
        id: EngineId,
        engine_type: String,
        error: String,
    },
    EngineDraining {
        id: EngineId,
        pending: usize,
        in_flight: usize,
    },
    EngineExited {
        id: EngineId,
        engine_type: String,
    },
    PushRejected {
        engine_type: String,
    },
}

/// Bounded, in-memory event log.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    last_seq: u64,
    events: VecDeque<Event>,
}

impl EventLog {
    /// A log retaining at most `capacity` events. Zero disables retention,
    /// though sequence numbers are still assigned.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// Append an event, returning its sequence number.
    pub fn record(&self, kind: EventKind) -> u64 {
        let mut inner = lock(&self.inner);
        inner.last_seq += 1;
        let seq = inner.last_seq;
        if self.capacity == 0 {
            return seq;
        }
        if inner.events.len() == self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
        seq
    }

    /// All retained events with a sequence number greater than `since_seq`.
    pub fn since(&self, since_seq: u64) -> Vec<Event> {
        let inner = lock(&self.inner);
        inner
            .events
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    /// Sequence number of the most recent event, or 0 if none yet.
    pub fn last_seq(&self) -> u64 {
        lock(&self.inner).last_seq
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
