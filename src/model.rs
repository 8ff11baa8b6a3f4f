//! Core data model.
//!
//! An engine is a named, capacity-bounded worker context. Work items are
//! opaque to the dispatch core; the types here describe engine identity,
//! lifecycle, configuration, and the tokens used to account for in-flight
//! work.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Process-unique engine identifier, assigned by the registry at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u64);

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Token for one pulled work item, valid until passed to `Engine::done`.
///
/// Tickets are unique per engine, not across engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Registered, `init` callback still running. Invisible to `push`.
    Initializing,
    /// Accepting work.
    Active,
    /// `exit` was called while work remained. No new admissions.
    Draining,
    /// Shut down and removed from the registry. Terminal.
    Exited,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Initializing, Active)
                | (Initializing, Exited) // init failed
                | (Active, Draining)
                | (Active, Exited)       // exit with nothing outstanding
                | (Draining, Exited)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Exited)
    }

    /// Has `exit` been requested (draining or exited)?
    pub fn is_shutting_down(self) -> bool {
        matches!(self, State::Draining | State::Exited)
    }

    /// Checked transition, for use inside the engine's lock.
    pub(crate) fn transition(&mut self, to: State) -> Result<()> {
        if !self.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Initializing => "initializing",
            State::Active => "active",
            State::Draining => "draining",
            State::Exited => "exited",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(State::Initializing),
            "active" => Ok(State::Active),
            "draining" => Ok(State::Draining),
            "exited" => Ok(State::Exited),
            other => Err(Error::Other(format!("unknown engine state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Largest accepted log2 window size.
pub const MAX_WINDOW_BITS: u8 = 31;

/// Default overall buffering window: 1 MiB.
pub const DEFAULT_WINDOW_BITS: u8 = 20;

/// Default per-request buffering window: 64 KiB.
pub const DEFAULT_REQ_WINDOW_BITS: u8 = 16;

/// Engine configuration, fixed once `init` returns.
///
/// Window sizes are advisory budgets for the I/O layer; the dispatch core
/// only enforces `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum work items held at once (queued + in flight).
    pub capacity: usize,
    /// Overall response data the engine may buffer, as log2 bytes.
    pub window_bits: u8,
    /// Response body data buffered per request, as log2 bytes.
    pub req_window_bits: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            capacity: 0,
            window_bits: DEFAULT_WINDOW_BITS,
            req_window_bits: DEFAULT_REQ_WINDOW_BITS,
        }
    }
}

impl EngineSettings {
    /// Overall window in bytes.
    pub fn window_bytes(&self) -> u64 {
        1u64 << self.window_bits
    }

    /// Per-request window in bytes.
    pub fn req_window_bytes(&self) -> u64 {
        1u64 << self.req_window_bits
    }

    /// Reject window sizes that do not fit the log2 encoding.
    ///
    /// Capacity is checked separately, since a zero capacity is only an
    /// error once `init` has finished.
    pub fn validate_windows(&self) -> Result<()> {
        check_window("window_bits", self.window_bits)?;
        check_window("req_window_bits", self.req_window_bits)
    }
}

fn check_window(name: &'static str, bits: u8) -> Result<()> {
    if bits > MAX_WINDOW_BITS {
        return Err(Error::InvalidWindow {
            name,
            bits,
            max: MAX_WINDOW_BITS,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wait mode
// ---------------------------------------------------------------------------

/// How long `Engine::pull` may block when nothing is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately.
    NonBlocking,
    /// Block until an item arrives or the engine exits.
    Forever,
    /// Block at most this long.
    Timeout(Duration),
}

impl Wait {
    /// `Duration::ZERO` means non-blocking, matching a zero poll timeout.
    pub fn from_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Wait::NonBlocking
        } else {
            Wait::Timeout(timeout)
        }
    }
}
