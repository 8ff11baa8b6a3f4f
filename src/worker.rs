//! Backend processing loop: pull, process, done, until the engine aborts.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::{Assignment, Engine, Pulled};
use crate::error::Result;
use crate::model::{State, Wait};
use crate::telemetry::engine::{record_state_transition, start_engine_span};

/// Default wait per `pull` inside [`run_engine`].
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

/// Executes work items for one engine.
pub trait Backend<T> {
    /// Process one item to completion. The item is consumed; releasing any
    /// connection it refers to is the backend's job. An error is logged and
    /// the item's capacity slot is released all the same.
    fn process(&mut self, engine: &Engine<T>, item: T) -> Result<()>;
}

impl<T, F> Backend<T> for F
where
    F: FnMut(&Engine<T>, T) -> Result<()>,
{
    fn process(&mut self, engine: &Engine<T>, item: T) -> Result<()> {
        self(engine, item)
    }
}

/// How a processing loop waits for work.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Wait mode passed to every `pull`. `NonBlocking` without an idle
    /// limit would spin, so the loop waits [`DEFAULT_POLL`] instead.
    pub poll: Wait,
    /// Exit the engine after this many consecutive empty polls.
    /// `None` keeps it alive until something else calls `exit`.
    pub max_idle_polls: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll: Wait::Timeout(DEFAULT_POLL),
            max_idle_polls: None,
        }
    }
}

/// Summary of one processing loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub processed: u64,
    pub failed: u64,
    pub idle_polls: u64,
}

/// Drive `engine` until `pull` returns `Aborted`.
///
/// `first` is the in-flight item handed back by `push_or_init`, if any. It
/// is processed before anything is pulled.
pub fn run_engine<T, B>(
    engine: &Engine<T>,
    first: Option<Assignment<T>>,
    backend: &mut B,
    config: LoopConfig,
) -> LoopStats
where
    B: Backend<T> + ?Sized,
{
    let span = start_engine_span(engine.engine_type(), engine.id());
    let _entered = span.enter();
    record_state_transition(&span, State::Initializing, engine.state());

    let mut stats = LoopStats::default();
    if let Some(assignment) = first {
        handle(engine, assignment, backend, &mut stats);
    }

    let poll = match config.poll {
        Wait::NonBlocking if config.max_idle_polls.is_none() => Wait::Timeout(DEFAULT_POLL),
        poll => poll,
    };

    let mut idle = 0u32;
    loop {
        match engine.pull(poll) {
            Pulled::Item(assignment) => {
                idle = 0;
                handle(engine, assignment, backend, &mut stats);
            }
            Pulled::NoneYet => {
                idle += 1;
                stats.idle_polls += 1;
                if config.max_idle_polls.is_some_and(|max| idle >= max) {
                    debug!(engine = %engine.id(), idle, "engine idle, exiting");
                    engine.exit();
                }
            }
            Pulled::Aborted => break,
        }
    }

    record_state_transition(&span, State::Active, engine.state());
    stats
}

fn handle<T, B>(engine: &Engine<T>, assignment: Assignment<T>, backend: &mut B, stats: &mut LoopStats)
where
    B: Backend<T> + ?Sized,
{
    let (ticket, item) = assignment.into_parts();
    match backend.process(engine, item) {
        Ok(()) => stats.processed += 1,
        Err(e) => {
            stats.failed += 1;
            warn!(engine = %engine.id(), %ticket, "processing failed: {e}");
        }
    }
    if let Err(e) = engine.done(ticket) {
        warn!(engine = %engine.id(), "{e}");
    }
}
