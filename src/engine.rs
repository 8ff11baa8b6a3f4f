//! Engine: a capacity-bounded worker context and the consumer half of the
//! dispatch protocol.
//!
//! An engine owns a FIFO of pending work items and the set of tickets for
//! items pulled but not yet done. Each engine has its own lock and condition
//! variable, so contention on one engine never stalls another. Items enter
//! through `Registry::push`; the backend driving the engine calls `pull`,
//! processes the item, and calls `done` with the item's ticket.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, OnceLock, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{EngineId, EngineSettings, State, Ticket, Wait};
use crate::registry::Shared;
use crate::sync::{lock, wait, wait_timeout};
use crate::telemetry::metrics;

/// Backend-specific state attached to an engine during `init`.
pub type UserData = Box<dyn Any + Send + Sync>;

/// A work item handed to a backend, paired with the ticket that releases
/// its capacity slot.
#[derive(Debug)]
pub struct Assignment<T> {
    pub ticket: Ticket,
    pub item: T,
}

impl<T> Assignment<T> {
    pub fn into_parts(self) -> (Ticket, T) {
        (self.ticket, self.item)
    }
}

/// Outcome of `Engine::pull`.
#[derive(Debug)]
pub enum Pulled<T> {
    /// The next item in arrival order. Counted in flight until `done`.
    Item(Assignment<T>),
    /// Nothing arrived within the requested wait. Poll again.
    NoneYet,
    /// The engine is shutting down and has nothing left to hand out.
    /// The processing loop must stop.
    Aborted,
}

impl<T> Pulled<T> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Pulled::Aborted)
    }

    pub fn into_assignment(self) -> Option<Assignment<T>> {
        match self {
            Pulled::Item(assignment) => Some(assignment),
            _ => None,
        }
    }
}

/// Point-in-time view of an engine, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub id: EngineId,
    pub engine_type: String,
    pub state: State,
    pub capacity: usize,
    pub window_bits: u8,
    pub req_window_bits: u8,
    pub pending: usize,
    pub in_flight: usize,
    pub created_at: DateTime<Utc>,
}

/// A named, capacity-bounded worker context.
///
/// Engines are created lazily by the registry and shared as
/// `Arc<Engine<T>>`. `id` and `engine_type` never change; settings are
/// fixed once `init` returns.
pub struct Engine<T> {
    id: EngineId,
    engine_type: String,
    created_at: DateTime<Utc>,
    settings: OnceLock<EngineSettings>,
    user_data: OnceLock<UserData>,
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    shared: Weak<Shared<T>>,
}

struct Inner<T> {
    state: State,
    capacity: usize,
    pending: VecDeque<T>,
    in_flight: HashSet<Ticket>,
    next_ticket: u64,
    /// `exit` arrived before `init` finished.
    exit_requested: bool,
}

impl<T> Inner<T> {
    fn load(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn issue_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.in_flight.insert(ticket);
        ticket
    }
}

/// Which way an `exit` or `done` moved the engine, decided under the lock
/// and acted on after it is released.
enum Shutdown {
    Draining { pending: usize, in_flight: usize },
    Exited,
}

impl<T> Engine<T> {
    pub(crate) fn new(id: EngineId, engine_type: String, shared: Weak<Shared<T>>) -> Self {
        Self {
            id,
            engine_type,
            created_at: Utc::now(),
            settings: OnceLock::new(),
            user_data: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: State::Initializing,
                capacity: 0,
                pending: VecDeque::new(),
                in_flight: HashSet::new(),
                next_ticket: 0,
                exit_requested: false,
            }),
            cond: Condvar::new(),
            shared,
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn engine_type(&self) -> &str {
        &self.engine_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Settings chosen by `init`. Defaults until the engine is active.
    pub fn settings(&self) -> EngineSettings {
        self.settings.get().copied().unwrap_or_default()
    }

    pub fn capacity(&self) -> usize {
        self.settings().capacity
    }

    pub fn window_bits(&self) -> u8 {
        self.settings().window_bits
    }

    pub fn req_window_bits(&self) -> u8 {
        self.settings().req_window_bits
    }

    /// Backend state stored by `init`, if it is of type `U`.
    pub fn user_data<U: Any>(&self) -> Option<&U> {
        self.user_data.get()?.downcast_ref::<U>()
    }

    pub fn state(&self) -> State {
        lock(&self.inner).state
    }

    /// Items queued and not yet pulled.
    pub fn pending(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Items pulled and not yet done.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner).in_flight.len()
    }

    pub fn info(&self) -> EngineInfo {
        let settings = self.settings();
        let inner = lock(&self.inner);
        EngineInfo {
            id: self.id,
            engine_type: self.engine_type.clone(),
            state: inner.state,
            capacity: settings.capacity,
            window_bits: settings.window_bits,
            req_window_bits: settings.req_window_bits,
            pending: inner.pending.len(),
            in_flight: inner.in_flight.len(),
            created_at: self.created_at,
        }
    }

    /// Take the next work item.
    ///
    /// A queued item is returned immediately whatever the wait mode. With
    /// nothing queued, an engine that is shutting down returns `Aborted`;
    /// otherwise the call returns `NoneYet` at once (`NonBlocking`) or
    /// waits for an item, an `exit`, or the timeout.
    pub fn pull(&self, mode: Wait) -> Pulled<T> {
        let started = Instant::now();
        let deadline = match mode {
            Wait::Timeout(timeout) => started.checked_add(timeout),
            _ => None,
        };

        let mut inner = lock(&self.inner);
        let pulled = loop {
            if let Some(item) = inner.pending.pop_front() {
                let ticket = inner.issue_ticket();
                debug!(engine = %self.id, %ticket, "item pulled");
                break Pulled::Item(Assignment { ticket, item });
            }
            if inner.state.is_shutting_down() {
                debug!(engine = %self.id, state = %inner.state, "pull aborted");
                break Pulled::Aborted;
            }
            match mode {
                Wait::NonBlocking => break Pulled::NoneYet,
                Wait::Forever => inner = wait(&self.cond, inner),
                Wait::Timeout(_) => match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break Pulled::NoneYet;
                        }
                        inner = wait_timeout(&self.cond, inner, deadline - now).0;
                    }
                    // Timeout too large to represent: wait as if unbounded.
                    None => inner = wait(&self.cond, inner),
                },
            }
        };
        drop(inner);

        let result = match &pulled {
            Pulled::Item(_) => "item",
            Pulled::NoneYet => "none_yet",
            Pulled::Aborted => "aborted",
        };
        metrics::pull_results().add(
            1,
            &[
                KeyValue::new("engine_type", self.engine_type.clone()),
                KeyValue::new("result", result),
            ],
        );
        if mode != Wait::NonBlocking {
            metrics::pull_wait_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("engine_type", self.engine_type.clone())],
            );
        }
        pulled
    }

    /// Release the capacity slot held by `ticket`.
    ///
    /// A ticket that is not in flight on this engine (never issued here, or
    /// already done) is rejected with `Error::NotInFlight` and changes
    /// nothing. Completing the last outstanding item of a draining engine
    /// finishes its exit.
    pub fn done(&self, ticket: Ticket) -> Result<()> {
        let exited = {
            let mut inner = lock(&self.inner);
            if !inner.in_flight.remove(&ticket) {
                drop(inner);
                warn!(engine = %self.id, %ticket, "done called for a ticket not in flight");
                metrics::done_results().add(
                    1,
                    &[
                        KeyValue::new("engine_type", self.engine_type.clone()),
                        KeyValue::new("result", "not_in_flight"),
                    ],
                );
                return Err(Error::NotInFlight {
                    engine: self.id,
                    ticket,
                });
            }
            debug!(engine = %self.id, %ticket, "item done");
            if inner.state == State::Draining && inner.is_drained() {
                inner.state.transition(State::Exited)?;
                true
            } else {
                false
            }
        };

        metrics::done_results().add(
            1,
            &[
                KeyValue::new("engine_type", self.engine_type.clone()),
                KeyValue::new("result", "ok"),
            ],
        );

        if exited {
            self.cond.notify_all();
            self.finish_exit(State::Draining);
        } else {
            self.cond.notify_one();
        }
        Ok(())
    }

    /// Stop accepting work and wake every blocked `pull`.
    ///
    /// Queued items are still handed out; once none remain, `pull` returns
    /// `Aborted`. The engine leaves the registry when nothing is queued or
    /// in flight. Calling `exit` again is a no-op.
    pub fn exit(&self) {
        let outcome = {
            let mut inner = lock(&self.inner);
            let state = inner.state;
            match state {
                State::Initializing => {
                    inner.exit_requested = true;
                    return;
                }
                State::Active => match self.begin_shutdown(&mut inner) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(engine = %self.id, "exit failed: {e}");
                        return;
                    }
                },
                State::Draining | State::Exited => return,
            }
        };

        self.cond.notify_all();
        self.after_shutdown(outcome);
    }

    fn begin_shutdown(&self, inner: &mut Inner<T>) -> Result<Shutdown> {
        if inner.is_drained() {
            inner.state.transition(State::Exited)?;
            Ok(Shutdown::Exited)
        } else {
            inner.state.transition(State::Draining)?;
            Ok(Shutdown::Draining {
                pending: inner.pending.len(),
                in_flight: inner.in_flight.len(),
            })
        }
    }

    fn after_shutdown(&self, outcome: Shutdown) {
        match outcome {
            Shutdown::Exited => self.finish_exit(State::Active),
            Shutdown::Draining { pending, in_flight } => {
                info!(engine = %self.id, engine_type = %self.engine_type, pending, in_flight, "engine draining");
                record_transition(&self.engine_type, State::Active, State::Draining);
                if let Some(shared) = self.shared.upgrade() {
                    shared.events.record(EventKind::EngineDraining {
                        id: self.id,
                        pending,
                        in_flight,
                    });
                }
            }
        }
    }

    fn finish_exit(&self, from: State) {
        info!(engine = %self.id, engine_type = %self.engine_type, "engine exited");
        record_transition(&self.engine_type, from, State::Exited);
        if let Some(shared) = self.shared.upgrade() {
            shared.deregister(self.id, &self.engine_type);
            shared.events.record(EventKind::EngineExited {
                id: self.id,
                engine_type: self.engine_type.clone(),
            });
        }
    }

    /// Queue `item` if this engine is active and has room. Called by the
    /// registry with its lock held; hands the item back otherwise.
    pub(crate) fn try_admit(&self, item: T) -> std::result::Result<(), T> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != State::Active || inner.load() >= inner.capacity {
                return Err(item);
            }
            inner.pending.push_back(item);
            debug!(
                engine = %self.id,
                pending = inner.pending.len(),
                in_flight = inner.in_flight.len(),
                "item queued"
            );
        }
        self.cond.notify_one();
        Ok(())
    }

    /// Complete lazy creation: fix settings, take the first item, go active.
    ///
    /// `settings` must already be validated. On failure the first item is
    /// handed back with the error.
    pub(crate) fn activate(
        &self,
        settings: EngineSettings,
        user_data: Option<UserData>,
        first: T,
        first_in_flight: bool,
    ) -> std::result::Result<Option<Assignment<T>>, (T, Error)> {
        let (assignment, shutdown) = {
            let mut inner = lock(&self.inner);
            if let Err(e) = inner.state.transition(State::Active) {
                return Err((first, e));
            }
            inner.capacity = settings.capacity;
            // Only the Initializing -> Active transition above reaches here,
            // so both cells are still empty.
            let stored = self.settings.set(settings);
            debug_assert!(stored.is_ok());
            if let Some(data) = user_data {
                let stored = self.user_data.set(data);
                debug_assert!(stored.is_ok());
            }

            let assignment = if first_in_flight {
                let ticket = inner.issue_ticket();
                Some(Assignment {
                    ticket,
                    item: first,
                })
            } else {
                inner.pending.push_back(first);
                None
            };

            let shutdown = if inner.exit_requested {
                match self.begin_shutdown(&mut inner) {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        warn!(engine = %self.id, "deferred exit failed: {e}");
                        None
                    }
                }
            } else {
                None
            };
            (assignment, shutdown)
        };

        record_transition(&self.engine_type, State::Initializing, State::Active);
        if let Some(shared) = self.shared.upgrade() {
            shared.events.record(EventKind::EngineActivated {
                id: self.id,
                capacity: settings.capacity,
                window_bits: settings.window_bits,
                req_window_bits: settings.req_window_bits,
            });
        }
        if let Some(outcome) = shutdown {
            self.cond.notify_all();
            self.after_shutdown(outcome);
        } else {
            self.cond.notify_one();
        }
        Ok(assignment)
    }

    /// Drop an engine whose `init` failed. It was never visible to consumers.
    pub(crate) fn discard(&self) {
        let mut inner = lock(&self.inner);
        if inner.state.transition(State::Exited).is_ok() {
            record_transition(&self.engine_type, State::Initializing, State::Exited);
        }
    }
}

impl<T> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("engine_type", &self.engine_type)
            .field("settings", &self.settings())
            .finish_non_exhaustive()
    }
}

fn record_transition(engine_type: &str, from: State, to: State) {
    metrics::engine_transitions().add(
        1,
        &[
            KeyValue::new("engine_type", engine_type.to_string()),
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
