//! Engine registry: the producer half of the dispatch protocol.
//!
//! Maps engine type names to the live engines of that type. `push` scans
//! those engines under a single registry-wide lock and queues the item on
//! the first active engine with room. When none has room and the caller
//! supplied an `init` callback, a new engine is registered, the lock is
//! released, and `init` runs synchronously on the caller's thread. The
//! caller then owns the job of driving that engine.

use opentelemetry::KeyValue;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::engine::{Assignment, Engine, EngineInfo, UserData};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventLog};
use crate::model::{EngineId, EngineSettings};
use crate::sync::lock;
use crate::telemetry::metrics;

/// Engine ids are drawn from one counter so they never repeat within a
/// process, even across registries.
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between a registry and the engines it created.
pub(crate) struct Shared<T> {
    engines: Mutex<HashMap<String, Vec<Arc<Engine<T>>>>>,
    pub(crate) events: EventLog,
}

impl<T> Shared<T> {
    /// Forget an engine. Engines call this once they have fully exited.
    pub(crate) fn deregister(&self, id: EngineId, engine_type: &str) {
        let mut engines = lock(&self.engines);
        if let Some(list) = engines.get_mut(engine_type) {
            list.retain(|e| e.id() != id);
            if list.is_empty() {
                engines.remove(engine_type);
            }
        }
    }
}

/// What happened when work was pushed.
#[derive(Debug)]
pub enum Admitted<T> {
    /// Queued on an existing engine; its backend will pull it.
    Queued { engine: EngineId },
    /// A new engine was created for the item. The caller must drive it.
    ///
    /// `first` holds the pushed item when `init` chose to start it in
    /// flight; otherwise the item is waiting in the engine's queue.
    Created {
        engine: Arc<Engine<T>>,
        first: Option<Assignment<T>>,
    },
}

impl<T> Admitted<T> {
    pub fn engine_id(&self) -> EngineId {
        match self {
            Admitted::Queued { engine } => *engine,
            Admitted::Created { engine, .. } => engine.id(),
        }
    }
}

/// Why a push did not admit its item. The item is always handed back.
#[derive(Debug)]
pub enum Rejected<T> {
    /// Backpressure: no engine of the type had room and no `init` was given.
    NoCapacity(T),
    /// A new engine was needed but `init` failed. The engine was discarded.
    InitFailed { item: T, error: Error },
}

impl<T> Rejected<T> {
    pub fn is_no_capacity(&self) -> bool {
        matches!(self, Rejected::NoCapacity(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Rejected::NoCapacity(_) => None,
            Rejected::InitFailed { error, .. } => Some(error),
        }
    }

    pub fn into_item(self) -> T {
        match self {
            Rejected::NoCapacity(item) | Rejected::InitFailed { item, .. } => item,
        }
    }
}

/// Configuration surface handed to an `init` callback.
///
/// The engine already has its id and type. `init` sets capacity (required,
/// non-zero), window sizes, and user data, and decides whether the pushed
/// item goes into the engine's queue (the default) or starts in flight.
pub struct EngineSetup<'a, T> {
    engine: &'a Engine<T>,
    settings: EngineSettings,
    user_data: Option<UserData>,
    item: T,
    first_in_flight: bool,
}

impl<'a, T> EngineSetup<'a, T> {
    fn new(engine: &'a Engine<T>, item: T) -> Self {
        Self {
            engine,
            settings: EngineSettings::default(),
            user_data: None,
            item,
            first_in_flight: false,
        }
    }

    pub fn id(&self) -> EngineId {
        self.engine.id()
    }

    pub fn engine_type(&self) -> &str {
        self.engine.engine_type()
    }

    /// The item whose push triggered this engine's creation.
    pub fn item(&self) -> &T {
        &self.item
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: EngineSettings) -> &mut Self {
        self.settings = settings;
        self
    }

    pub fn set_capacity(&mut self, capacity: usize) -> &mut Self {
        self.settings.capacity = capacity;
        self
    }

    pub fn set_window_bits(&mut self, bits: u8) -> &mut Self {
        self.settings.window_bits = bits;
        self
    }

    pub fn set_req_window_bits(&mut self, bits: u8) -> &mut Self {
        self.settings.req_window_bits = bits;
        self
    }

    pub fn set_user_data<U: Any + Send + Sync>(&mut self, data: U) -> &mut Self {
        self.user_data = Some(Box::new(data));
        self
    }

    /// Treat the pushed item as already pulled. It comes back to the pusher
    /// in `Admitted::Created::first` with a ticket for `done`.
    pub fn start_in_flight(&mut self) -> &mut Self {
        self.first_in_flight = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.settings.capacity == 0 {
            return Err(Error::ZeroCapacity {
                engine: self.engine.id(),
                engine_type: self.engine.engine_type().to_string(),
            });
        }
        self.settings.validate_windows()
    }
}

type NoInit<T> = fn(&mut EngineSetup<'_, T>) -> Result<()>;

/// Process-wide directory of engines, keyed by type.
///
/// Cloning is cheap; clones share the same engines.
pub struct Registry<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::with_event_log(EventLog::default())
    }
}

impl<T> Registry<T> {
    /// An empty registry with the default event log.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty registry retaining at most `capacity` lifecycle events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self::with_event_log(EventLog::new(capacity))
    }

    fn with_event_log(events: EventLog) -> Self {
        Self {
            shared: Arc::new(Shared {
                engines: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Queue `item` on an active engine of `engine_type` with room.
    ///
    /// Never blocks and never creates an engine: with no room anywhere the
    /// item comes back as `Rejected::NoCapacity`.
    pub fn push(&self, engine_type: &str, item: T) -> std::result::Result<Admitted<T>, Rejected<T>> {
        self.admit(engine_type, item, None::<NoInit<T>>)
    }

    /// Like [`push`](Self::push), but when no engine has room a new one is
    /// created and configured by `init` before this call returns. The
    /// caller receives the engine in `Admitted::Created` and must run its
    /// processing loop.
    pub fn push_or_init<F>(
        &self,
        engine_type: &str,
        item: T,
        init: F,
    ) -> std::result::Result<Admitted<T>, Rejected<T>>
    where
        F: FnOnce(&mut EngineSetup<'_, T>) -> Result<()>,
    {
        self.admit(engine_type, item, Some(init))
    }

    fn admit<F>(
        &self,
        engine_type: &str,
        item: T,
        init: Option<F>,
    ) -> std::result::Result<Admitted<T>, Rejected<T>>
    where
        F: FnOnce(&mut EngineSetup<'_, T>) -> Result<()>,
    {
        let mut item = item;
        let (engine, init) = {
            let mut engines = lock(&self.shared.engines);
            if let Some(list) = engines.get(engine_type) {
                for engine in list {
                    match engine.try_admit(item) {
                        Ok(()) => {
                            let id = engine.id();
                            drop(engines);
                            record_push(engine_type, "queued");
                            return Ok(Admitted::Queued { engine: id });
                        }
                        Err(back) => item = back,
                    }
                }
            }

            let Some(init) = init else {
                drop(engines);
                debug!(engine_type, "no engine with capacity");
                record_push(engine_type, "no_capacity");
                self.shared.events.record(EventKind::PushRejected {
                    engine_type: engine_type.to_string(),
                });
                return Err(Rejected::NoCapacity(item));
            };

            let id = EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed));
            let engine = Arc::new(Engine::new(
                id,
                engine_type.to_string(),
                Arc::downgrade(&self.shared),
            ));
            engines
                .entry(engine_type.to_string())
                .or_default()
                .push(Arc::clone(&engine));
            (engine, init)
        };

        info!(engine = %engine.id(), engine_type, "engine created");
        self.shared.events.record(EventKind::EngineCreated {
            id: engine.id(),
            engine_type: engine_type.to_string(),
        });

        let unwind = UnwindGuard {
            shared: self.shared.as_ref(),
            engine: engine.as_ref(),
            armed: true,
        };
        let mut setup = EngineSetup::new(&engine, item);
        let outcome = init(&mut setup).and_then(|()| setup.validate());
        unwind.disarm();
        let EngineSetup {
            settings,
            user_data,
            item,
            first_in_flight,
            ..
        } = setup;
        if let Err(error) = outcome {
            return Err(self.abandon(&engine, item, error));
        }

        match engine.activate(settings, user_data, item, first_in_flight) {
            Ok(first) => {
                info!(
                    engine = %engine.id(),
                    engine_type,
                    capacity = settings.capacity,
                    window_bits = settings.window_bits,
                    req_window_bits = settings.req_window_bits,
                    "engine active"
                );
                record_push(engine_type, "created");
                Ok(Admitted::Created { engine, first })
            }
            Err((item, error)) => Err(self.abandon(&engine, item, error)),
        }
    }

    fn abandon(&self, engine: &Engine<T>, item: T, error: Error) -> Rejected<T> {
        warn!(engine = %engine.id(), engine_type = %engine.engine_type(), "engine init failed: {error}");
        engine.discard();
        self.shared.deregister(engine.id(), engine.engine_type());
        self.shared.events.record(EventKind::EngineInitFailed {
            id: engine.id(),
            engine_type: engine.engine_type().to_string(),
            error: error.to_string(),
        });
        record_push(engine.engine_type(), "init_failed");
        Rejected::InitFailed { item, error }
    }

    /// Live engines of one type, in registration order.
    pub fn engines(&self, engine_type: &str) -> Vec<Arc<Engine<T>>> {
        lock(&self.shared.engines)
            .get(engine_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a live engine by id.
    pub fn get(&self, id: EngineId) -> Option<Arc<Engine<T>>> {
        lock(&self.shared.engines)
            .values()
            .flatten()
            .find(|e| e.id() == id)
            .cloned()
    }

    /// Engine types with at least one live engine, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = lock(&self.shared.engines).keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of live engines across all types.
    pub fn len(&self) -> usize {
        lock(&self.shared.engines).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every live engine, ordered by id.
    pub fn snapshot(&self) -> Vec<EngineInfo> {
        let mut infos: Vec<EngineInfo> = self.all().iter().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Ask every live engine to exit. Engines leave the registry as they
    /// drain.
    pub fn shutdown(&self) {
        let engines = self.all();
        info!(engines = engines.len(), "shutting down all engines");
        for engine in engines {
            engine.exit();
        }
    }

    /// Retained lifecycle events with a sequence number above `since_seq`.
    pub fn events_since(&self, since_seq: u64) -> Vec<Event> {
        self.shared.events.since(since_seq)
    }

    /// Sequence number of the latest lifecycle event.
    pub fn last_event_seq(&self) -> u64 {
        self.shared.events.last_seq()
    }

    fn all(&self) -> Vec<Arc<Engine<T>>> {
        lock(&self.shared.engines)
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

fn record_push(engine_type: &str, result: &'static str) {
    metrics::push_results().add(
        1,
        &[
            KeyValue::new("engine_type", engine_type.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

/// Discards an engine whose `init` panicked, so it does not stay registered
/// in `Initializing` forever.
struct UnwindGuard<'a, T> {
    shared: &'a Shared<T>,
    engine: &'a Engine<T>,
    armed: bool,
}

impl<T> UnwindGuard<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for UnwindGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let engine = self.engine;
        warn!(engine = %engine.id(), engine_type = %engine.engine_type(), "engine init panicked");
        engine.discard();
        self.shared.deregister(engine.id(), engine.engine_type());
        self.shared.events.record(EventKind::EngineInitFailed {
            id: engine.id(),
            engine_type: engine.engine_type().to_string(),
            error: "init panicked".to_string(),
        });
        record_push(engine.engine_type(), "init_failed");
    }
}
