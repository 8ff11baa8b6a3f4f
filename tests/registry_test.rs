//! Integration tests for admission and lazy engine creation.

use reqmux::error::Error;
use reqmux::event::EventKind;
use reqmux::{Admitted, Engine, Pulled, Registry, Rejected, State, Wait};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type Item = &'static str;

/// Create an engine of `engine_type` whose first item is queued.
fn create_engine(registry: &Registry<Item>, engine_type: &str, capacity: usize, first: Item) -> Arc<Engine<Item>> {
    match registry.push_or_init(engine_type, first, |setup| {
        setup.set_capacity(capacity);
        Ok(())
    }) {
        Ok(Admitted::Created { engine, first: None }) => engine,
        other => panic!("expected Created with a queued first item, got {other:?}"),
    }
}

fn pull_now(engine: &Engine<Item>) -> Item {
    match engine.pull(Wait::NonBlocking) {
        Pulled::Item(assignment) => {
            let (ticket, item) = assignment.into_parts();
            engine.done(ticket).expect("ticket should be in flight");
            item
        }
        other => panic!("expected an item, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[test]
fn push_without_engine_or_init_returns_no_capacity() {
    let registry: Registry<Item> = Registry::new();

    let result = registry.push("worker", "A");

    match result {
        Err(Rejected::NoCapacity(item)) => assert_eq!(item, "A"),
        other => panic!("expected NoCapacity, got {other:?}"),
    }
    assert!(registry.is_empty());
    assert!(registry.types().is_empty());
    assert!(registry.snapshot().is_empty());
}

#[test]
fn capacity_two_admits_two_then_backs_off_until_done() {
    let registry: Registry<Item> = Registry::new();
    let engine = create_engine(&registry, "worker", 2, "A");

    let b = registry.push("worker", "B").unwrap();
    assert_eq!(b.engine_id(), engine.id());

    let c = registry.push("worker", "C");
    assert!(matches!(c, Err(Rejected::NoCapacity("C"))));

    let a = engine.pull(Wait::NonBlocking).into_assignment().unwrap();
    assert_eq!(a.item, "A");
    let b = engine.pull(Wait::NonBlocking).into_assignment().unwrap();
    assert_eq!(b.item, "B");

    // Both still in flight: no room yet.
    assert!(registry.push("worker", "C").unwrap_err().is_no_capacity());

    engine.done(a.ticket).unwrap();
    let admitted = registry.push("worker", "C").unwrap();
    assert!(matches!(admitted, Admitted::Queued { engine: id } if id == engine.id()));
    assert_eq!(engine.pending(), 1);
    assert_eq!(engine.in_flight(), 1);
}

#[test]
fn pushes_are_grouped_by_type() {
    let registry: Registry<Item> = Registry::new();
    create_engine(&registry, "proxy", 4, "p1");

    assert!(registry.push("fcgi", "f1").unwrap_err().is_no_capacity());
    assert!(registry.push("proxy", "p2").is_ok());
    assert_eq!(registry.types(), vec!["proxy".to_string()]);
}

// ---------------------------------------------------------------------------
// Lazy creation
// ---------------------------------------------------------------------------

#[test]
fn init_creates_exactly_one_active_engine() {
    let registry: Registry<Item> = Registry::new();

    let engine = create_engine(&registry, "worker", 3, "A");

    assert_eq!(registry.len(), 1);
    assert_eq!(engine.state(), State::Active);
    assert_eq!(engine.engine_type(), "worker");
    assert_eq!(engine.capacity(), 3);
    assert_eq!(engine.pending(), 1);
    assert_eq!(pull_now(&engine), "A");
}

#[test]
fn init_can_start_first_item_in_flight() {
    let registry: Registry<Item> = Registry::new();

    let admitted = registry
        .push_or_init("worker", "A", |setup| {
            assert_eq!(*setup.item(), "A");
            setup.set_capacity(1).start_in_flight();
            Ok(())
        })
        .unwrap();

    let Admitted::Created { engine, first: Some(first) } = admitted else {
        panic!("expected Created with an in-flight first item");
    };
    assert_eq!(first.item, "A");
    assert_eq!(engine.pending(), 0);
    assert_eq!(engine.in_flight(), 1);
    assert!(registry.push("worker", "B").unwrap_err().is_no_capacity());

    engine.done(first.ticket).unwrap();
    assert!(registry.push("worker", "B").is_ok());
}

#[test]
fn init_sets_windows_and_user_data() {
    struct Backend {
        name: &'static str,
    }

    let registry: Registry<Item> = Registry::new();
    let Admitted::Created { engine, .. } = registry
        .push_or_init("proxy", "A", |setup| {
            setup
                .set_capacity(8)
                .set_window_bits(22)
                .set_req_window_bits(15)
                .set_user_data(Backend { name: "upstream-1" });
            Ok(())
        })
        .unwrap()
    else {
        panic!("expected Created");
    };

    assert_eq!(engine.window_bits(), 22);
    assert_eq!(engine.req_window_bits(), 15);
    assert_eq!(engine.settings().req_window_bytes(), 32 * 1024);
    assert_eq!(engine.user_data::<Backend>().map(|b| b.name), Some("upstream-1"));
    assert!(engine.user_data::<String>().is_none());
}

#[test]
fn engine_ids_are_unique() {
    let registry: Registry<Item> = Registry::new();
    let first = create_engine(&registry, "worker", 1, "A");
    let second = create_engine(&registry, "worker", 1, "B");
    let other = create_engine(&registry, "proxy", 1, "C");

    assert_ne!(first.id(), second.id());
    assert_ne!(second.id(), other.id());
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.engines("worker").len(), 2);
}

#[test]
fn engine_ids_do_not_repeat_across_registries() {
    let a: Registry<Item> = Registry::new();
    let b: Registry<Item> = Registry::new();

    let from_a = create_engine(&a, "worker", 1, "A");
    let from_b = create_engine(&b, "worker", 1, "B");

    assert_ne!(from_a.id(), from_b.id());
    assert!(b.get(from_a.id()).is_none());
}

#[test]
fn first_engine_with_room_wins() {
    let registry: Registry<Item> = Registry::new();
    let first = create_engine(&registry, "worker", 1, "A");
    let second = create_engine(&registry, "worker", 1, "B");

    // Only the second engine has room after its item completes.
    assert_eq!(pull_now(&second), "B");
    let c = registry.push("worker", "C").unwrap();
    assert_eq!(c.engine_id(), second.id());

    // Both have room: registration order decides.
    assert_eq!(pull_now(&first), "A");
    assert_eq!(pull_now(&second), "C");
    let d = registry.push("worker", "D").unwrap();
    assert_eq!(d.engine_id(), first.id());
}

#[test]
fn failed_init_hands_item_back_and_discards_engine() {
    let registry: Registry<Item> = Registry::new();

    let result = registry.push_or_init("worker", "A", |_| Err(Error::Init("backend unavailable".into())));

    let rejected = result.unwrap_err();
    assert!(!rejected.is_no_capacity());
    assert!(matches!(rejected.error(), Some(Error::Init(_))));
    assert_eq!(rejected.into_item(), "A");
    assert!(registry.is_empty());
}

#[test]
fn panicking_init_leaves_no_engine_behind() {
    let registry: Registry<Item> = Registry::with_event_capacity(16);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        registry.push_or_init("worker", "A", |_| panic!("backend exploded"))
    }));
    assert!(result.is_err());

    assert!(registry.is_empty());
    assert!(registry.types().is_empty());
    assert!(registry.snapshot().is_empty());
    assert!(matches!(
        registry.events_since(0).last().map(|e| &e.kind),
        Some(EventKind::EngineInitFailed { .. })
    ));

    // The type is usable again afterwards.
    let engine = create_engine(&registry, "worker", 1, "B");
    assert_eq!(engine.state(), State::Active);
    assert_eq!(registry.len(), 1);
}

#[test]
fn zero_capacity_is_an_init_failure() {
    let registry: Registry<Item> = Registry::new();

    let result = registry.push_or_init("worker", "A", |_| Ok(()));

    match result {
        Err(Rejected::InitFailed { item, error }) => {
            assert_eq!(item, "A");
            assert!(matches!(error, Error::ZeroCapacity { .. }));
        }
        other => panic!("expected InitFailed, got {other:?}"),
    }
    assert!(registry.is_empty());
}

#[test]
fn oversized_window_is_an_init_failure() {
    let registry: Registry<Item> = Registry::new();

    let result = registry.push_or_init("worker", "A", |setup| {
        setup.set_capacity(1).set_window_bits(40);
        Ok(())
    });

    let rejected = result.unwrap_err();
    assert!(matches!(
        rejected.error(),
        Some(Error::InvalidWindow { name: "window_bits", bits: 40, .. })
    ));
    assert!(registry.is_empty());
}

#[test]
fn init_failure_leaves_other_engines_alone() {
    let registry: Registry<Item> = Registry::new();
    let engine = create_engine(&registry, "worker", 1, "A");

    let result = registry.push_or_init("worker", "B", |_| Err(Error::Init("nope".into())));

    assert!(result.is_err());
    assert_eq!(registry.len(), 1);
    assert_eq!(engine.state(), State::Active);
    assert_eq!(pull_now(&engine), "A");
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[test]
fn exited_engine_is_never_selected() {
    let registry: Registry<Item> = Registry::new();
    let engine = create_engine(&registry, "worker", 4, "A");
    assert_eq!(pull_now(&engine), "A");

    engine.exit();

    assert_eq!(engine.state(), State::Exited);
    assert!(registry.is_empty());
    assert!(registry.push("worker", "B").unwrap_err().is_no_capacity());
}

#[test]
fn shutdown_exits_every_engine() {
    let registry: Registry<Item> = Registry::new();
    let a = create_engine(&registry, "proxy", 2, "A");
    let b = create_engine(&registry, "fcgi", 2, "B");
    assert_eq!(pull_now(&a), "A");

    registry.shutdown();

    assert_eq!(a.state(), State::Exited);
    // Still has a queued item to hand out.
    assert_eq!(b.state(), State::Draining);
    assert_eq!(registry.len(), 1);
    assert_eq!(pull_now(&b), "B");
    assert!(b.pull(Wait::NonBlocking).is_aborted());
    assert!(registry.is_empty());
}

#[test]
fn exit_during_init_takes_effect_on_activation() {
    let registry: Registry<Item> = Registry::new();
    let supervisor = registry.clone();

    let admitted = registry
        .push_or_init("worker", "A", |setup| {
            supervisor.shutdown();
            setup.set_capacity(2);
            Ok(())
        })
        .unwrap();

    let Admitted::Created { engine, .. } = admitted else {
        panic!("expected Created");
    };
    assert_eq!(engine.state(), State::Draining);
    assert!(registry.push("worker", "B").unwrap_err().is_no_capacity());
    assert_eq!(pull_now(&engine), "A");
    assert!(engine.pull(Wait::NonBlocking).is_aborted());
    assert_eq!(engine.state(), State::Exited);
}

// ---------------------------------------------------------------------------
// Snapshot and events
// ---------------------------------------------------------------------------

#[test]
fn snapshot_reports_engine_load() {
    let registry: Registry<Item> = Registry::new();
    let engine = create_engine(&registry, "worker", 3, "A");
    registry.push("worker", "B").unwrap();
    let _a = engine.pull(Wait::NonBlocking).into_assignment().unwrap();

    let snapshot = registry.snapshot();

    assert_eq!(snapshot.len(), 1);
    let info = &snapshot[0];
    assert_eq!(info.id, engine.id());
    assert_eq!(info.state, State::Active);
    assert_eq!(info.capacity, 3);
    assert_eq!(info.pending, 1);
    assert_eq!(info.in_flight, 1);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json[0]["state"], "active");
}

#[test]
fn lifecycle_is_recorded_as_events() {
    let registry: Registry<Item> = Registry::new();
    let engine = create_engine(&registry, "worker", 1, "A");
    assert!(registry.push("worker", "B").is_err());
    let a = engine.pull(Wait::NonBlocking).into_assignment().unwrap();
    engine.exit();
    engine.done(a.ticket).unwrap();

    let kinds: Vec<EventKind> = registry.events_since(0).into_iter().map(|e| e.kind).collect();

    let id = engine.id();
    assert_eq!(
        kinds,
        vec![
            EventKind::EngineCreated {
                id,
                engine_type: "worker".to_string()
            },
            EventKind::EngineActivated {
                id,
                capacity: 1,
                window_bits: reqmux::model::DEFAULT_WINDOW_BITS,
                req_window_bits: reqmux::model::DEFAULT_REQ_WINDOW_BITS,
            },
            EventKind::PushRejected {
                engine_type: "worker".to_string()
            },
            EventKind::EngineDraining {
                id,
                pending: 0,
                in_flight: 1
            },
            EventKind::EngineExited {
                id,
                engine_type: "worker".to_string()
            },
        ]
    );
    assert_eq!(registry.last_event_seq(), 5);
    assert_eq!(registry.events_since(4).len(), 1);
}

#[test]
fn failed_init_is_recorded() {
    let registry: Registry<Item> = Registry::with_event_capacity(16);
    let _ = registry.push_or_init("worker", "A", |_| Err(Error::Init("boom".into())));

    let events = registry.events_since(0);

    assert_eq!(events.len(), 2);
    match &events[1].kind {
        EventKind::EngineInitFailed { engine_type, error, .. } => {
            assert_eq!(engine_type, "worker");
            assert!(error.contains("boom"));
        }
        other => panic!("expected EngineInitFailed, got {other:?}"),
    }
}
