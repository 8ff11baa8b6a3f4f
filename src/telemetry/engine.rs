//! Engine span helpers.
//!
//! Provides span creation and state-transition recording for engines
//! driven by a backend processing loop.

use tracing::Span;

use crate::model::{EngineId, State};

/// Start a span covering one engine's processing loop.
///
/// The `engine.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_engine_span(engine_type: &str, id: EngineId) -> Span {
    tracing::info_span!(
        "engine.run",
        "engine.type" = engine_type,
        "engine.id" = %id,
        "engine.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Updates `engine.state` and emits an `info` event scoped to the span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("engine.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
}
