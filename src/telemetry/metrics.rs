//! Metric instrument factories for reqmux.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"reqmux"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for reqmux instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("reqmux")
}

/// Counter: push attempts.
/// Labels: `engine_type`, `result` ("queued" | "created" | "no_capacity" | "init_failed").
pub fn push_results() -> Counter<u64> {
    meter()
        .u64_counter("reqmux.push")
        .with_description("Number of work items pushed, by admission result")
        .build()
}

/// Counter: engine lifecycle transitions.
/// Labels: `engine_type`, `from`, `to`.
pub fn engine_transitions() -> Counter<u64> {
    meter()
        .u64_counter("reqmux.engines")
        .with_description("Number of engine state transitions")
        .build()
}

/// Counter: pull outcomes.
/// Labels: `engine_type`, `result` ("item" | "none_yet" | "aborted").
pub fn pull_results() -> Counter<u64> {
    meter()
        .u64_counter("reqmux.pull")
        .with_description("Number of pull calls, by outcome")
        .build()
}

/// Counter: completed work items.
/// Labels: `engine_type`, `result` ("ok" | "not_in_flight").
pub fn done_results() -> Counter<u64> {
    meter()
        .u64_counter("reqmux.done")
        .with_description("Number of done calls, by outcome")
        .build()
}

/// Histogram: time a pull spent waiting, in milliseconds.
/// Labels: `engine_type`.
pub fn pull_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("reqmux.pull.wait_ms")
        .with_description("Time spent blocked in pull")
        .with_unit("ms")
        .build()
}
