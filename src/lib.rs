//! # reqmux
//!
//! Engine registry and push/pull dispatch for multiplexed request workers.
//!
//! A frontend that discovers requests on a shared connection pushes each
//! one to a named engine type. The [`Registry`] queues it on a live engine
//! with spare capacity, or lazily creates one whose caller then drives it.
//! Backends pull items from their engine, process them, and report each
//! one done; `exit` shuts an engine down and wakes its blocked consumers.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod host;
pub mod model;
pub mod registry;
pub mod telemetry;
pub mod worker;

mod sync;

pub use engine::{Assignment, Engine, EngineInfo, Pulled};
pub use error::{Error, Result};
pub use model::{EngineId, EngineSettings, State, Ticket, Wait};
pub use registry::{Admitted, EngineSetup, Registry, Rejected};
pub use worker::{Backend, LoopConfig, LoopStats, run_engine};
