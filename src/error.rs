//! Error types for reqmux.

use thiserror::Error;

use crate::model::{EngineId, State, Ticket};

#[derive(Debug, Error)]
pub enum Error {
    #[error("ticket {ticket} is not in flight on engine {engine}")]
    NotInFlight { engine: EngineId, ticket: Ticket },

    #[error("engine {engine} of type {engine_type} was initialized with zero capacity")]
    ZeroCapacity {
        engine: EngineId,
        engine_type: String,
    },

    #[error("invalid {name}: {bits} (must be at most {max})")]
    InvalidWindow {
        name: &'static str,
        bits: u8,
        max: u8,
    },

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: State, to: State },

    #[error("engine init failed: {0}")]
    Init(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
