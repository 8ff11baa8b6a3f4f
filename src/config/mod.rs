//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on values that do not parse.
//! Engine profiles (per-type capacity and window sizes) live in TOML files;
//! see [`profile`].

pub mod profile;

pub use profile::{EngineProfile, ProfileSet};

use crate::error::{Error, Result};
use crate::event::DEFAULT_EVENT_CAPACITY;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of engine profile TOML files, if any.
    pub profiles_dir: Option<PathBuf>,
    /// Lifecycle events retained by the registry.
    pub event_capacity: usize,
    /// Wait per `pull` in backend loops. Zero means non-blocking polls.
    pub pull_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            profiles_dir: std::env::var("REQMUX_PROFILES_DIR").ok().map(PathBuf::from),
            event_capacity: parsed_var("REQMUX_EVENT_LOG")?.unwrap_or(DEFAULT_EVENT_CAPACITY),
            pull_timeout: Duration::from_millis(
                parsed_var("REQMUX_PULL_TIMEOUT_MS")?.unwrap_or(100),
            ),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parsed_var<V>(name: &str) -> Result<Option<V>>
where
    V: std::str::FromStr,
    V::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
