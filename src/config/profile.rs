//! Engine profiles: per-type settings applied when an engine is created.
//!
//! Each profile is a TOML file with a single `[engine]` table:
//!
//! ```toml
//! [engine]
//! type = "proxy"
//! capacity = 8
//! window_bits = 20
//! req_window_bits = 16
//! ```

use crate::error::{Error, Result};
use crate::model::{DEFAULT_REQ_WINDOW_BITS, DEFAULT_WINDOW_BITS, EngineSettings};
use crate::registry::EngineSetup;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ProfileFile {
    engine: EngineProfile,
}

/// Settings for engines of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProfile {
    #[serde(rename = "type")]
    pub engine_type: String,
    pub capacity: usize,
    #[serde(default = "default_window_bits")]
    pub window_bits: u8,
    #[serde(default = "default_req_window_bits")]
    pub req_window_bits: u8,
    /// Backend loops exit their engine after this many empty polls.
    #[serde(default)]
    pub max_idle_polls: Option<u32>,
}

fn default_window_bits() -> u8 {
    DEFAULT_WINDOW_BITS
}

fn default_req_window_bits() -> u8 {
    DEFAULT_REQ_WINDOW_BITS
}

impl EngineProfile {
    pub fn new(engine_type: impl Into<String>, capacity: usize) -> Self {
        Self {
            engine_type: engine_type.into(),
            capacity,
            window_bits: DEFAULT_WINDOW_BITS,
            req_window_bits: DEFAULT_REQ_WINDOW_BITS,
            max_idle_polls: None,
        }
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            capacity: self.capacity,
            window_bits: self.window_bits,
            req_window_bits: self.req_window_bits,
        }
    }

    /// Configure a new engine from this profile.
    pub fn apply<T>(&self, setup: &mut EngineSetup<'_, T>) {
        setup.set_settings(self.settings());
    }

    fn validate(&self) -> Result<()> {
        if self.engine_type.is_empty() {
            return Err(Error::Config("engine profile has an empty type".to_string()));
        }
        if self.capacity == 0 {
            return Err(Error::Config(format!(
                "engine profile {}: capacity must be at least 1",
                self.engine_type
            )));
        }
        self.settings()
            .validate_windows()
            .map_err(|e| Error::Config(format!("engine profile {}: {e}", self.engine_type)))
    }
}

/// Loaded profiles, indexed by engine type.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: HashMap<String, EngineProfile>,
}

impl ProfileSet {
    /// Create an empty set with no profiles.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse one profile file's contents.
    pub fn parse_profile(content: &str) -> Result<EngineProfile> {
        let file: ProfileFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad engine profile: {e}")))?;
        file.engine.validate()?;
        Ok(file.engine)
    }

    /// Load all `.toml` files from a directory. A later file for the same
    /// type is an error rather than a silent override.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read profile dir {}: {e}", dir.display()))
        })?;

        let mut set = Self::empty();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let profile = Self::parse_profile(&content)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                set.insert(profile)?;
            }
        }

        Ok(set)
    }

    /// Add a profile. Fails if one for the same type already exists.
    pub fn insert(&mut self, profile: EngineProfile) -> Result<()> {
        profile.validate()?;
        if self.profiles.contains_key(&profile.engine_type) {
            return Err(Error::Config(format!(
                "duplicate engine profile for type {}",
                profile.engine_type
            )));
        }
        self.profiles.insert(profile.engine_type.clone(), profile);
        Ok(())
    }

    /// Look up a profile by engine type.
    pub fn get(&self, engine_type: &str) -> Option<&EngineProfile> {
        self.profiles.get(engine_type)
    }

    /// All profiles, sorted by type.
    pub fn profiles(&self) -> Vec<&EngineProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.engine_type.cmp(&b.engine_type));
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
