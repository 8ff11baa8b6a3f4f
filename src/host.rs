//! Host environment lookups.
//!
//! The server hosting the registry knows things about each work item that
//! the dispatch core does not: connection-scoped variables and whether the
//! item arrived on a multiplexed session. Frontends consult these to decide
//! which engine type to push to. The core itself never calls them.

use std::collections::HashMap;

/// Name of the per-item variable carrying the stream task id.
pub const TASK_ID_NOTE: &str = "http2-task-id";

/// Contextual lookups supplied by the host for items of type `T`.
pub trait HostEnv<T> {
    /// Value of a named contextual variable for `item`, if set.
    fn lookup(&self, item: &T, name: &str) -> Option<String>;

    /// Whether `item` (or the connection it belongs to) is part of a
    /// multiplexed session.
    fn is_multiplexed(&self, item: &T) -> bool;
}

/// Map-backed environment keyed by an item's own key.
///
/// Items are identified through `key`, so one `MapEnv` can serve any item
/// type that can name itself.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, HashMap<String, String>>,
    multiplexed: HashMap<String, bool>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable for the item with key `item_key`.
    pub fn set(
        &mut self,
        item_key: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.vars
            .entry(item_key.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub fn set_multiplexed(&mut self, item_key: impl Into<String>, multiplexed: bool) -> &mut Self {
        self.multiplexed.insert(item_key.into(), multiplexed);
        self
    }
}

/// Items that can be looked up in a [`MapEnv`].
pub trait ItemKey {
    fn item_key(&self) -> &str;
}

impl ItemKey for String {
    fn item_key(&self) -> &str {
        self
    }
}

impl<T: ItemKey> HostEnv<T> for MapEnv {
    fn lookup(&self, item: &T, name: &str) -> Option<String> {
        self.vars.get(item.item_key())?.get(name).cloned()
    }

    fn is_multiplexed(&self, item: &T) -> bool {
        self.multiplexed
            .get(item.item_key())
            .copied()
            .unwrap_or(false)
    }
}

/// Pick an engine type for `item` from the host variable `name`, falling
/// back to `default` when it is unset or the item is not multiplexed.
pub fn engine_type_for<T, E>(env: &E, item: &T, name: &str, default: &str) -> String
where
    E: HostEnv<T> + ?Sized,
{
    if !env.is_multiplexed(item) {
        return default.to_string();
    }
    env.lookup(item, name)
        .unwrap_or_else(|| default.to_string())
}
