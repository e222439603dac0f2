//! # Features
//!
//! Named switches shared by the host and the page. The host decides which
//! are requested. The core script is preprocessed with them, and after
//! summoning the page reports which it actually enabled.
//!
//! Built-in names are listed in [`BUILTIN`]. User-defined names must start
//! with `_` so they never collide with future built-ins.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use enhjson::Value;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

pub const CORE_FEATURES: &str = "core_features";
pub const STRICT_FEATURE_LIST: &str = "strict_feature_list";
pub const VERBOSE_MACROS: &str = "verbose_macros";
pub const FRIENDLY_OBJ_NAMES: &str = "friendly_obj_names";
pub const SAFE_DUNDERS: &str = "safe_dunders";
pub const GARBAGE_COLLECTION: &str = "garbage_collection";

/// Built-in features and their default state.
pub const BUILTIN: [(&str, bool); 6] = [
    (CORE_FEATURES, true),
    (STRICT_FEATURE_LIST, false),
    (VERBOSE_MACROS, false),
    (FRIENDLY_OBJ_NAMES, false),
    (SAFE_DUNDERS, true),
    (GARBAGE_COLLECTION, true),
];

/// Feature states keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features {
    states: BTreeMap<String, bool>,
}

impl Default for Features {
    fn default() -> Self {
        Self { states: BUILTIN.iter().map(|(n, on)| (n.to_string(), *on)).collect() }
    }
}

impl Features {
    /// No feature known, nothing enabled.
    pub fn empty() -> Self {
        Self { states: BTreeMap::new() }
    }

    /// Sets `name` to `on`. Unknown names must start with `_`.
    pub fn set(&mut self, name: &str, on: bool) -> Result<()> {
        validate_name(name)?;
        self.states.insert(name.to_string(), on);
        Ok(())
    }

    pub fn with(mut self, name: &str, on: bool) -> Result<Self> {
        self.set(name, on)?;
        Ok(self)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.states.get(name).copied().unwrap_or(false)
    }

    /// Names switched on, sorted.
    pub fn enabled(&self) -> BTreeSet<String> {
        self.states.iter().filter(|(_, on)| **on).map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.states.iter().map(|(n, on)| (n.as_str(), *on))
    }

    /// Reads the `{name: bool}` object returned by `*features*`.
    ///
    /// Names are taken as reported; the page is the authority here.
    pub fn from_reported(value: &Value) -> Result<Self> {
        let entries = value
            .as_object()
            .ok_or_else(|| Error::Protocol("`*features*` did not return an object".into()))?;
        let states = entries
            .iter()
            .map(|(name, v)| (name.clone(), v.as_bool().unwrap_or_else(|| v.as_i64().is_some_and(|i| i != 0))))
            .collect();
        Ok(Self { states })
    }

    /// Features on in both sets. Names known to either side are kept.
    pub fn intersect(&self, other: &Features) -> Features {
        let names = self.states.keys().chain(other.states.keys());
        let states = names.map(|n| (n.clone(), self.is_enabled(n) && other.is_enabled(n))).collect();
        Self { states }
    }

    /// The `{name: bool}` object handed to the page.
    pub fn to_value(&self) -> Value {
        Value::Object(self.states.iter().map(|(n, on)| (n.clone(), Value::Bool(*on))).collect())
    }

    /// The same object as JSON text, for splicing into scripts.
    pub fn to_json(&self) -> String {
        enhjson::encode(&self.to_value())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if BUILTIN.iter().any(|(n, _)| *n == name) || (name.len() > 1 && name.starts_with('_')) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("user defined feature names must begin with `_`, got `{}`", name)))
    }
}
