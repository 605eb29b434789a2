//! Bundle: typed key-value payload carried across the IPC boundary.
//!
//! A bundle is the only payload format that leaves a process. Values are
//! tagged with their type so that a decoder can reject a payload produced
//! by an incompatible peer instead of silently coercing it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single typed value stored in a [`Bundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BundleValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
    StrList(Vec<String>),
    LongList(Vec<i64>),
}

impl BundleValue {
    fn type_name(&self) -> &'static str {
        match self {
            BundleValue::Bool(_) => "bool",
            BundleValue::Int(_) => "int",
            BundleValue::Long(_) => "long",
            BundleValue::Str(_) => "string",
            BundleValue::StrList(_) => "string list",
            BundleValue::LongList(_) => "long list",
        }
    }
}

/// Bundle decoding errors
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Missing bundle key: {0}")]
    Missing(String),

    #[error("Bundle key {key} holds a {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid value for bundle key {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Bundle serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// String-keyed map of typed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    entries: BTreeMap<String, BundleValue>,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        pub fn $name(&self, key: &str) -> Result<$ty, BundleError> {
            match self.entries.get(key) {
                Some(BundleValue::$variant(v)) => Ok(v.clone()),
                Some(other) => Err(BundleError::TypeMismatch {
                    key: key.to_string(),
                    expected: $expected,
                    found: other.type_name(),
                }),
                None => Err(BundleError::Missing(key.to_string())),
            }
        }
    };
}

impl Bundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.put(key, BundleValue::Bool(value))
    }

    pub fn put_int(&mut self, key: &str, value: i32) -> &mut Self {
        self.put(key, BundleValue::Int(value))
    }

    pub fn put_long(&mut self, key: &str, value: i64) -> &mut Self {
        self.put(key, BundleValue::Long(value))
    }

    pub fn put_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.put(key, BundleValue::Str(value.into()))
    }

    pub fn put_string_list(&mut self, key: &str, value: Vec<String>) -> &mut Self {
        self.put(key, BundleValue::StrList(value))
    }

    pub fn put_long_list(&mut self, key: &str, value: Vec<i64>) -> &mut Self {
        self.put(key, BundleValue::LongList(value))
    }

    /// Insert a raw value, replacing any previous value for `key`.
    pub fn put(&mut self, key: &str, value: BundleValue) -> &mut Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    typed_getter!(get_bool, Bool, bool, "bool");
    typed_getter!(get_int, Int, i32, "int");
    typed_getter!(get_long, Long, i64, "long");
    typed_getter!(get_string, Str, String, "string");
    typed_getter!(get_string_list, StrList, Vec<String>, "string list");
    typed_getter!(get_long_list, LongList, Vec<i64>, "long list");

    /// Read a bool, falling back to `default` when the key is absent.
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, BundleError> {
        match self.get_bool(key) {
            Err(BundleError::Missing(_)) => Ok(default),
            other => other,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to JSON for transports that move bytes.
    pub fn to_json(&self) -> Result<String, BundleError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON produced by [`Bundle::to_json`].
    pub fn from_json(json: &str) -> Result<Self, BundleError> {
        Ok(serde_json::from_str(json)?)
    }
}
