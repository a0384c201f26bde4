//! Resource keys: `namespace/name` for namespaced objects, `name` for cluster-scoped ones.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SEP: char = '/';

/// Raised when a key (or the parts it is built from) cannot round-trip.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed resource key {key:?}: {reason}")]
pub struct MalformedKeyError {
    pub key: String,
    pub reason: &'static str,
}

impl MalformedKeyError {
    fn new(key: impl Into<String>, reason: &'static str) -> Self {
        Self { key: key.into(), reason }
    }
}

/// Opaque identifier for one logical resource.
///
/// Holds the encoded string. Any string may be wrapped (see [`ResourceKey::from_raw`]);
/// validity is checked when the key is split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Encode a namespace (empty or `None` for cluster-scoped) and name.
    pub fn new(namespace: Option<&str>, name: &str) -> Result<Self, MalformedKeyError> {
        let ns = namespace.unwrap_or("");
        if name.is_empty() {
            return Err(MalformedKeyError::new(format!("{ns}{SEP}"), "empty name"));
        }
        if name.contains(SEP) || ns.contains(SEP) {
            return Err(MalformedKeyError::new(format!("{ns}{SEP}{name}"), "separator inside a component"));
        }
        if ns.is_empty() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{ns}{SEP}{name}")))
        }
    }

    /// Wrap an already-encoded key without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into `(namespace, name)`; namespace is `None` for cluster-scoped keys.
    pub fn split(&self) -> Result<(Option<&str>, &str), MalformedKeyError> {
        let raw = self.0.as_str();
        if raw.is_empty() {
            return Err(MalformedKeyError::new(raw, "empty key"));
        }
        let mut parts = raw.split(SEP);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok((None, name)),
            (Some(""), Some(_), None) => Err(MalformedKeyError::new(raw, "empty namespace")),
            (Some(_), Some(""), None) => Err(MalformedKeyError::new(raw, "empty name")),
            (Some(ns), Some(name), None) => Ok((Some(ns), name)),
            _ => Err(MalformedKeyError::new(raw, "more than one separator")),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceKey {
    type Err = MalformedKeyError;

    /// Parses and validates in one step.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = Self::from_raw(s);
        key.split()?;
        Ok(key)
    }
}
