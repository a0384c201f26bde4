//! Typed view of a cached Kubernetes object.
//!
//! Metadata fields the controller reads are typed; everything else is carried
//! through untouched in flattened JSON maps so a snapshot can be written back whole.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::key::{MalformedKeyError, ResourceKey};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// uid, ownerReferences, finalizers, ...
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    #[serde(default)]
    pub metadata: SnapshotMeta,
    /// apiVersion, kind, spec, status, ...
    #[serde(flatten)]
    pub body: Map<String, Json>,
}

impl ResourceSnapshot {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            metadata: SnapshotMeta {
                name: name.to_string(),
                namespace: namespace.map(|s| s.to_string()),
                ..Default::default()
            },
            body: Map::new(),
        }
    }

    pub fn with_label(mut self, k: &str, v: &str) -> Self {
        self.metadata.labels.insert(k.to_string(), v.to_string());
        self
    }

    pub fn with_annotation(mut self, k: &str, v: &str) -> Self {
        self.metadata.annotations.insert(k.to_string(), v.to_string());
        self
    }

    pub fn with_field(mut self, k: &str, v: Json) -> Self {
        self.body.insert(k.to_string(), v);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref().filter(|s| !s.is_empty())
    }

    pub fn label(&self, k: &str) -> Option<&str> {
        self.metadata.labels.get(k).map(String::as_str)
    }

    pub fn annotation(&self, k: &str) -> Option<&str> {
        self.metadata.annotations.get(k).map(String::as_str)
    }

    pub fn key(&self) -> Result<ResourceKey, MalformedKeyError> {
        ResourceKey::new(self.namespace(), self.name())
    }

    /// Parse from raw object JSON, dropping `metadata.managedFields`.
    pub fn from_json(mut raw: Json) -> serde_json::Result<Self> {
        strip_managed_fields(&mut raw);
        serde_json::from_value(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<Json> {
        serde_json::to_value(self)
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}
