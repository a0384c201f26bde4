//! Built-in sync rules.

#![forbid(unsafe_code)]

use autolabel_core::ResourceSnapshot;

use crate::sync::SyncRule;

pub const DEFAULT_ANNOTATION_PREFIX: &str = "autolabel/";
pub const DEFAULT_LABEL_KEY: &str = "autolabel";

/// Copies annotation `<prefix><object name>` onto label `<label_key>`.
#[derive(Debug, Clone)]
pub struct AnnotationToLabel {
    pub annotation_prefix: String,
    pub label_key: String,
}

impl Default for AnnotationToLabel {
    fn default() -> Self {
        Self { annotation_prefix: DEFAULT_ANNOTATION_PREFIX.to_string(), label_key: DEFAULT_LABEL_KEY.to_string() }
    }
}

impl AnnotationToLabel {
    pub fn new(annotation_prefix: impl Into<String>, label_key: impl Into<String>) -> Self {
        Self { annotation_prefix: annotation_prefix.into(), label_key: label_key.into() }
    }

    pub fn annotation_key(&self, name: &str) -> String {
        format!("{}{}", self.annotation_prefix, name)
    }
}

impl SyncRule for AnnotationToLabel {
    fn desired(&self, current: &ResourceSnapshot) -> Option<ResourceSnapshot> {
        let wanted = current.annotation(&self.annotation_key(current.name()))?;
        if current.label(&self.label_key) == Some(wanted) {
            return None;
        }
        let mut next = current.clone();
        next.metadata.labels.insert(self.label_key.clone(), wanted.to_string());
        Some(next)
    }
}
