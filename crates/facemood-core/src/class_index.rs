//! Label name ↔ dense index mapping, persisted as `class_index.json`.

use crate::fsutil;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassIndexError {
    #[error("class index is empty")]
    Empty,
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    #[error("indices are not contiguous in [0, {len}): missing {missing}")]
    NotContiguous { len: usize, missing: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bijection between labels and the classifier's output positions.
///
/// Serialized as a `{label: index}` object; indices are always `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndex {
    labels: Vec<String>,
}

impl ClassIndex {
    /// Build from labels in the given order.
    pub fn new(labels: Vec<String>) -> Result<Self, ClassIndexError> {
        if labels.is_empty() {
            return Err(ClassIndexError::Empty);
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(ClassIndexError::DuplicateLabel(label.clone()));
            }
        }
        Ok(Self { labels })
    }

    /// Build from folder names: sorted lexicographically, duplicates dropped.
    pub fn from_labels<I, S>(labels: I) -> Result<Self, ClassIndexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        labels.dedup();
        Self::new(labels)
    }

    fn from_map(map: BTreeMap<String, usize>) -> Result<Self, ClassIndexError> {
        let len = map.len();
        let mut slots: Vec<Option<String>> = vec![None; len];
        for (label, idx) in map {
            match slots.get_mut(idx) {
                Some(slot) if slot.is_none() => *slot = Some(label),
                _ => return Err(ClassIndexError::NotContiguous { len, missing: idx }),
            }
        }
        let labels = slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or(ClassIndexError::NotContiguous { len, missing: i }))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Labels in index order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn to_map(&self) -> BTreeMap<String, usize> {
        self.labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect()
    }
}

impl Serialize for ClassIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClassIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, usize>::deserialize(deserializer)?;
        ClassIndex::from_map(map).map_err(serde::de::Error::custom)
    }
}

/// Persists the class index next to the checkpoints.
pub struct ClassIndexRegistry {
    path: PathBuf,
    defaults: Vec<String>,
}

impl ClassIndexRegistry {
    pub fn new(path: impl Into<PathBuf>, defaults: Vec<String>) -> Self {
        Self { path: path.into(), defaults }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index over the configured default labels, in configured order.
    pub fn default_index(&self) -> ClassIndex {
        ClassIndex::new(self.defaults.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "default labels unusable; falling back to built-in set");
            ClassIndex {
                labels: crate::config::DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
            }
        })
    }

    /// Persisted mapping, or the default label set when absent or unreadable.
    pub fn load(&self) -> ClassIndex {
        match self.try_load() {
            Ok(Some(index)) => index,
            Ok(None) => self.default_index(),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "class index unreadable; using default labels"
                );
                self.default_index()
            }
        }
    }

    fn try_load(&self) -> Result<Option<ClassIndex>, ClassIndexError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save(&self, index: &ClassIndex) -> Result<(), ClassIndexError> {
        let json = serde_json::to_vec_pretty(index)?;
        fsutil::write_atomic(&self.path, &json)?;
        tracing::debug!(path = %self.path.display(), classes = index.len(), "saved class index");
        Ok(())
    }
}
