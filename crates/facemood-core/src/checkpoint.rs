//! `last` / `best` checkpoint slots on disk.
//!
//! Each slot is a pair: `<slot>.mpk` holds the recorded weights and
//! `<slot>.json` the metadata needed to rebuild the network before loading
//! them. Weights are written first, so a readable `.json` always has its
//! weights beside it.

use crate::class_index::ClassIndex;
use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed checkpoint {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no checkpoint in slot {0}")]
    MissingSlot(Slot),
    #[error("refusing to save non-finite losses to slot {0}")]
    NonFinite(Slot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Last,
    Best,
}

impl Slot {
    fn meta_file(self) -> &'static str {
        match self {
            Slot::Last => "last.json",
            Slot::Best => "best.json",
        }
    }

    fn weights_file(self) -> &'static str {
        match self {
            Slot::Last => "last.mpk",
            Slot::Best => "best.mpk",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Slot::Last => "last",
            Slot::Best => "best",
        })
    }
}

/// Provenance needed to decide whether the weights can be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Architecture id; kept as text so unknown ids still load and get rejected by the caller.
    pub architecture: String,
    pub class_index: ClassIndex,
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    /// Recorder output of the network, see [`crate::network::EmotionNet::to_bytes`].
    pub weights: Vec<u8>,
}

/// The two checkpoint slots under one directory.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Metadata file of `slot`.
    pub fn path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.meta_file())
    }

    pub fn weights_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.weights_file())
    }

    pub fn exists(&self, slot: Slot) -> bool {
        self.path(slot).is_file() && self.weights_path(slot).is_file()
    }

    /// Atomically replace `slot`. Non-finite losses are rejected before anything is written.
    pub fn save(&self, checkpoint: &Checkpoint, slot: Slot) -> Result<(), CheckpointError> {
        let meta = &checkpoint.meta;
        if !meta.train_loss.is_finite() || !meta.val_loss.is_finite() {
            return Err(CheckpointError::NonFinite(slot));
        }
        let path = self.path(slot);
        let json = serde_json::to_vec_pretty(meta).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;

        let weights = self.weights_path(slot);
        fsutil::write_atomic(&weights, &checkpoint.weights).map_err(|source| CheckpointError::Io {
            path: weights.clone(),
            source,
        })?;
        fsutil::write_atomic(&path, &json).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(slot = %slot, epoch = meta.epoch, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    /// Copy the `last` slot over `best`.
    pub fn promote_to_best(&self) -> Result<(), CheckpointError> {
        if !self.exists(Slot::Last) {
            return Err(CheckpointError::MissingSlot(Slot::Last));
        }
        for (from, to) in [
            (self.weights_path(Slot::Last), self.weights_path(Slot::Best)),
            (self.path(Slot::Last), self.path(Slot::Best)),
        ] {
            fsutil::copy_atomic(&from, &to).map_err(|source| CheckpointError::Io { path: to.clone(), source })?;
        }
        tracing::debug!("promoted last checkpoint to best");
        Ok(())
    }

    /// Read `slot`; `Ok(None)` when it has never been written.
    pub fn load(&self, slot: Slot) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path(slot);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let meta = serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;
        let weights_path = self.weights_path(slot);
        let weights = std::fs::read(&weights_path).map_err(|source| CheckpointError::Io {
            path: weights_path,
            source,
        })?;
        Ok(Some(Checkpoint { meta, weights }))
    }
}
