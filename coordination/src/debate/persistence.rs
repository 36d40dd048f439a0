//! Debate persistence: snapshots of finished debates.
//!
//! The coordinator saves a [`DebateSnapshot`] exactly once, on entry to the
//! terminal state. Stores are pluggable through [`DebateStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::model::Debate;
use super::state::DebateStatus;

/// A serialized debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSnapshot {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub debate: Debate,
}

impl DebateSnapshot {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(debate: &Debate) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            saved_at: Utc::now(),
            debate: debate.clone(),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Serialize(e.to_string()))
    }

    /// Deserialize, rejecting newer schema versions.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| StoreError::Deserialize(e.to_string()))?;
        if snapshot.version > Self::CURRENT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }

    /// Consistency problems found in the snapshot (empty when sound).
    pub fn integrity_errors(&self) -> Vec<String> {
        let d = &self.debate;
        let mut errors = Vec::new();

        if let Some(last) = d.timeline().last() {
            if last.to != d.status() {
                errors.push(format!(
                    "last transition target {} doesn't match status {}",
                    last.to,
                    d.status()
                ));
            }
        }
        for window in d.timeline().windows(2) {
            // a reset starts a new lifecycle at round 0
            if window[0].to == DebateStatus::Configuring {
                continue;
            }
            if window[1].round < window[0].round {
                errors.push(format!(
                    "round decreased from {} to {}",
                    window[0].round, window[1].round
                ));
            }
        }
        if let Some(r) = d.transcript().iter().find(|r| r.round > d.current_round()) {
            errors.push(format!(
                "response from {} in round {} exceeds current round {}",
                r.participant_id,
                r.round,
                d.current_round()
            ));
        }
        if d.status().is_terminal() && d.verdict().is_none() {
            errors.push("completed debate has no verdict".to_string());
        }
        errors
    }
}

/// Store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialize failed: {0}")]
    Serialize(String),

    #[error("deserialize failed: {0}")]
    Deserialize(String),

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("snapshot for debate {0} not found")]
    NotFound(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persistence collaborator.
#[async_trait]
pub trait DebateStore: Send + Sync {
    async fn save(&self, snapshot: &DebateSnapshot) -> Result<(), StoreError>;

    async fn load(&self, debate_id: &str) -> Result<DebateSnapshot, StoreError>;

    fn name(&self) -> &str;
}

/// One pretty JSON file per debate, `<dir>/<debate_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, debate_id: &str) -> PathBuf {
        self.dir.join(format!("{debate_id}.json"))
    }
}

#[async_trait]
impl DebateStore for JsonFileStore {
    async fn save(&self, snapshot: &DebateSnapshot) -> Result<(), StoreError> {
        let json = snapshot.to_json()?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let path = self.path_for(&snapshot.debate.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        info!(debate_id = %snapshot.debate.id, path = %path.display(), "debate snapshot saved");
        Ok(())
    }

    async fn load(&self, debate_id: &str) -> Result<DebateSnapshot, StoreError> {
        let path = self.path_for(debate_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(debate_id.to_string()))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        DebateSnapshot::from_json(&json)
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// In-memory store; keeps every save.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<HashMap<String, Vec<DebateSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `debate_id` was saved.
    pub async fn save_count(&self, debate_id: &str) -> usize {
        self.saved
            .lock()
            .await
            .get(debate_id)
            .map_or(0, |v| v.len())
    }
}

#[async_trait]
impl DebateStore for MemoryStore {
    async fn save(&self, snapshot: &DebateSnapshot) -> Result<(), StoreError> {
        self.saved
            .lock()
            .await
            .entry(snapshot.debate.id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn load(&self, debate_id: &str) -> Result<DebateSnapshot, StoreError> {
        self.saved
            .lock()
            .await
            .get(debate_id)
            .and_then(|v| v.last().cloned())
            .ok_or_else(|| StoreError::NotFound(debate_id.to_string()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
