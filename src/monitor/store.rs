//! Persisted monitor state (`state.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{BinaryStatus, ServerConfig, User};
use super::registry::Registry;
use crate::errors::MonitorError;

/// Everything that survives a monitor restart. Supervisors are rebuilt from
/// `servers` on startup and never written out.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(default)]
    pub last_id: i64,
    #[serde(default)]
    pub servers: BTreeMap<i64, ServerConfig>,
    #[serde(default)]
    pub versions: BTreeMap<String, BinaryStatus>,
    #[serde(default)]
    pub tokens: BTreeMap<String, User>,
}

/// Reads and writes the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state file. A missing file is an empty state.
    pub fn load(&self) -> Result<PersistedState, MonitorError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(source) => {
                return Err(MonitorError::StateRead {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| MonitorError::StateParse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the registry's current state. The file is replaced atomically
    /// so a crash mid-write never leaves a truncated state file behind.
    pub async fn dump(&self, registry: &Registry) -> Result<(), MonitorError> {
        let snapshot = registry.snapshot()?;
        let json = serde_json::to_string_pretty(&snapshot).map_err(|e| {
            MonitorError::Other(anyhow::Error::new(e).context("Failed to serialize state"))
        })?;

        let write_err = |source| MonitorError::StateWrite {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(write_err)?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}
