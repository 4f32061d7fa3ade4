//! Per-station persisted backlog.
//!
//! ```json
//! {"version": 1, "modified": 1717000000, "pending": [[1000, 2000], [5000, 6000]]}
//! ```
//!
//! `modified` is unix seconds, pending bounds are milliseconds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::error::{UpdaterError, UpdaterResult};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub modified: i64,
    pub pending: Vec<(i64, i64)>,
}

impl PersistedState {
    pub fn new(modified: i64, pending: Vec<(i64, i64)>) -> Self {
        Self {
            version: STATE_VERSION,
            modified,
            pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn for_station(state_dir: &Path, station: &str) -> Self {
        Self {
            path: state_dir.join(format!("{station}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state, or `None` when no file exists yet.
    pub async fn load(&self) -> UpdaterResult<Option<PersistedState>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        // Check the version before the shape so a newer format reports as such.
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|source| self.format_error(source))?;
        let found = value.get("version").and_then(serde_json::Value::as_u64);
        if found != Some(u64::from(STATE_VERSION)) {
            return Err(UpdaterError::StateVersion {
                path: self.path.clone(),
                found: found.and_then(|version| u32::try_from(version).ok()).unwrap_or(0),
                expected: STATE_VERSION,
            });
        }
        let state = serde_json::from_value(value).map_err(|source| self.format_error(source))?;
        Ok(Some(state))
    }

    /// Replaces the file atomically: write a sibling, sync it, rename over.
    pub async fn store(&self, state: &PersistedState) -> UpdaterResult<()> {
        let encoded = serde_json::to_vec(state).map_err(|source| self.format_error(source))?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| self.io_error(source))?;
        }
        let staging = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|source| self.io_error(source))?;
        file.write_all(&encoded)
            .await
            .map_err(|source| self.io_error(source))?;
        file.sync_all().await.map_err(|source| self.io_error(source))?;
        drop(file);
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        trace!(path = %self.path.display(), ranges = state.pending.len(), "state persisted");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> UpdaterError {
        UpdaterError::StateIo {
            path: self.path.clone(),
            source,
        }
    }

    fn format_error(&self, source: serde_json::Error) -> UpdaterError {
        UpdaterError::StateFormat {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("archive-updater-state-{}", uuid::Uuid::new_v4()))
    }

    #[test_timeout::tokio_timeout_test]
    async fn stores_and_loads() {
        let dir = scratch_dir();
        let file = StateFile::for_station(&dir, "sgp");
        assert_eq!(file.load().await.expect("load missing"), None);

        let state = PersistedState::new(1_717_000_000, vec![(1000, 2000), (5000, 6000)]);
        file.store(&state).await.expect("store");
        assert_eq!(file.load().await.expect("load"), Some(state));

        let raw = std::fs::read_to_string(file.path()).expect("raw");
        assert!(raw.contains("\"pending\":[[1000,2000],[5000,6000]]"), "{raw}");
        assert!(!file.path().with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test_timeout::tokio_timeout_test]
    async fn version_mismatch_is_fatal() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).expect("mkdir");
        let file = StateFile::for_station(&dir, "sgp");
        std::fs::write(file.path(), br#"{"version": 2, "modified": 0, "pending": []}"#).expect("write");

        let err = file.load().await.expect_err("newer version");
        assert!(matches!(
            err,
            UpdaterError::StateVersion {
                found: 2,
                expected: STATE_VERSION,
                ..
            }
        ));

        std::fs::write(file.path(), b"not json").expect("write");
        assert!(matches!(
            file.load().await,
            Err(UpdaterError::StateFormat { .. })
        ));
        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
