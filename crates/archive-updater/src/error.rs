use std::path::PathBuf;

use archive_client::ConnectionError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum UpdaterError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("state file {}: {source}", path.display())]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {}: {source}", path.display())]
    StateFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Persisted state from another format version is never upgraded in place.
    #[error("state file {} has version {found}, expected {expected}", path.display())]
    StateVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("{station}: {source}")]
    Policy {
        station: String,
        #[source]
        source: BoxError,
    },
    #[error("updater is shutting down")]
    ShuttingDown,
}

pub type UpdaterResult<T> = Result<T, UpdaterError>;

impl UpdaterError {
    pub fn policy(station: impl Into<String>, source: impl Into<BoxError>) -> Self {
        UpdaterError::Policy {
            station: station.into(),
            source: source.into(),
        }
    }

    pub fn is_lock_denied(&self) -> bool {
        matches!(self, UpdaterError::Connection(err) if err.is_lock_denied())
    }
}
