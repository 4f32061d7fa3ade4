use std::env;
use std::path::PathBuf;
use std::time::Duration;

use archive_client::ConnectionOptions;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/archive-updater";
pub const DEFAULT_LOG_FILTER: &str = "info";

const ENV_STATE_DIR: &str = "ARCHIVE_UPDATER_STATE_DIR";
const ENV_HEARTBEAT_SECS: &str = "ARCHIVE_UPDATER_HEARTBEAT_SECS";
const ENV_IDLE_POLL_SECS: &str = "ARCHIVE_UPDATER_IDLE_POLL_SECS";
const ENV_LOG: &str = "ARCHIVE_UPDATER_LOG";

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// One `<station>.json` per managed station lives here.
    pub state_dir: PathBuf,
    /// Heartbeat cadence of the updater's archive connection.
    pub heartbeat_interval: Duration,
    /// Upper bound on how long the controller sleeps without re-checking for work.
    pub idle_poll: Duration,
    /// `EnvFilter` directives for [`crate::telemetry::init_tracing`].
    pub log_filter: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            heartbeat_interval: Duration::from_secs(30),
            idle_poll: Duration::from_secs(300),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl UpdaterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let state_dir = non_empty(ENV_STATE_DIR)
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        let heartbeat_interval = seconds(ENV_HEARTBEAT_SECS).unwrap_or(defaults.heartbeat_interval);
        let idle_poll = seconds(ENV_IDLE_POLL_SECS).unwrap_or(defaults.idle_poll);
        let log_filter = non_empty(ENV_LOG).unwrap_or(defaults.log_filter);
        Self {
            state_dir,
            heartbeat_interval,
            idle_poll,
            log_filter,
        }
    }

    /// Options for the connection the controller drives.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            heartbeat_interval: self.heartbeat_interval,
            ..ConnectionOptions::default()
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn seconds(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn connection_options_carry_the_heartbeat() {
        let config = UpdaterConfig {
            heartbeat_interval: Duration::from_secs(7),
            ..UpdaterConfig::default()
        };
        let options = config.connection_options();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(7));
        let defaults = ConnectionOptions::default();
        assert_eq!(options.read_timeout, defaults.read_timeout);
        assert_eq!(options.max_outstanding_heartbeats, defaults.max_outstanding_heartbeats);
    }
}
