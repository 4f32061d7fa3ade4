use archive_client::Connection;
use async_trait::async_trait;

use crate::error::UpdaterResult;

/// What one station recomputes and how it reacts to archive changes.
///
/// An [`crate::UpdateManager`] owns exactly one policy and calls it from its
/// notification callbacks and from the controller's update transaction.
#[async_trait]
pub trait UpdatePolicy: Send + Sync + 'static {
    /// Station name. Also names the state file and labels metrics.
    fn name(&self) -> &str;

    /// Notification keys whose changes invalidate this station's output.
    fn listen_keys(&self) -> Vec<String>;

    /// Keys to hold intents on for every pending range, so external writes into
    /// a reserved range come back as intent hits.
    fn intent_keys(&self) -> Vec<String>;

    /// Snaps a notified range to the granularity this station recomputes at.
    /// `None` discards the notification.
    fn round_notification(&self, _key: &str, start: i64, end: i64) -> Option<(i64, i64)> {
        Some((start, end))
    }

    /// Whether a notification on `key` schedules the merged range right away.
    /// When false the range waits for an intent hit or a flush.
    fn ready_on_notification(&self, _key: &str) -> bool {
        true
    }

    /// Ranges changed since `modified_after` (ms), or everything when `None`.
    async fn get_modified(
        &self,
        connection: &Connection,
        modified_after: Option<i64>,
    ) -> UpdaterResult<Vec<(i64, i64)>>;

    /// Recomputes `[start, end)`. Runs inside the controller's write transaction.
    async fn perform_update(&self, connection: &Connection, start: i64, end: i64) -> UpdaterResult<()>;
}
