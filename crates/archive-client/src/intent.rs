use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::error;

use crate::connection::{Connection, Shared};
use crate::error::ConnectionResult;

pub(crate) struct IntentState {
    pub(crate) uid: u64,
    pub(crate) key: String,
    pub(crate) start: i64,
    pub(crate) end: i64,
    /// Held on the server: acquired and committed, not yet released.
    realized: AtomicBool,
    /// A release is queued inside an open transaction.
    releasing: AtomicBool,
    connection: Weak<Shared>,
}

impl IntentState {
    pub(crate) fn new(
        uid: u64,
        key: String,
        start: i64,
        end: i64,
        connection: Weak<Shared>,
    ) -> Self {
        Self {
            uid,
            key,
            start,
            end,
            realized: AtomicBool::new(false),
            releasing: AtomicBool::new(false),
            connection,
        }
    }

    pub(crate) fn is_realized(&self) -> bool {
        self.realized.load(Ordering::Acquire)
    }

    pub(crate) fn set_realized(&self, realized: bool) {
        self.realized.store(realized, Ordering::Release);
    }

    pub(crate) fn set_releasing(&self, releasing: bool) {
        self.releasing.store(releasing, Ordering::Release);
    }

    fn is_releasing(&self) -> bool {
        self.releasing.load(Ordering::Acquire)
    }
}

/// An intent held by this connection.
///
/// The handle is the only way to release the intent, so it is not `Clone`.
/// Dropping a realized handle without releasing it leaks the intent on the
/// server until the connection closes; debug builds treat that as a bug.
pub struct IntentHandle {
    state: Arc<IntentState>,
}

impl IntentHandle {
    pub(crate) fn from_state(state: Arc<IntentState>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Arc<IntentState> {
        &self.state
    }

    pub fn uid(&self) -> u64 {
        self.state.uid
    }

    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn start(&self) -> i64 {
        self.state.start
    }

    pub fn end(&self) -> i64 {
        self.state.end
    }

    pub fn is_realized(&self) -> bool {
        self.state.is_realized()
    }

    /// Drops the handle without the held-intent check. The caller releases the
    /// intent on the server by the returned uid.
    pub(crate) fn disown(self) -> u64 {
        self.state.set_realized(false);
        self.state.uid
    }

    /// Releases the intent. A non-immediate release inside a transaction only
    /// takes effect when the transaction commits.
    pub async fn release(self, connection: &Connection, immediate: bool) -> ConnectionResult<()> {
        connection.release_intent(self, immediate).await
    }
}

impl fmt::Debug for IntentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentHandle")
            .field("uid", &self.state.uid)
            .field("key", &self.state.key)
            .field("start", &self.state.start)
            .field("end", &self.state.end)
            .field("realized", &self.is_realized())
            .finish()
    }
}

impl Drop for IntentHandle {
    fn drop(&mut self) {
        if !self.state.is_realized() || self.state.is_releasing() {
            return;
        }
        let Some(shared) = self.state.connection.upgrade() else {
            return;
        };
        if shared.is_closed() {
            return;
        }
        error!(
            uid = self.state.uid,
            key = %self.state.key,
            start = self.state.start,
            end = self.state.end,
            "intent handle dropped while still held"
        );
        if cfg!(debug_assertions) && !std::thread::panicking() {
            panic!("intent {} dropped while still held", self.state.uid);
        }
    }
}
