//! Per-station backlog of ranges awaiting recomputation.
//!
//! The manager listens for notifications on its policy's keys, merges the rounded
//! ranges into a [`PendingList`], and holds an intent on every pending range so
//! that external writes into it come back as intent hits. The state file is
//! written before intents for a new range are acquired, so a crash never leaves
//! a reserved range the file does not know about.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use archive_client::{
    Connection, IntentHandle, IntentHit, IntentListener, Notification, NotificationListener,
};
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{UpdaterError, UpdaterResult};
use crate::metrics;
use crate::pending::PendingList;
use crate::policy::UpdatePolicy;
use crate::state::{PersistedState, StateFile};

struct Backlog {
    pending: PendingList<IntentHandle>,
    /// Unix seconds at the start of the last completed load.
    modified: i64,
    /// Nothing is written before a load succeeds, so a state file the manager
    /// refused to read is never overwritten.
    loaded: bool,
}

struct ManagerInner<P> {
    policy: P,
    intent_keys: Vec<String>,
    connection: Connection,
    state_file: StateFile,
    backlog: Mutex<Backlog>,
    shutting_down: AtomicBool,
    wake: Arc<Notify>,
}

/// Schedules recomputation for one station.
pub struct UpdateManager<P> {
    inner: Arc<ManagerInner<P>>,
}

impl<P> Clone for UpdateManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: UpdatePolicy> UpdateManager<P> {
    /// `wake` is notified whenever a range becomes ready to run.
    pub fn new(policy: P, connection: Connection, state_dir: impl AsRef<Path>, wake: Arc<Notify>) -> Self {
        let state_file = StateFile::for_station(state_dir.as_ref(), policy.name());
        let intent_keys = policy.intent_keys();
        Self {
            inner: Arc::new(ManagerInner {
                policy,
                intent_keys,
                connection,
                state_file,
                backlog: Mutex::new(Backlog {
                    pending: PendingList::new(),
                    modified: 0,
                    loaded: false,
                }),
                shutting_down: AtomicBool::new(false),
                wake,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.station()
    }

    pub fn policy(&self) -> &P {
        &self.inner.policy
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Registers for notifications on the listen keys and intent hits on the
    /// intent keys. Notification acknowledgement waits for the merge.
    pub async fn initialize(&self) -> UpdaterResult<()> {
        let weak = Arc::downgrade(&self.inner);
        for key in self.inner.policy.listen_keys() {
            let relay = Arc::new(NotificationRelay {
                manager: Weak::clone(&weak),
            });
            self.inner.connection.listen_notification(&key, relay, true).await?;
        }
        for key in &self.inner.intent_keys {
            let relay = Arc::new(IntentRelay {
                manager: Weak::clone(&weak),
            });
            self.inner.connection.listen_intent(key, relay).await?;
        }
        debug!(station = self.name(), "listeners registered");
        Ok(())
    }

    /// Restores the persisted backlog and merges in everything the policy reports
    /// as modified since it was written. Loaded ranges are ready to run.
    pub async fn load_existing(&self) -> UpdaterResult<()> {
        let inner = &self.inner;
        let started = OffsetDateTime::now_utc().unix_timestamp();
        let mut backlog = inner.backlog.lock().await;

        let previous = inner.state_file.load().await?;
        let modified_after = previous.as_ref().map(|state| state.modified.saturating_mul(1000));
        let restored = match previous {
            Some(state) => {
                backlog.modified = state.modified;
                state.pending
            }
            None => Vec::new(),
        };
        for &(start, end) in &restored {
            inner.merge_locked(&mut backlog, start, end, true).await?;
        }

        let changed = inner
            .policy
            .get_modified(&inner.connection, modified_after)
            .await?;
        for &(start, end) in &changed {
            inner.merge_locked(&mut backlog, start, end, true).await?;
        }

        backlog.modified = started;
        backlog.loaded = true;
        inner.persist(&backlog).await?;
        info!(
            station = self.name(),
            restored = restored.len(),
            changed = changed.len(),
            pending = backlog.pending.len(),
            "backlog loaded"
        );
        let ready = backlog.pending.ready_len();
        drop(backlog);
        if ready > 0 {
            self.notify_update_ready();
        }
        Ok(())
    }

    /// Merges `[start, end)` into the backlog as a notification would, without rounding.
    pub async fn merge(&self, start: i64, end: i64, ready: bool) -> UpdaterResult<()> {
        let mut backlog = self.inner.backlog.lock().await;
        self.inner.merge_locked(&mut backlog, start, end, ready).await?;
        drop(backlog);
        if ready {
            self.notify_update_ready();
        }
        Ok(())
    }

    /// Marks every pending range intersecting `[start, end)` ready.
    pub async fn flush(&self, start: i64, end: i64) -> usize {
        let marked = self
            .inner
            .backlog
            .lock()
            .await
            .pending
            .mark_intersecting_ready(start, end);
        info!(station = self.name(), start, end, marked, "flush requested");
        if marked > 0 {
            self.notify_update_ready();
        }
        marked
    }

    pub fn notify_update_ready(&self) {
        self.inner.notify_update_ready();
    }

    pub async fn pending_ranges(&self) -> Vec<(i64, i64)> {
        self.inner.backlog.lock().await.pending.ranges()
    }

    /// Pending ranges queued to run, in the order [`UpdateManager::next_update`] yields them.
    pub async fn ready_ranges(&self) -> Vec<(i64, i64)> {
        self.inner.backlog.lock().await.pending.ready_ranges()
    }

    /// Takes the range that was marked ready first out of the backlog.
    ///
    /// Its intents are released non-immediately, so inside a transaction they stay
    /// held until commit and come back from an abort. The returned ticket must be
    /// completed once the work is committed, or reinstated on failure. Fails with
    /// [`UpdaterError::ShuttingDown`] once [`UpdateManager::shutdown`] has begun.
    pub async fn next_update(&self) -> UpdaterResult<Option<UpdateTicket>> {
        let inner = &self.inner;
        let mut backlog = inner.backlog.lock().await;
        if inner.is_shutting_down() {
            return Err(UpdaterError::ShuttingDown);
        }
        let Some(entry) = backlog.pending.pop_ready() else {
            return Ok(None);
        };
        metrics::PENDING_RANGES
            .with_label_values(&[inner.station()])
            .set(backlog.pending.len() as i64);
        drop(backlog);

        let (start, end) = entry.bounds();
        let owner: Arc<dyn TicketOwner> = Arc::clone(inner) as Arc<dyn TicketOwner>;
        let ticket = UpdateTicket {
            owner: Some(owner),
            station: inner.station().to_string(),
            start,
            end,
        };
        for intent in entry.intents {
            intent.release(&inner.connection, false).await?;
        }
        debug!(station = inner.station(), start, end, "update started");
        Ok(Some(ticket))
    }

    pub async fn perform_update(&self, start: i64, end: i64) -> UpdaterResult<()> {
        self.inner
            .policy
            .perform_update(&self.inner.connection, start, end)
            .await
    }

    /// Stops reacting to callbacks, persists the backlog and releases every intent.
    pub async fn shutdown(&self) -> UpdaterResult<()> {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::Release);
        let mut backlog = inner.backlog.lock().await;
        let persisted = inner.persist(&backlog).await;
        let intents = backlog.pending.take_intents();
        let released = inner.connection.release_all(intents).await;
        info!(
            station = self.name(),
            pending = backlog.pending.len(),
            "update manager shut down"
        );
        persisted?;
        released?;
        Ok(())
    }
}

impl<P: UpdatePolicy> ManagerInner<P> {
    fn station(&self) -> &str {
        self.policy.name()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn notify_update_ready(&self) {
        self.wake.notify_one();
    }

    async fn on_notification(&self, notification: &Notification) -> UpdaterResult<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        metrics::NOTIFICATIONS_RECEIVED
            .with_label_values(&[self.station()])
            .inc();
        let rounded =
            self.policy
                .round_notification(&notification.key, notification.start, notification.end);
        let Some((start, end)) = rounded else {
            debug!(
                station = self.station(),
                key = %notification.key,
                "notification discarded by policy"
            );
            return Ok(());
        };
        let ready = self.policy.ready_on_notification(&notification.key);

        let mut backlog = self.backlog.lock().await;
        if self.is_shutting_down() {
            return Ok(());
        }
        self.merge_locked(&mut backlog, start, end, ready).await?;
        drop(backlog);
        if ready {
            self.notify_update_ready();
        }
        Ok(())
    }

    async fn on_intent_hit(&self, hit: &IntentHit) {
        if self.is_shutting_down() {
            return;
        }
        metrics::INTENT_HITS.with_label_values(&[self.station()]).inc();
        let marked = {
            let mut backlog = self.backlog.lock().await;
            if self.is_shutting_down() {
                return;
            }
            backlog.pending.mark_intersecting_ready(hit.start, hit.end)
        };
        debug!(
            station = self.station(),
            key = %hit.key,
            start = hit.start,
            end = hit.end,
            marked,
            "intent hit"
        );
        if marked > 0 {
            self.notify_update_ready();
        }
    }

    /// Merges `[start, end)` with the ranges it touches: record the merged list,
    /// acquire intents for the union, then release those of the absorbed entries.
    async fn merge_locked(
        &self,
        backlog: &mut Backlog,
        start: i64,
        end: i64,
        ready: bool,
    ) -> UpdaterResult<()> {
        if start >= end {
            return Ok(());
        }
        if let Some(id) = backlog.pending.covering(start, end) {
            if ready {
                backlog.pending.mark_ready(id);
            }
            return Ok(());
        }

        let run = backlog.pending.touching(start, end);
        let (start, end) = backlog.pending.merged_bounds(run.clone(), start, end);
        if backlog.loaded {
            let planned = backlog.pending.ranges_with(run.clone(), start, end);
            self.state_file
                .store(&PersistedState::new(backlog.modified, planned))
                .await?;
        }

        // A draining manager keeps the range on disk but holds nothing for it.
        let intents = if self.is_shutting_down() {
            Vec::new()
        } else {
            self.acquire_intents(start, end).await?
        };
        let replaced = backlog.pending.replace(run, start, end, intents);
        if let Err(err) = self.connection.release_all(replaced.superseded).await {
            warn!(station = self.station(), error = %err, "superseded intents not released");
        }
        if ready {
            backlog.pending.mark_ready(replaced.id);
        }
        self.persist(backlog).await?;
        debug!(
            station = self.station(),
            start,
            end,
            ready = backlog.pending.is_ready(replaced.id),
            "range merged"
        );
        Ok(())
    }

    async fn acquire_intents(&self, start: i64, end: i64) -> UpdaterResult<Vec<IntentHandle>> {
        let mut intents = Vec::with_capacity(self.intent_keys.len());
        for key in &self.intent_keys {
            match self.connection.acquire_intent(key, start, end, true).await {
                Ok(handle) => intents.push(handle),
                Err(err) => {
                    if let Err(release_err) = self.connection.release_all(intents).await {
                        debug!(error = %release_err, "releasing partial intents failed");
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(intents)
    }

    async fn persist(&self, backlog: &Backlog) -> UpdaterResult<()> {
        metrics::PENDING_RANGES
            .with_label_values(&[self.station()])
            .set(backlog.pending.len() as i64);
        if !backlog.loaded {
            return Ok(());
        }
        self.state_file
            .store(&PersistedState::new(backlog.modified, backlog.pending.ranges()))
            .await
    }
}

#[async_trait]
trait TicketOwner: Send + Sync {
    async fn complete(&self) -> UpdaterResult<()>;
    async fn reinstate(&self, start: i64, end: i64) -> UpdaterResult<()>;
}

#[async_trait]
impl<P: UpdatePolicy> TicketOwner for ManagerInner<P> {
    async fn complete(&self) -> UpdaterResult<()> {
        let backlog = self.backlog.lock().await;
        self.persist(&backlog).await
    }

    async fn reinstate(&self, start: i64, end: i64) -> UpdaterResult<()> {
        let mut backlog = self.backlog.lock().await;
        self.merge_locked(&mut backlog, start, end, true).await?;
        drop(backlog);
        warn!(station = self.station(), start, end, "update reinstated");
        self.notify_update_ready();
        Ok(())
    }
}

/// A range taken out of a station's backlog by [`UpdateManager::next_update`].
///
/// Dropping it unsettled reinstates the range on a background task.
#[must_use = "an update ticket must be completed or reinstated"]
pub struct UpdateTicket {
    owner: Option<Arc<dyn TicketOwner>>,
    station: String,
    start: i64,
    end: i64,
}

impl UpdateTicket {
    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn bounds(&self) -> (i64, i64) {
        (self.start, self.end)
    }

    /// The update committed: persist the backlog without this range.
    pub async fn complete(mut self) -> UpdaterResult<()> {
        match self.owner.take() {
            Some(owner) => owner.complete().await,
            None => Ok(()),
        }
    }

    /// The update failed: merge the range back and queue it to run again.
    pub async fn reinstate(mut self) -> UpdaterResult<()> {
        match self.owner.take() {
            Some(owner) => owner.reinstate(self.start, self.end).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for UpdateTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateTicket")
            .field("station", &self.station)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

impl Drop for UpdateTicket {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        let (station, start, end) = (self.station.clone(), self.start, self.end);
        let Ok(runtime) = Handle::try_current() else {
            error!(station = %station, start, end, "update ticket dropped outside a runtime; range lost until reload");
            return;
        };
        runtime.spawn(async move {
            if let Err(err) = owner.reinstate(start, end).await {
                error!(station = %station, start, end, error = %err, "reinstating dropped update failed");
            }
        });
    }
}

struct NotificationRelay<P> {
    manager: Weak<ManagerInner<P>>,
}

#[async_trait]
impl<P: UpdatePolicy> NotificationListener for NotificationRelay<P> {
    async fn on_notification(&self, notification: &Notification) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if let Err(err) = manager.on_notification(notification).await {
            warn!(
                station = manager.station(),
                key = %notification.key,
                start = notification.start,
                end = notification.end,
                error = %err,
                "notification not merged"
            );
        }
    }
}

struct IntentRelay<P> {
    manager: Weak<ManagerInner<P>>,
}

#[async_trait]
impl<P: UpdatePolicy> IntentListener for IntentRelay<P> {
    async fn on_intent_hit(&self, hit: &IntentHit) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_intent_hit(hit).await;
        }
    }
}

/// Object-safe view of an [`UpdateManager`], so one controller can rotate over
/// stations with different policies.
#[async_trait]
pub trait Station: Send + Sync {
    fn name(&self) -> &str;

    /// [`UpdateManager::initialize`] followed by [`UpdateManager::load_existing`].
    async fn start(&self) -> UpdaterResult<()>;

    async fn next_update(&self) -> UpdaterResult<Option<UpdateTicket>>;

    async fn perform_update(&self, start: i64, end: i64) -> UpdaterResult<()>;

    async fn shutdown(&self) -> UpdaterResult<()>;
}

#[async_trait]
impl<P: UpdatePolicy> Station for UpdateManager<P> {
    fn name(&self) -> &str {
        UpdateManager::name(self)
    }

    async fn start(&self) -> UpdaterResult<()> {
        self.initialize().await?;
        self.load_existing().await
    }

    async fn next_update(&self) -> UpdaterResult<Option<UpdateTicket>> {
        UpdateManager::next_update(self).await
    }

    async fn perform_update(&self, start: i64, end: i64) -> UpdaterResult<()> {
        UpdateManager::perform_update(self, start, end).await
    }

    async fn shutdown(&self) -> UpdaterResult<()> {
        UpdateManager::shutdown(self).await
    }
}
