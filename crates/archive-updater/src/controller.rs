//! Round-robin scheduler running one station update per write transaction.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use archive_client::{Connection, LockBackoff, Transaction};
use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::error::{UpdaterError, UpdaterResult};
use crate::manager::{Station, UpdateManager};
use crate::metrics;
use crate::policy::UpdatePolicy;

/// Outcome of one [`StationsController::do_any_update`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateProgress {
    Updated(String),
    /// The station was refused a lock; its range is queued again.
    Denied(String),
    Idle,
}

/// Called while the controller has nothing to run, e.g. to ping a service watchdog.
#[async_trait]
pub trait IdleHook: Send {
    fn cadence(&self) -> Duration;
    async fn on_idle(&mut self);
}

pub struct StationsController {
    connection: Connection,
    stations: VecDeque<Box<dyn Station>>,
    wake: Arc<Notify>,
    state_dir: PathBuf,
    idle_poll: Duration,
}

impl StationsController {
    pub fn new(connection: Connection, config: &UpdaterConfig) -> Self {
        Self {
            connection,
            stations: VecDeque::new(),
            wake: Arc::new(Notify::new()),
            state_dir: config.state_dir.clone(),
            idle_poll: config.idle_poll,
        }
    }

    /// Creates a manager for `policy` on the controller's connection and appends
    /// it to the rotation. The returned handle shares state with the scheduled one.
    pub fn add<P: UpdatePolicy>(&mut self, policy: P) -> UpdateManager<P> {
        let manager = UpdateManager::new(
            policy,
            self.connection.clone(),
            &self.state_dir,
            Arc::clone(&self.wake),
        );
        self.stations.push_back(Box::new(manager.clone()));
        manager
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Station names in the order the next pass will ask them.
    pub fn order(&self) -> Vec<String> {
        self.stations
            .iter()
            .map(|station| station.name().to_string())
            .collect()
    }

    /// Registers every station's listeners and loads its backlog.
    pub async fn start(&self) -> UpdaterResult<()> {
        for station in &self.stations {
            station.start().await?;
        }
        info!(stations = self.stations.len(), "stations started");
        Ok(())
    }

    /// Opens a write transaction and runs the first ready update in rotation order.
    ///
    /// A station refused a lock goes to the back of the rotation and its range is
    /// reinstated. Any other failure is reinstated too and returned.
    pub async fn do_any_update(&mut self) -> UpdaterResult<UpdateProgress> {
        let transaction = self.connection.begin_transaction(true).await?;

        let mut found = None;
        for (index, station) in self.stations.iter().enumerate() {
            match station.next_update().await {
                Ok(Some(ticket)) => {
                    found = Some((index, ticket));
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    self.abandon(transaction).await;
                    return Err(err);
                }
            }
        }
        let Some((index, ticket)) = found else {
            transaction.commit().await?;
            return Ok(UpdateProgress::Idle);
        };

        let name = ticket.station().to_string();
        let (start, end) = ticket.bounds();
        let station = &self.stations[index];
        let status = format!("updating {name} {start}..{end}");
        let performed = match transaction.set_status(status).await {
            Ok(()) => station.perform_update(start, end).await,
            Err(err) => Err(err.into()),
        };

        let failure = match performed {
            Ok(()) => match transaction.commit().await {
                Ok(()) => {
                    ticket.complete().await?;
                    metrics::UPDATES_COMPLETED.with_label_values(&[&name]).inc();
                    info!(station = %name, start, end, "update complete");
                    return Ok(UpdateProgress::Updated(name));
                }
                Err(err) => UpdaterError::from(err),
            },
            Err(err) => {
                self.abandon(transaction).await;
                err
            }
        };
        ticket.reinstate().await?;

        if failure.is_lock_denied() {
            metrics::LOCK_DENIED.with_label_values(&[&name]).inc();
            debug!(station = %name, error = %failure, "update denied a lock");
            if let Some(station) = self.stations.remove(index) {
                self.stations.push_back(station);
            }
            return Ok(UpdateProgress::Denied(name));
        }
        metrics::UPDATES_FAILED.with_label_values(&[&name]).inc();
        warn!(station = %name, start, end, error = %failure, "update failed");
        Err(failure)
    }

    /// Runs updates until `shutdown` turns true, its sender goes away, or a
    /// station has been shut down.
    ///
    /// Lock denials back off with jitter. With nothing to do the controller waits
    /// for a station to report ready work, calling `idle` at its cadence if given.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut idle: Option<&mut dyn IdleHook>,
    ) -> UpdaterResult<()> {
        let mut backoff = LockBackoff::new();
        while !stop_requested(&shutdown) {
            let progress = match self.do_any_update().await {
                Err(UpdaterError::ShuttingDown) => break,
                other => other?,
            };
            match progress {
                UpdateProgress::Updated(_) => backoff.clear(),
                UpdateProgress::Denied(_) => {
                    tokio::select! {
                        _ = backoff.wait() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                UpdateProgress::Idle => {
                    backoff.clear();
                    self.wait_for_work(&mut shutdown, idle.as_deref_mut()).await;
                }
            }
        }
        info!("update loop stopped");
        Ok(())
    }

    async fn wait_for_work(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        idle: Option<&mut (dyn IdleHook + '_)>,
    ) {
        match idle {
            Some(hook) => {
                let cadence = hook.cadence();
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(cadence) => hook.on_idle().await,
                }
            }
            None => {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.idle_poll) => {}
                }
            }
        }
    }

    /// Aborts `transaction` and force-releases the intents it handed back.
    async fn abandon(&self, transaction: Transaction) {
        match transaction.abort().await {
            Ok(rolled_back) => {
                if let Err(err) = self.connection.release_all(rolled_back).await {
                    warn!(error = %err, "releasing rolled back intents failed");
                }
            }
            Err(err) => warn!(error = %err, "transaction abort failed"),
        }
    }

    /// Shuts every station down, returning the first failure.
    pub async fn shutdown(&self) -> UpdaterResult<()> {
        let mut first_error = None;
        for station in &self.stations {
            if let Err(err) = station.shutdown().await {
                warn!(station = station.name(), error = %err, "station shutdown failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}
