//! Transactions and the intent bookkeeping that rides on them.
//!
//! The server applies non-immediate intent changes only when the transaction
//! commits. The [`TransactionLedger`] mirrors that on the client so each
//! [`IntentHandle`] knows whether it is actually held.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use archive_proto::{ClientPacket, ServerPacket};
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::connection::{done_on, respond, Connection, Offer, Reply, ResponseHandler};
use crate::error::{ConnectionError, ConnectionResult};
use crate::intent::{IntentHandle, IntentState};

enum IntentChange {
    Acquired(Weak<IntentState>),
    Released(Arc<IntentState>),
}

/// Intent changes made inside the open transaction, keyed by intent uid.
#[derive(Default)]
pub(crate) struct TransactionLedger {
    changes: BTreeMap<u64, IntentChange>,
}

impl TransactionLedger {
    pub(crate) fn record_acquire(&mut self, state: &Arc<IntentState>) {
        self.changes
            .insert(state.uid, IntentChange::Acquired(Arc::downgrade(state)));
    }

    pub(crate) fn record_release(&mut self, state: Arc<IntentState>) {
        match self.changes.remove(&state.uid) {
            // Acquired and released in the same transaction: the server never
            // holds it either way.
            Some(IntentChange::Acquired(_)) => state.set_realized(false),
            _ => {
                state.set_releasing(true);
                self.changes.insert(state.uid, IntentChange::Released(state));
            }
        }
    }

    pub(crate) fn forget(&mut self, uid: u64) {
        self.changes.remove(&uid);
    }

    fn commit(self) {
        for (uid, change) in self.changes {
            match change {
                IntentChange::Acquired(weak) => match weak.upgrade() {
                    Some(state) => state.set_realized(true),
                    None => error!(uid, "intent committed after its handle was dropped"),
                },
                IntentChange::Released(state) => {
                    state.set_realized(false);
                    state.set_releasing(false);
                }
            }
        }
    }

    /// Rolls back: intents whose release was undone come back as live handles.
    fn abort(self) -> Vec<IntentHandle> {
        self.changes
            .into_values()
            .filter_map(|change| match change {
                IntentChange::Released(state) => {
                    state.set_releasing(false);
                    Some(IntentHandle::from_state(state))
                }
                IntentChange::Acquired(_) => None,
            })
            .collect()
    }
}

impl Connection {
    /// Opens a transaction. Fails with [`ConnectionError::TransactionOpen`] when one
    /// is already open on this connection.
    pub async fn transaction_begin(&self, write: bool) -> ConnectionResult<()> {
        let receiver = {
            let mut ledger = self.shared.ledger.lock();
            if ledger.is_some() {
                return Err(ConnectionError::TransactionOpen);
            }
            let receiver = self.enqueue(
                ClientPacket::TransactionBegin { write },
                done_on(|packet| matches!(packet, ServerPacket::TransactionStarted)),
            )?;
            *ledger = Some(TransactionLedger::default());
            receiver
        };
        PendingBegin {
            connection: self,
            receiver,
            settled: false,
        }
        .settle()
        .await
    }

    /// Commits the open transaction. The commit goes out even if the caller stops
    /// waiting, and intent bookkeeping follows the server's answer.
    pub async fn transaction_commit(&self) -> ConnectionResult<()> {
        let receiver = {
            let mut slot = self.shared.ledger.lock();
            let ledger = slot.take().ok_or(ConnectionError::NoTransaction)?;
            self.enqueue(ClientPacket::TransactionCommit, settle_commit(ledger))?
        };
        self.settle(receiver).await.map(drop)
    }

    /// Aborts the open transaction and returns the intents whose release it
    /// rolled back. They are held again and must be released by the caller.
    pub async fn transaction_abort(&self) -> ConnectionResult<Vec<IntentHandle>> {
        let receiver = {
            let mut slot = self.shared.ledger.lock();
            let ledger = slot.take().ok_or(ConnectionError::NoTransaction)?;
            self.enqueue(ClientPacket::TransactionAbort, settle_abort(ledger))?
        };
        self.settle(receiver).await?.into_rolled_back()
    }

    /// Sets the status string other clients see when this transaction denies them a lock.
    pub async fn set_transaction_status(&self, status: impl Into<String>) -> ConnectionResult<()> {
        self.request(
            ClientPacket::SetTransactionStatus {
                status: status.into(),
            },
            None,
        )
        .await
        .map(drop)
    }

    /// Waits for any other transaction on this connection to finish, then opens one.
    pub async fn begin_transaction(&self, write: bool) -> ConnectionResult<Transaction> {
        let gate = Arc::clone(&self.shared.transaction_gate).lock_owned().await;
        self.transaction_begin(write).await?;
        Ok(Transaction {
            connection: self.clone(),
            _gate: gate,
            finished: false,
        })
    }

    /// Runs `body` inside a transaction, committing on `Ok` and aborting on `Err`.
    /// Intents whose release the abort rolled back are released immediately.
    pub async fn transaction<T, E, F, Fut>(&self, write: bool, body: F) -> Result<T, E>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ConnectionError>,
    {
        let transaction = self.begin_transaction(write).await?;
        match body(self.clone()).await {
            Ok(value) => {
                transaction.commit().await?;
                Ok(value)
            }
            Err(err) => {
                match transaction.abort().await {
                    Ok(rolled_back) => {
                        if let Err(release_err) = self.release_all(rolled_back).await {
                            warn!(error = %release_err, "releasing rolled back intents failed");
                        }
                    }
                    Err(abort_err) => debug!(error = %abort_err, "abort after failed body"),
                }
                Err(err)
            }
        }
    }

    /// Releases every handle immediately, returning the first failure.
    pub async fn release_all(&self, handles: Vec<IntentHandle>) -> ConnectionResult<()> {
        let mut first_error = None;
        for handle in handles {
            if let Err(err) = handle.release(self, true).await {
                warn!(error = %err, "intent release failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// An open transaction holding this connection's transaction slot.
///
/// Dropping it without [`Transaction::commit`] or [`Transaction::abort`] queues
/// an abort, and the intents that abort rolls back are released for you.
pub struct Transaction {
    connection: Connection,
    _gate: OwnedMutexGuard<()>,
    finished: bool,
}

impl Transaction {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn set_status(&self, status: impl Into<String>) -> ConnectionResult<()> {
        self.connection.set_transaction_status(status).await
    }

    pub async fn commit(mut self) -> ConnectionResult<()> {
        self.finished = true;
        self.connection.transaction_commit().await
    }

    pub async fn abort(mut self) -> ConnectionResult<Vec<IntentHandle>> {
        self.finished = true;
        self.connection.transaction_abort().await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Queued under the ledger lock so no later begin can overtake the abort.
        let mut slot = self.connection.shared.ledger.lock();
        let Some(ledger) = slot.take() else {
            return;
        };
        warn!(name = %self.connection.name(), "transaction dropped while open, aborting");
        // Nobody claims the rolled back intents, so the run loop releases them.
        if let Err(err) = self
            .connection
            .enqueue(ClientPacket::TransactionAbort, settle_abort(ledger))
        {
            debug!(error = %err, "abort for dropped transaction not queued");
        }
    }
}

/// A begin request in flight. Dropped before it settles, it gives the transaction
/// slot back and aborts on the server if the begin had already gone through.
struct PendingBegin<'a> {
    connection: &'a Connection,
    receiver: oneshot::Receiver<ConnectionResult<Reply>>,
    settled: bool,
}

impl PendingBegin<'_> {
    async fn settle(mut self) -> ConnectionResult<()> {
        let result = match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(self.connection.shared.failure()),
        };
        self.settled = true;
        if result.is_err() {
            self.connection.shared.ledger.lock().take();
        }
        result.map(drop)
    }
}

impl Drop for PendingBegin<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // After close() the run loop either delivered the reply already or learns
        // that nobody is waiting and undoes the begin itself.
        self.receiver.close();
        let mut slot = self.connection.shared.ledger.lock();
        slot.take();
        if let Ok(Ok(_)) = self.receiver.try_recv() {
            debug!(name = %self.connection.name(), "begin cancelled after it started, aborting");
            let queued = self.connection.enqueue(
                ClientPacket::TransactionAbort,
                settle_abort(TransactionLedger::default()),
            );
            if let Err(err) = queued {
                debug!(error = %err, "abort for cancelled begin not queued");
            }
        }
    }
}

/// Applies the ledger once the server confirms the commit.
fn settle_commit(ledger: TransactionLedger) -> Option<ResponseHandler> {
    let mut ledger = Some(ledger);
    respond(move |packet| match packet {
        ServerPacket::TransactionComplete => {
            if let Some(ledger) = ledger.take() {
                ledger.commit();
            }
            Offer::Complete(Ok(Reply::Done))
        }
        other => Offer::Declined(other),
    })
}

fn settle_abort(ledger: TransactionLedger) -> Option<ResponseHandler> {
    let mut ledger = Some(ledger);
    respond(move |packet| match packet {
        ServerPacket::TransactionAborted => {
            let rolled_back = ledger.take().map(TransactionLedger::abort).unwrap_or_default();
            Offer::Complete(Ok(Reply::RolledBack(rolled_back)))
        }
        other => Offer::Declined(other),
    })
}
