//! Request operations: files, locks, intents and notifications.

use std::path::Path;
use std::sync::Arc;

use archive_proto::{ClientPacket, ServerPacket};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{done_on, respond, Connection, NotificationRegistration, Offer, Reply};
use crate::error::{ConnectionError, ConnectionResult};
use crate::intent::{IntentHandle, IntentState};
use crate::listener::{IntentListener, NotificationListener};

const PREALLOCATE_LIMIT: u64 = 64 * 1024 * 1024;

impl Connection {
    /// Names under `path`, optionally only those modified after `modified_after`
    /// (milliseconds since the epoch).
    pub async fn list_files(
        &self,
        path: &str,
        modified_after: Option<i64>,
    ) -> ConnectionResult<Vec<String>> {
        self.request(
            ClientPacket::ListFiles {
                path: path.to_string(),
                modified_after,
            },
            respond(|packet| match packet {
                ServerPacket::ListResult { names } => Offer::Complete(Ok(Reply::Names(names))),
                other => Offer::Declined(other),
            }),
        )
        .await?
        .into_names()
    }

    /// Streams the contents of `name` into `sink` and returns the byte count.
    pub async fn read_data<W>(&self, name: &str, sink: &mut W) -> ConnectionResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let (chunks, mut received) = mpsc::unbounded_channel::<Bytes>();
        let missing = name.to_string();
        let receiver = self.enqueue(
            ClientPacket::ReadFile {
                name: name.to_string(),
            },
            respond(move |packet| match packet {
                ServerPacket::ReadFileData { data } => {
                    // The reader may have given up; the response still has to be drained.
                    let _ = chunks.send(data);
                    Offer::Consumed
                }
                ServerPacket::ReadFileEnd => Offer::Complete(Ok(Reply::Done)),
                ServerPacket::ReadFileNotFound => {
                    Offer::Complete(Err(ConnectionError::FileNotFound(missing.clone())))
                }
                other => Offer::Declined(other),
            }),
        )?;

        let mut total = 0u64;
        while let Some(chunk) = received.recv().await {
            sink.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        self.settle(receiver).await?;
        sink.flush().await?;
        trace!(name, bytes = total, "file read");
        Ok(total)
    }

    pub async fn read_bytes(&self, name: &str) -> ConnectionResult<Vec<u8>> {
        let mut contents = Vec::new();
        self.read_data(name, &mut contents).await?;
        Ok(contents)
    }

    /// Downloads `name` to `target`. A partially written file is removed on failure.
    pub async fn read_file(&self, name: &str, target: &Path) -> ConnectionResult<u64> {
        let mut file = tokio::fs::File::create(target).await?;
        match self.read_data(name, &mut file).await {
            Ok(total) => {
                file.sync_all().await?;
                Ok(total)
            }
            Err(err) => {
                drop(file);
                if let Err(remove_err) = tokio::fs::remove_file(target).await {
                    debug!(path = %target.display(), error = %remove_err, "partial file not removed");
                }
                Err(err)
            }
        }
    }

    pub async fn write_bytes(&self, name: &str, data: impl Into<Bytes>) -> ConnectionResult<()> {
        self.request(
            ClientPacket::WriteFile {
                name: name.to_string(),
                data: data.into(),
            },
            done_on(|packet| matches!(packet, ServerPacket::WriteFileComplete)),
        )
        .await
        .map(drop)
    }

    /// Uploads exactly `size` bytes from `source` as `name`.
    pub async fn write_data<R>(&self, name: &str, size: u64, source: &mut R) -> ConnectionResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::with_capacity(usize::try_from(size.min(PREALLOCATE_LIMIT)).unwrap_or(0));
        source.take(size).read_to_end(&mut data).await?;
        if (data.len() as u64) < size {
            return Err(ConnectionError::Io(format!(
                "source for {name} ended after {} of {size} bytes",
                data.len()
            )));
        }
        self.write_bytes(name, data).await
    }

    pub async fn write_file(&self, name: &str, source: &Path) -> ConnectionResult<()> {
        let data = tokio::fs::read(source).await?;
        self.write_bytes(name, data).await
    }

    pub async fn remove_file(&self, name: &str) -> ConnectionResult<()> {
        let missing = name.to_string();
        self.request(
            ClientPacket::RemoveFile {
                name: name.to_string(),
            },
            respond(move |packet| match packet {
                ServerPacket::RemoveFileComplete => Offer::Complete(Ok(Reply::Done)),
                ServerPacket::RemoveFileNotFound => {
                    Offer::Complete(Err(ConnectionError::FileNotFound(missing.clone())))
                }
                other => Offer::Declined(other),
            }),
        )
        .await
        .map(drop)
    }

    /// Takes a read lock on `[start, end)` of `key` for the open transaction.
    pub async fn lock_read(&self, key: &str, start: i64, end: i64) -> ConnectionResult<()> {
        self.request(
            ClientPacket::LockRead {
                key: key.to_string(),
                start,
                end,
            },
            respond(|packet| match packet {
                ServerPacket::ReadLockAcquired => Offer::Complete(Ok(Reply::Done)),
                ServerPacket::ReadLockDenied { status } => {
                    Offer::Complete(Err(ConnectionError::LockDenied(status)))
                }
                other => Offer::Declined(other),
            }),
        )
        .await
        .map(drop)
    }

    pub async fn lock_write(&self, key: &str, start: i64, end: i64) -> ConnectionResult<()> {
        self.request(
            ClientPacket::LockWrite {
                key: key.to_string(),
                start,
                end,
            },
            respond(|packet| match packet {
                ServerPacket::WriteLockAcquired => Offer::Complete(Ok(Reply::Done)),
                ServerPacket::WriteLockDenied { status } => {
                    Offer::Complete(Err(ConnectionError::LockDenied(status)))
                }
                other => Offer::Declined(other),
            }),
        )
        .await
        .map(drop)
    }

    /// Declares interest in `[start, end)` of `key`. A non-immediate acquisition
    /// inside a transaction is held only once the transaction commits; outside a
    /// transaction every acquisition is immediate.
    pub async fn acquire_intent(
        &self,
        key: &str,
        start: i64,
        end: i64,
        immediate: bool,
    ) -> ConnectionResult<IntentHandle> {
        let uid = self
            .request(
                ClientPacket::AcquireIntent {
                    key: key.to_string(),
                    start,
                    end,
                    immediate,
                },
                respond(|packet| match packet {
                    ServerPacket::IntentAcquired { uid } => Offer::Complete(Ok(Reply::Intent(uid))),
                    other => Offer::Declined(other),
                }),
            )
            .await?
            .into_intent()?;

        let state = Arc::new(IntentState::new(
            uid,
            key.to_string(),
            start,
            end,
            Arc::downgrade(&self.shared),
        ));
        match self.shared.ledger.lock().as_mut() {
            Some(ledger) if !immediate => ledger.record_acquire(&state),
            _ => state.set_realized(true),
        }
        trace!(uid, key, start, end, immediate, "intent acquired");
        Ok(IntentHandle::from_state(state))
    }

    pub async fn release_intent(&self, handle: IntentHandle, immediate: bool) -> ConnectionResult<()> {
        let uid = handle.uid();
        self.request(
            ClientPacket::ReleaseIntent { uid, immediate },
            done_on(|packet| matches!(packet, ServerPacket::IntentReleased)),
        )
        .await?;

        let state = Arc::clone(handle.state());
        let mut ledger = self.shared.ledger.lock();
        match ledger.as_mut() {
            Some(ledger) if !immediate => ledger.record_release(state),
            open => {
                if let Some(ledger) = open {
                    ledger.forget(uid);
                }
                state.set_realized(false);
            }
        }
        trace!(uid, immediate, "intent released");
        Ok(())
    }

    /// Announces a change to `[start, end)` of `key`. Inside a transaction the
    /// server delivers it on commit.
    pub async fn send_notification(&self, key: &str, start: i64, end: i64) -> ConnectionResult<()> {
        self.request(
            ClientPacket::SendNotification {
                key: key.to_string(),
                start,
                end,
            },
            None,
        )
        .await
        .map(drop)
    }

    /// Registers `listener` for notifications on `key`. Listeners for one key run
    /// in registration order. A synchronous listener delays the server's
    /// acknowledgement until every listener for the notification has returned.
    pub async fn listen_notification(
        &self,
        key: &str,
        listener: Arc<dyn NotificationListener>,
        synchronous: bool,
    ) -> ConnectionResult<()> {
        let first = {
            let mut registry = self.shared.registry.lock();
            let listeners = registry.notifications.entry(key.to_string()).or_default();
            listeners.push(NotificationRegistration {
                listener,
                synchronous,
            });
            listeners.len() == 1
        };
        if first {
            self.request(
                ClientPacket::ListenNotification {
                    key: key.to_string(),
                },
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Registers `listener` for intent hits on `key`.
    pub async fn listen_intent(
        &self,
        key: &str,
        listener: Arc<dyn IntentListener>,
    ) -> ConnectionResult<()> {
        let first = {
            let mut registry = self.shared.registry.lock();
            let listeners = registry.intents.entry(key.to_string()).or_default();
            listeners.push(listener);
            listeners.len() == 1
        };
        if first {
            self.request(
                ClientPacket::ListenIntent {
                    key: key.to_string(),
                },
                None,
            )
            .await?;
        }
        Ok(())
    }
}
