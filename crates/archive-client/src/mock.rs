//! In-memory archive server for tests.
//!
//! Serves the real wire protocol over `tokio::io::duplex` pipes, so every
//! [`Connection`] created through [`MockServer::connect`] runs the production
//! run loop. Files, range locks, intents and notifications are shared between all
//! connections of one server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use archive_proto::{server_handshake, ClientPacket, ServerPacket, MAX_CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{Connection, ConnectionOptions};
use crate::error::ConnectionResult;

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Clone, Default)]
pub struct MockServer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<ServerState>,
    stalled: AtomicBool,
}

#[derive(Default)]
struct ServerState {
    files: BTreeMap<String, StoredFile>,
    last_modified: i64,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    locks: Vec<HeldLock>,
    intents: BTreeMap<u64, HeldIntent>,
    next_uid: u64,
    next_ack: u64,
    acknowledged: Vec<u64>,
}

struct StoredFile {
    data: Bytes,
    modified: i64,
}

struct Session {
    name: String,
    outbound: mpsc::UnboundedSender<ServerPacket>,
    listening: HashSet<String>,
    transaction: Option<OpenTransaction>,
}

#[derive(Default)]
struct OpenTransaction {
    status: String,
    notifications: Vec<(String, i64, i64)>,
    intent_changes: Vec<IntentChange>,
}

enum IntentChange {
    Acquire(u64, HeldIntent),
    Release(u64),
}

#[derive(Clone)]
struct HeldIntent {
    session: u64,
    key: String,
    start: i64,
    end: i64,
}

struct HeldLock {
    session: u64,
    key: String,
    start: i64,
    end: i64,
    write: bool,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, name: &str) -> ConnectionResult<Connection> {
        self.connect_with(name, ConnectionOptions::default()).await
    }

    pub async fn connect_with(
        &self,
        name: &str,
        options: ConnectionOptions,
    ) -> ConnectionResult<Connection> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(serve(Arc::clone(&self.inner), server));
        Connection::startup(client, name, options).await
    }

    /// Stops answering anything, heartbeats included.
    pub fn stall(&self) {
        self.inner.stalled.store(true, Ordering::Release);
    }

    /// Stores a file directly and returns its modification time.
    pub fn put_file(&self, name: &str, data: impl Into<Bytes>) -> i64 {
        self.inner.state.lock().store(name.to_string(), data.into())
    }

    pub fn file(&self, name: &str) -> Option<Bytes> {
        self.inner
            .state
            .lock()
            .files
            .get(name)
            .map(|file| file.data.clone())
    }

    /// Sends a notification to every listening connection, as if another client
    /// had committed it.
    pub fn notify(&self, key: &str, start: i64, end: i64) {
        self.inner.state.lock().deliver(key, start, end);
    }

    /// Acknowledgement ids received so far, in arrival order.
    pub fn acknowledged(&self) -> Vec<u64> {
        self.inner.state.lock().acknowledged.clone()
    }

    /// Ranges of the intents currently held on `key`, sorted.
    pub fn held_intents(&self, key: &str) -> Vec<(i64, i64)> {
        let state = self.inner.state.lock();
        let mut ranges: Vec<_> = state
            .intents
            .values()
            .filter(|intent| intent.key == key)
            .map(|intent| (intent.start, intent.end))
            .collect();
        ranges.sort_unstable();
        ranges
    }

    /// Names of the connections holding an open transaction, sorted.
    pub fn open_transactions(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<_> = state
            .sessions
            .values()
            .filter(|session| session.transaction.is_some())
            .map(|session| session.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn session_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<_> = state
            .sessions
            .values()
            .map(|session| session.name.clone())
            .collect();
        names.sort();
        names
    }
}

async fn serve(inner: Arc<Inner>, mut stream: DuplexStream) {
    let name = match server_handshake(&mut stream).await {
        Ok(name) => name,
        Err(err) => {
            debug!(error = %err, "mock handshake failed");
            return;
        }
    };
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound, mut queued) = mpsc::unbounded_channel::<ServerPacket>();
    let id = inner.state.lock().register(name, outbound);

    let writer_task = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(packet) = queued.recv().await {
            buf.clear();
            if let Err(err) = packet.encode(&mut buf) {
                debug!(error = %err, "mock reply not encodable");
                break;
            }
            if writer.write_all(&buf).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    while let Ok(packet) = ClientPacket::read(&mut reader).await {
        if inner.stalled.load(Ordering::Acquire) {
            continue;
        }
        if packet == ClientPacket::Close {
            break;
        }
        inner.state.lock().handle(id, packet);
    }
    inner.state.lock().disconnect(id);
    let _ = writer_task.await;
}

impl ServerState {
    fn register(&mut self, name: String, outbound: mpsc::UnboundedSender<ServerPacket>) -> u64 {
        self.next_session += 1;
        self.sessions.insert(
            self.next_session,
            Session {
                name,
                outbound,
                listening: HashSet::new(),
                transaction: None,
            },
        );
        self.next_session
    }

    fn disconnect(&mut self, id: u64) {
        self.finish(id);
        self.sessions.remove(&id);
        self.intents.retain(|_, intent| intent.session != id);
    }

    fn send(&self, id: u64, packet: ServerPacket) {
        if let Some(session) = self.sessions.get(&id) {
            let _ = session.outbound.send(packet);
        }
    }

    fn transaction_mut(&mut self, id: u64) -> Option<&mut OpenTransaction> {
        self.sessions
            .get_mut(&id)
            .and_then(|session| session.transaction.as_mut())
    }

    fn store(&mut self, name: String, data: Bytes) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or_default();
        self.last_modified = now.max(self.last_modified + 1);
        self.files.insert(
            name,
            StoredFile {
                data,
                modified: self.last_modified,
            },
        );
        self.last_modified
    }

    fn handle(&mut self, id: u64, packet: ClientPacket) {
        match packet {
            ClientPacket::Heartbeat => self.send(id, ServerPacket::Heartbeat),
            ClientPacket::ListFiles {
                path,
                modified_after,
            } => {
                let names = self
                    .files
                    .iter()
                    .filter(|(name, file)| {
                        name.starts_with(&path)
                            && modified_after.map_or(true, |after| file.modified > after)
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                self.send(id, ServerPacket::ListResult { names });
            }
            ClientPacket::TransactionBegin { .. } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.transaction = Some(OpenTransaction::default());
                }
                self.send(id, ServerPacket::TransactionStarted);
            }
            ClientPacket::TransactionCommit => {
                self.commit(id);
                self.send(id, ServerPacket::TransactionComplete);
            }
            ClientPacket::TransactionAbort => {
                self.finish(id);
                self.send(id, ServerPacket::TransactionAborted);
            }
            ClientPacket::SetTransactionStatus { status } => {
                if let Some(transaction) = self.transaction_mut(id) {
                    transaction.status = status;
                }
            }
            ClientPacket::ReadFile { name } => {
                let Some(data) = self.files.get(&name).map(|file| file.data.clone()) else {
                    self.send(id, ServerPacket::ReadFileNotFound);
                    return;
                };
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + MAX_CHUNK_SIZE).min(data.len());
                    self.send(
                        id,
                        ServerPacket::ReadFileData {
                            data: data.slice(offset..end),
                        },
                    );
                    offset = end;
                }
                self.send(id, ServerPacket::ReadFileEnd);
            }
            ClientPacket::WriteFile { name, data } => {
                self.store(name, data);
                self.send(id, ServerPacket::WriteFileComplete);
            }
            ClientPacket::RemoveFile { name } => {
                let reply = match self.files.remove(&name) {
                    Some(_) => ServerPacket::RemoveFileComplete,
                    None => ServerPacket::RemoveFileNotFound,
                };
                self.send(id, reply);
            }
            ClientPacket::LockRead { key, start, end } => {
                let reply = match self.lock(id, key, start, end, false) {
                    Ok(()) => ServerPacket::ReadLockAcquired,
                    Err(status) => ServerPacket::ReadLockDenied { status },
                };
                self.send(id, reply);
            }
            ClientPacket::LockWrite { key, start, end } => {
                let reply = match self.lock(id, key, start, end, true) {
                    Ok(()) => ServerPacket::WriteLockAcquired,
                    Err(status) => ServerPacket::WriteLockDenied { status },
                };
                self.send(id, reply);
            }
            ClientPacket::AcquireIntent {
                key,
                start,
                end,
                immediate,
            } => {
                self.next_uid += 1;
                let uid = self.next_uid;
                let intent = HeldIntent {
                    session: id,
                    key,
                    start,
                    end,
                };
                match self.transaction_mut(id) {
                    Some(transaction) if !immediate => transaction
                        .intent_changes
                        .push(IntentChange::Acquire(uid, intent)),
                    _ => {
                        self.intents.insert(uid, intent);
                    }
                }
                self.send(id, ServerPacket::IntentAcquired { uid });
            }
            ClientPacket::ReleaseIntent { uid, immediate } => {
                match self.transaction_mut(id) {
                    Some(transaction) if !immediate => {
                        transaction.intent_changes.push(IntentChange::Release(uid))
                    }
                    _ => {
                        self.intents.remove(&uid);
                    }
                }
                self.send(id, ServerPacket::IntentReleased);
            }
            ClientPacket::SendNotification { key, start, end } => match self.transaction_mut(id) {
                Some(transaction) => transaction.notifications.push((key, start, end)),
                None => self.deliver(&key, start, end),
            },
            ClientPacket::ListenNotification { key } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.listening.insert(key);
                }
            }
            // Intent hits go to the intent's owner whether or not it listens.
            ClientPacket::ListenIntent { .. } => {}
            ClientPacket::AcknowledgeNotification { ack } => self.acknowledged.push(ack),
            ClientPacket::Close => {}
        }
    }

    /// Grants the lock unless another session holds a conflicting one, in which
    /// case the holder's transaction status comes back.
    fn lock(&mut self, id: u64, key: String, start: i64, end: i64, write: bool) -> Result<(), String> {
        let conflict = self.locks.iter().find(|held| {
            held.session != id
                && held.key == key
                && held.start < end
                && start < held.end
                && (write || held.write)
        });
        if let Some(held) = conflict {
            let status = self
                .sessions
                .get(&held.session)
                .and_then(|session| session.transaction.as_ref())
                .map(|transaction| transaction.status.clone())
                .unwrap_or_default();
            return Err(status);
        }
        if self.transaction_mut(id).is_some() {
            self.locks.push(HeldLock {
                session: id,
                key,
                start,
                end,
                write,
            });
        }
        Ok(())
    }

    fn commit(&mut self, id: u64) {
        let Some(transaction) = self
            .sessions
            .get_mut(&id)
            .and_then(|session| session.transaction.take())
        else {
            return;
        };
        for change in transaction.intent_changes {
            match change {
                IntentChange::Acquire(uid, intent) => {
                    self.intents.insert(uid, intent);
                }
                IntentChange::Release(uid) => {
                    self.intents.remove(&uid);
                }
            }
        }

        let written: Vec<_> = self
            .locks
            .iter()
            .filter(|held| held.session == id && held.write)
            .map(|held| (held.key.clone(), held.start, held.end))
            .collect();
        for (key, start, end) in written {
            let hits: Vec<_> = self
                .intents
                .values()
                .filter(|intent| {
                    intent.session != id
                        && intent.key == key
                        && intent.start < end
                        && start < intent.end
                })
                .map(|intent| {
                    (
                        intent.session,
                        ServerPacket::IntentHit {
                            key: key.clone(),
                            start: intent.start.max(start),
                            end: intent.end.min(end),
                        },
                    )
                })
                .collect();
            for (session, hit) in hits {
                self.send(session, hit);
            }
        }

        self.locks.retain(|held| held.session != id);
        for (key, start, end) in transaction.notifications {
            self.deliver(&key, start, end);
        }
    }

    fn finish(&mut self, id: u64) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.transaction = None;
        }
        self.locks.retain(|held| held.session != id);
    }

    fn deliver(&mut self, key: &str, start: i64, end: i64) {
        let listeners: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.listening.contains(key))
            .map(|(id, _)| *id)
            .collect();
        for id in listeners {
            self.next_ack += 1;
            let ack = self.next_ack;
            self.send(
                id,
                ServerPacket::NotificationReceived {
                    key: key.to_string(),
                    start,
                    end,
                    ack,
                },
            );
        }
    }
}
