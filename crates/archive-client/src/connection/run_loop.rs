use std::collections::VecDeque;
use std::sync::Arc;

use archive_proto::{ClientPacket, ServerPacket, WireError};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use super::{
    Command, ConnectionOptions, NotificationRegistration, Offer, Reply, Request, ResponseHandler,
    Shared,
};
use crate::error::{ConnectionError, ConnectionResult};
use crate::listener::{IntentHit, IntentListener, Notification};

pub(super) type PacketReader = Box<dyn AsyncRead + Send + Unpin>;
pub(super) type PacketWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Inbound = Result<ServerPacket, WireError>;

/// Decodes server packets until the stream fails or the run loop goes away.
pub(super) async fn read_packets(mut reader: PacketReader, inbound: mpsc::Sender<Inbound>) {
    loop {
        let result = ServerPacket::read(&mut reader).await;
        let failed = result.is_err();
        if inbound.send(result).await.is_err() || failed {
            break;
        }
    }
}

struct ActiveRequest {
    handler: ResponseHandler,
    done: oneshot::Sender<ConnectionResult<Reply>>,
    /// Sent if the request succeeds after its caller has gone away.
    undo: Option<ClientPacket>,
}

enum Callback {
    Notification {
        notification: Notification,
        listeners: Vec<NotificationRegistration>,
        ack: Option<u64>,
    },
    IntentHit {
        hit: IntentHit,
        listeners: Vec<Arc<dyn IntentListener>>,
    },
}

struct RunningCallback {
    task: JoinHandle<()>,
    /// Sent once the listeners have returned.
    ack: Option<u64>,
}

enum Exit {
    Shutdown(oneshot::Sender<ConnectionResult<()>>),
    Released,
}

pub(super) struct RunLoop {
    shared: Arc<Shared>,
    writer: PacketWriter,
    inbound: mpsc::Receiver<Inbound>,
    commands: mpsc::UnboundedReceiver<Command>,
    reader: AbortHandle,
    options: ConnectionOptions,
    active: Option<ActiveRequest>,
    callbacks: VecDeque<Callback>,
    running_callback: Option<RunningCallback>,
    /// Cleanup requests owed to the server, sent ahead of queued commands.
    compensations: VecDeque<ClientPacket>,
    outstanding_heartbeats: u32,
}

impl RunLoop {
    pub(super) fn new(
        shared: Arc<Shared>,
        writer: PacketWriter,
        inbound: mpsc::Receiver<Inbound>,
        commands: mpsc::UnboundedReceiver<Command>,
        reader: AbortHandle,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            shared,
            writer,
            inbound,
            commands,
            reader,
            options,
            active: None,
            callbacks: VecDeque::new(),
            running_callback: None,
            compensations: VecDeque::new(),
            outstanding_heartbeats: 0,
        }
    }

    pub(super) async fn run(mut self) {
        let outcome = self.drive().await;
        let error = match &outcome {
            Ok(_) => {
                debug!(name = %self.shared.name, "connection closed");
                ConnectionError::Closed
            }
            Err(err) => {
                warn!(name = %self.shared.name, error = %err, "connection failed");
                err.clone()
            }
        };
        self.teardown(error);
        if let Ok(Exit::Shutdown(reply)) = outcome {
            let _ = reply.send(Ok(()));
        }
    }

    async fn drive(&mut self) -> ConnectionResult<Exit> {
        let period = self.options.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.active.is_none() {
                if let Some(packet) = self.compensations.pop_front() {
                    self.start_compensation(packet).await?;
                    continue;
                }
            }
            let silence_deadline =
                self.shared.activity.last_received() + self.options.read_timeout;

            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Ok(packet)) => self.dispatch(packet).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(ConnectionError::Closed),
                },
                joined = join_callback(&mut self.running_callback) => {
                    let finished = self.running_callback.take();
                    self.finish_callback(joined, finished.and_then(|running| running.ack)).await?;
                }
                command = self.commands.recv(), if self.active.is_none() => match command {
                    Some(Command::Request(request)) => self.start_request(request).await?,
                    Some(Command::Shutdown(reply)) => {
                        self.close().await;
                        return Ok(Exit::Shutdown(reply));
                    }
                    None => {
                        self.close().await;
                        return Ok(Exit::Released);
                    }
                },
                _ = heartbeat.tick() => self.heartbeat().await?,
                _ = sleep_until(silence_deadline) => {
                    return Err(ConnectionError::Timeout(format!(
                        "no data from server for {}ms",
                        self.options.read_timeout.as_millis()
                    )));
                }
            }
        }
    }

    async fn dispatch(&mut self, packet: ServerPacket) -> ConnectionResult<()> {
        self.shared.activity.mark_received();
        let packet = match self.active.as_mut() {
            Some(active) if !is_unsolicited(&packet) => match (active.handler)(packet) {
                Offer::Complete(result) => {
                    self.complete(result);
                    return Ok(());
                }
                Offer::Consumed => return Ok(()),
                Offer::Declined(packet) => packet,
            },
            _ => packet,
        };

        match packet {
            ServerPacket::Heartbeat => {
                self.outstanding_heartbeats = 0;
                Ok(())
            }
            ServerPacket::NotificationReceived {
                key,
                start,
                end,
                ack,
            } => self.queue_notification(Notification { key, start, end }, ack).await,
            ServerPacket::IntentHit { key, start, end } => {
                self.queue_intent_hit(IntentHit { key, start, end });
                Ok(())
            }
            other => Err(ConnectionError::UnexpectedPacket(describe(&other))),
        }
    }

    fn complete(&mut self, result: ConnectionResult<Reply>) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.shared.activity.request_finished();
        if let Err(Ok(reply)) = active.done.send(result) {
            self.unclaimed(reply, active.undo);
        }
    }

    /// The server acted on a request whose caller has gone away; queue whatever
    /// puts the server back the way that caller would have left it.
    fn unclaimed(&mut self, reply: Reply, undo: Option<ClientPacket>) {
        if let Some(undo) = undo {
            debug!(name = %self.shared.name, ?undo, "undoing request abandoned after it ran");
            self.compensations.push_back(undo);
        }
        if let Reply::RolledBack(handles) = reply {
            for handle in handles {
                self.compensations.push_back(ClientPacket::ReleaseIntent {
                    uid: handle.disown(),
                    immediate: true,
                });
            }
        }
    }

    async fn start_compensation(&mut self, packet: ClientPacket) -> ConnectionResult<()> {
        let bytes = encode(&packet)?;
        self.write_bytes(&bytes).await?;
        if packet.expects_response() {
            self.shared.activity.request_started();
            let (done, _) = oneshot::channel();
            self.active = Some(ActiveRequest {
                handler: Box::new(|packet: ServerPacket| match packet {
                    ServerPacket::TransactionAborted | ServerPacket::IntentReleased => {
                        Offer::Complete(Ok(Reply::Done))
                    }
                    other => Offer::Declined(other),
                }),
                done,
                undo: None,
            });
        }
        Ok(())
    }

    async fn start_request(&mut self, request: Request) -> ConnectionResult<()> {
        let Request {
            packet,
            handler,
            done,
        } = request;
        if done.is_closed() && abandonable(&packet) {
            trace!(?packet, "skipping abandoned request");
            return Ok(());
        }
        // Unencodable requests fail on their own; nothing reached the socket.
        let bytes = match encode(&packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = done.send(Err(err.into()));
                return Ok(());
            }
        };
        if let Err(err) = self.write_bytes(&bytes).await {
            self.shared.mark_closed(err.clone());
            let _ = done.send(Err(err.clone()));
            return Err(err);
        }
        match handler {
            Some(handler) if packet.expects_response() => {
                self.shared.activity.request_started();
                self.active = Some(ActiveRequest {
                    handler,
                    done,
                    undo: undo_for(&packet),
                });
            }
            _ => {
                let _ = done.send(Ok(Reply::Done));
            }
        }
        Ok(())
    }

    /// Sends a heartbeat unless too many are unanswered.
    async fn heartbeat(&mut self) -> ConnectionResult<()> {
        if self.outstanding_heartbeats < self.options.max_outstanding_heartbeats {
            self.write(&ClientPacket::Heartbeat).await?;
            self.outstanding_heartbeats += 1;
        }
        Ok(())
    }

    async fn queue_notification(
        &mut self,
        notification: Notification,
        ack: u64,
    ) -> ConnectionResult<()> {
        let listeners = self
            .shared
            .registry
            .lock()
            .notifications
            .get(&notification.key)
            .cloned()
            .unwrap_or_default();
        let ack = (ack != 0).then_some(ack);

        // Only synchronous listeners hold the acknowledgement back.
        let deferred = if listeners.iter().any(|registration| registration.synchronous) {
            ack
        } else {
            if let Some(ack) = ack {
                self.write(&ClientPacket::AcknowledgeNotification { ack }).await?;
            }
            None
        };

        if listeners.is_empty() {
            debug!(key = %notification.key, "notification without listeners");
            return Ok(());
        }
        self.callbacks.push_back(Callback::Notification {
            notification,
            listeners,
            ack: deferred,
        });
        self.start_next_callback();
        Ok(())
    }

    fn queue_intent_hit(&mut self, hit: IntentHit) {
        let listeners = self
            .shared
            .registry
            .lock()
            .intents
            .get(&hit.key)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(key = %hit.key, "intent hit without listeners");
            return;
        }
        self.callbacks.push_back(Callback::IntentHit { hit, listeners });
        self.start_next_callback();
    }

    fn start_next_callback(&mut self) {
        if self.running_callback.is_some() {
            return;
        }
        let Some(callback) = self.callbacks.pop_front() else {
            return;
        };
        // Checked under the slot lock so `Connection::abort` cannot miss a new task.
        let mut slot = self.shared.callback.lock();
        if self.shared.is_closed() {
            return;
        }
        let running = callback.spawn();
        *slot = Some(running.task.abort_handle());
        drop(slot);
        self.running_callback = Some(running);
    }

    async fn finish_callback(
        &mut self,
        joined: Result<(), JoinError>,
        ack: Option<u64>,
    ) -> ConnectionResult<()> {
        self.shared.callback.lock().take();
        if let Err(err) = joined {
            if err.is_panic() {
                error!(name = %self.shared.name, "listener panicked");
            }
        }
        if let Some(ack) = ack {
            self.write(&ClientPacket::AcknowledgeNotification { ack }).await?;
        }
        self.start_next_callback();
        Ok(())
    }

    async fn write(&mut self, packet: &ClientPacket) -> ConnectionResult<()> {
        let bytes = encode(packet)?;
        self.write_bytes(&bytes).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> ConnectionResult<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(err) = self.write(&ClientPacket::Close).await {
            debug!(error = %err, "close not delivered");
        }
        let _ = self.writer.shutdown().await;
    }

    /// Fails everything still waiting on this connection with its terminal error.
    fn teardown(&mut self, error: ConnectionError) {
        self.shared.mark_closed(error);
        let error = self.shared.failure();
        self.reader.abort();
        if let Some(running) = self.running_callback.take() {
            running.task.abort();
        }
        self.shared.callback.lock().take();
        self.callbacks.clear();
        self.compensations.clear();
        if let Some(active) = self.active.take() {
            self.shared.activity.request_finished();
            let _ = active.done.send(Err(error.clone()));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Request(request) => {
                    let _ = request.done.send(Err(error.clone()));
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }
}

impl Callback {
    fn spawn(self) -> RunningCallback {
        match self {
            Callback::Notification {
                notification,
                listeners,
                ack,
            } => RunningCallback {
                task: tokio::spawn(async move {
                    for registration in &listeners {
                        registration.listener.on_notification(&notification).await;
                    }
                }),
                ack,
            },
            Callback::IntentHit { hit, listeners } => RunningCallback {
                task: tokio::spawn(async move {
                    for listener in &listeners {
                        listener.on_intent_hit(&hit).await;
                    }
                }),
                ack: None,
            },
        }
    }
}

async fn join_callback(running: &mut Option<RunningCallback>) -> Result<(), JoinError> {
    match running {
        Some(running) => (&mut running.task).await,
        None => std::future::pending().await,
    }
}

fn encode(packet: &ClientPacket) -> Result<BytesMut, WireError> {
    let mut buf = BytesMut::with_capacity(64);
    packet.encode(&mut buf)?;
    Ok(buf)
}

/// Requests that settle server-side transaction state go out even when their
/// caller has stopped waiting.
fn abandonable(packet: &ClientPacket) -> bool {
    !matches!(
        packet,
        ClientPacket::TransactionCommit | ClientPacket::TransactionAbort
    )
}

fn undo_for(packet: &ClientPacket) -> Option<ClientPacket> {
    match packet {
        ClientPacket::TransactionBegin { .. } => Some(ClientPacket::TransactionAbort),
        _ => None,
    }
}

fn is_unsolicited(packet: &ServerPacket) -> bool {
    matches!(
        packet,
        ServerPacket::Heartbeat
            | ServerPacket::NotificationReceived { .. }
            | ServerPacket::IntentHit { .. }
    )
}

fn describe(packet: &ServerPacket) -> String {
    match packet {
        ServerPacket::ReadFileData { data } => format!("ReadFileData({} bytes)", data.len()),
        other => format!("{other:?}"),
    }
}
