//! The connection engine.
//!
//! A [`Connection`] is a cheap handle onto shared state plus a command channel
//! feeding one run loop task (see `run_loop.rs`). The run loop is the only place
//! that writes to the socket; a companion reader task decodes server packets and
//! forwards them over a channel so every wait in the loop is cancel-safe.

mod ops;
mod run_loop;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_proto::{client_handshake, ClientPacket, ServerPacket};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ClientConfig, ServerAddress};
use crate::error::{ConnectionError, ConnectionResult};
use crate::intent::IntentHandle;
use crate::listener::{IntentListener, NotificationListener};
use crate::transaction::TransactionLedger;

use run_loop::RunLoop;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_OUTSTANDING_HEARTBEATS: u32 = 10;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const INBOUND_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    /// Heartbeats stop being sent once this many are unanswered.
    pub max_outstanding_heartbeats: u32,
    /// Receiving nothing at all for this long is fatal.
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_outstanding_heartbeats: DEFAULT_MAX_OUTSTANDING_HEARTBEATS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// What a response handler made of a packet it was offered.
pub(crate) enum Offer {
    /// The request is finished; the handler slot is cleared.
    Complete(ConnectionResult<Reply>),
    /// Part of a multi-packet response; keep the handler active.
    Consumed,
    /// Not a response to this request; treat as unsolicited.
    Declined(ServerPacket),
}

#[derive(Debug)]
pub(crate) enum Reply {
    Done,
    Names(Vec<String>),
    Intent(u64),
    /// Intents an abort handed back; released by the run loop if nobody claims them.
    RolledBack(Vec<IntentHandle>),
}

pub(crate) type ResponseHandler = Box<dyn FnMut(ServerPacket) -> Offer + Send>;

pub(crate) struct Request {
    pub(crate) packet: ClientPacket,
    pub(crate) handler: Option<ResponseHandler>,
    pub(crate) done: oneshot::Sender<ConnectionResult<Reply>>,
}

pub(crate) enum Command {
    Request(Request),
    Shutdown(oneshot::Sender<ConnectionResult<()>>),
}

#[derive(Clone)]
pub(crate) struct NotificationRegistration {
    pub(crate) listener: Arc<dyn NotificationListener>,
    pub(crate) synchronous: bool,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    pub(crate) notifications: HashMap<String, Vec<NotificationRegistration>>,
    pub(crate) intents: HashMap<String, Vec<Arc<dyn IntentListener>>>,
}

/// Timestamps the watchdog reads to judge liveness.
pub(crate) struct Activity {
    last_received: Mutex<Instant>,
    request_started: Mutex<Option<Instant>>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last_received: Mutex::new(Instant::now()),
            request_started: Mutex::new(None),
        }
    }

    pub(crate) fn mark_received(&self) {
        *self.last_received.lock() = Instant::now();
    }

    pub(crate) fn last_received(&self) -> Instant {
        *self.last_received.lock()
    }

    pub(crate) fn since_last_received(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    pub(crate) fn request_started(&self) {
        *self.request_started.lock() = Some(Instant::now());
    }

    pub(crate) fn request_finished(&self) {
        *self.request_started.lock() = None;
    }

    pub(crate) fn request_age(&self) -> Option<Duration> {
        self.request_started.lock().map(|started| started.elapsed())
    }
}

pub(crate) struct Shared {
    name: String,
    closed: AtomicBool,
    failure: Mutex<Option<ConnectionError>>,
    pub(crate) registry: Mutex<ListenerRegistry>,
    pub(crate) ledger: Mutex<Option<TransactionLedger>>,
    pub(crate) transaction_gate: Arc<tokio::sync::Mutex<()>>,
    pub(crate) activity: Activity,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// The listener task currently running, if any.
    pub(crate) callback: Mutex<Option<AbortHandle>>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The error that closed the connection, or [`ConnectionError::Closed`].
    pub(crate) fn failure(&self) -> ConnectionError {
        self.failure.lock().clone().unwrap_or(ConnectionError::Closed)
    }

    /// Records the first terminal error and flips the closed flag.
    pub(crate) fn mark_closed(&self, error: ConnectionError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
        self.closed.store(true, Ordering::Release);
    }
}

/// Handle onto one archive server connection. Clones share the connection.
///
/// Once every clone is dropped the run loop closes the socket on its own.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Connection {
    /// Resolves the server address from `config`, connects and runs the handshake.
    pub async fn connect(config: &ClientConfig) -> ConnectionResult<Self> {
        let address = config.resolve()?;
        info!(%address, name = %config.connection_name, "connecting to archive server");
        match address {
            ServerAddress::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), port)).await?;
                stream.set_nodelay(true)?;
                Self::startup(stream, &config.connection_name, config.options.clone()).await
            }
            ServerAddress::Unix(path) => {
                let stream = UnixStream::connect(&path).await?;
                Self::startup(stream, &config.connection_name, config.options.clone()).await
            }
        }
    }

    /// Runs the handshake over an already connected stream and starts the run loop.
    pub async fn startup<S>(
        mut stream: S,
        name: &str,
        options: ConnectionOptions,
    ) -> ConnectionResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::time::timeout(options.handshake_timeout, client_handshake(&mut stream, name))
            .await
            .map_err(|_| ConnectionError::Timeout("handshake".into()))??;
        debug!(name, "handshake complete");

        let (reader, writer) = tokio::io::split(stream);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);

        let shared = Arc::new(Shared {
            name: name.to_string(),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
            registry: Mutex::new(ListenerRegistry::default()),
            ledger: Mutex::new(None),
            transaction_gate: Arc::new(tokio::sync::Mutex::new(())),
            activity: Activity::new(),
            tasks: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        });

        let reader_task = tokio::spawn(run_loop::read_packets(Box::new(reader), inbound_tx));
        let run_loop = RunLoop::new(
            Arc::clone(&shared),
            Box::new(writer),
            inbound_rx,
            commands_rx,
            reader_task.abort_handle(),
            options,
        );
        let loop_task = tokio::spawn(run_loop.run());
        shared.tasks.lock().extend([reader_task, loop_task]);

        Ok(Self {
            shared,
            commands: commands_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Waits for queued requests, sends `close`, and shuts the socket down.
    /// Succeeds if the connection is already gone.
    pub async fn shutdown(&self) -> ConnectionResult<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let (reply, receiver) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).is_err() {
            return Ok(());
        }
        receiver.await.unwrap_or(Ok(()))
    }

    /// Cancels the connection immediately, along with any listener still running.
    /// Every waiting caller observes [`ConnectionError::Closed`].
    pub fn abort(&self) {
        self.shared.mark_closed(ConnectionError::Closed);
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(callback) = self.shared.callback.lock().take() {
            callback.abort();
        }
    }

    /// Queues a request without waiting for it. Usable from synchronous contexts
    /// such as `Drop`. Fails with [`ConnectionError::Closed`] once the connection
    /// is closed; only callers already waiting see the error that closed it.
    pub(crate) fn enqueue(
        &self,
        packet: ClientPacket,
        handler: Option<ResponseHandler>,
    ) -> ConnectionResult<oneshot::Receiver<ConnectionResult<Reply>>> {
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let (done, receiver) = oneshot::channel();
        self.commands
            .send(Command::Request(Request {
                packet,
                handler,
                done,
            }))
            .map_err(|_| ConnectionError::Closed)?;
        Ok(receiver)
    }

    pub(crate) async fn request(
        &self,
        packet: ClientPacket,
        handler: Option<ResponseHandler>,
    ) -> ConnectionResult<Reply> {
        let receiver = self.enqueue(packet, handler)?;
        self.settle(receiver).await
    }

    /// Waits for a queued request. A dropped completion means the run loop is
    /// gone, so the connection's terminal error is reported instead.
    pub(crate) async fn settle(
        &self,
        receiver: oneshot::Receiver<ConnectionResult<Reply>>,
    ) -> ConnectionResult<Reply> {
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.failure()),
        }
    }
}

impl Reply {
    pub(crate) fn into_names(self) -> ConnectionResult<Vec<String>> {
        match self {
            Reply::Names(names) => Ok(names),
            other => Err(ConnectionError::UnexpectedPacket(format!("{other:?}"))),
        }
    }

    pub(crate) fn into_intent(self) -> ConnectionResult<u64> {
        match self {
            Reply::Intent(uid) => Ok(uid),
            other => Err(ConnectionError::UnexpectedPacket(format!("{other:?}"))),
        }
    }

    pub(crate) fn into_rolled_back(self) -> ConnectionResult<Vec<IntentHandle>> {
        match self {
            Reply::RolledBack(handles) => Ok(handles),
            other => Err(ConnectionError::UnexpectedPacket(format!("{other:?}"))),
        }
    }
}

/// Boxes a response handler closure.
pub(crate) fn respond(
    handler: impl FnMut(ServerPacket) -> Offer + Send + 'static,
) -> Option<ResponseHandler> {
    Some(Box::new(handler))
}

/// A handler that finishes with [`Reply::Done`] on the packet `accepts` picks.
pub(crate) fn done_on(accepts: fn(&ServerPacket) -> bool) -> Option<ResponseHandler> {
    respond(move |packet| {
        if accepts(&packet) {
            Offer::Complete(Ok(Reply::Done))
        } else {
            Offer::Declined(packet)
        }
    })
}
