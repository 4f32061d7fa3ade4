use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_client::mock::MockServer;
use archive_client::{
    Connection, ConnectionError, ConnectionOptions, IntentHit, IntentListener, Notification,
    NotificationListener,
};
use archive_proto::{server_handshake, ClientPacket, ServerPacket, WireError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        sleep(Duration::from_millis(5)).await;
    }
}

fn quick_options() -> ConnectionOptions {
    ConnectionOptions {
        heartbeat_interval: Duration::from_millis(20),
        read_timeout: Duration::from_millis(150),
        ..ConnectionOptions::default()
    }
}

/// Connects to a bare pipe whose far end the test drives packet by packet.
async fn raw_peer(name: &str, options: ConnectionOptions) -> (Connection, DuplexStream) {
    let (client, mut peer) = tokio::io::duplex(64 * 1024);
    let (conn, handshake) = tokio::join!(
        Connection::startup(client, name, options),
        server_handshake(&mut peer),
    );
    assert_eq!(handshake.expect("server handshake"), name);
    (conn.expect("client handshake"), peer)
}

async fn reply(peer: &mut DuplexStream, packet: ServerPacket) {
    let bytes = packet.to_bytes().expect("encode");
    peer.write_all(&bytes).await.expect("reply");
}

type Seen = Arc<Mutex<Vec<(&'static str, Notification)>>>;

struct Recorder {
    tag: &'static str,
    seen: Seen,
}

#[async_trait]
impl NotificationListener for Recorder {
    async fn on_notification(&self, notification: &Notification) {
        self.seen.lock().push((self.tag, notification.clone()));
    }
}

/// Checks that the server has not been acknowledged while it runs.
struct SlowRecorder {
    server: MockServer,
    acked_early: Arc<Mutex<Option<bool>>>,
    seen: Seen,
}

#[async_trait]
impl NotificationListener for SlowRecorder {
    async fn on_notification(&self, notification: &Notification) {
        sleep(Duration::from_millis(30)).await;
        *self.acked_early.lock() = Some(!self.server.acknowledged().is_empty());
        self.seen.lock().push(("slow", notification.clone()));
    }
}

struct HitRecorder(Arc<Mutex<Vec<IntentHit>>>);

#[async_trait]
impl IntentListener for HitRecorder {
    async fn on_intent_hit(&self, hit: &IntentHit) {
        self.0.lock().push(hit.clone());
    }
}

#[test_timeout::tokio_timeout_test]
async fn concurrent_requests_get_their_own_responses() {
    init_tracing();
    let server = MockServer::new();
    let conn = server.connect("pipeline").await.expect("connect");

    let writes = (0..16).map(|i| {
        let conn = conn.clone();
        async move {
            conn.write_bytes(&format!("data/{i:02}"), vec![i as u8; 100 + i])
                .await
        }
    });
    for result in futures::future::join_all(writes).await {
        result.expect("write");
    }

    let reads = (0..16).map(|i| {
        let conn = conn.clone();
        async move { (i, conn.read_bytes(&format!("data/{i:02}")).await) }
    });
    for (i, result) in futures::future::join_all(reads).await {
        assert_eq!(result.expect("read"), vec![i as u8; 100 + i]);
    }

    let names = conn.list_files("data/", None).await.expect("list");
    assert_eq!(names.len(), 16);
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn large_files_stream_in_chunks() {
    let server = MockServer::new();
    let conn = server.connect("bulk").await.expect("connect");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let mut source = payload.as_slice();
    conn.write_data("bulk/a", payload.len() as u64, &mut source)
        .await
        .expect("write");
    assert_eq!(server.file("bulk/a").expect("stored").len(), payload.len());

    let mut sink = Vec::new();
    let total = conn.read_data("bulk/a", &mut sink).await.expect("read");
    assert_eq!(total, payload.len() as u64);
    assert_eq!(sink, payload);

    let mut short = &payload[..10];
    let err = conn
        .write_data("bulk/b", 20, &mut short)
        .await
        .expect_err("short source");
    assert!(matches!(err, ConnectionError::Io(_)));
    assert!(server.file("bulk/b").is_none());
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn missing_files_report_not_found() {
    let server = MockServer::new();
    let conn = server.connect("missing").await.expect("connect");

    let err = conn.read_bytes("nope").await.expect_err("missing read");
    assert_eq!(err, ConnectionError::FileNotFound("nope".into()));
    let err = conn.remove_file("nope").await.expect_err("missing remove");
    assert!(err.is_not_found());

    let target = std::env::temp_dir().join(format!("archive-client-{}", uuid::Uuid::new_v4()));
    let err = conn.read_file("nope", &target).await.expect_err("missing download");
    assert!(err.is_not_found());
    assert!(!target.exists(), "partial download left behind");

    server.put_file("present", &b"hello"[..]);
    assert_eq!(conn.read_file("present", &target).await.expect("download"), 5);
    assert_eq!(std::fs::read(&target).expect("local copy"), b"hello");
    std::fs::remove_file(&target).expect("cleanup");

    conn.remove_file("present").await.expect("remove");
    assert!(server.file("present").is_none());
    assert!(!conn.is_closed());
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn list_files_filters_by_modification_time() {
    let server = MockServer::new();
    let conn = server.connect("lister").await.expect("connect");
    let first = server.put_file("station/a", &b"1"[..]);
    server.put_file("station/b", &b"2"[..]);
    server.put_file("other/c", &b"3"[..]);

    let all = conn.list_files("station/", None).await.expect("list");
    assert_eq!(all, vec!["station/a".to_string(), "station/b".to_string()]);
    let newer = conn.list_files("station/", Some(first)).await.expect("list");
    assert_eq!(newer, vec!["station/b".to_string()]);
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn lock_denial_carries_holder_status() {
    init_tracing();
    let server = MockServer::new();
    let editor = server.connect("editor").await.expect("connect editor");
    let updater = server.connect("updater").await.expect("connect updater");

    editor.transaction_begin(true).await.expect("begin");
    editor
        .set_transaction_status("editing station SGP")
        .await
        .expect("status");
    editor.lock_write("sgp/data", 0, 100).await.expect("write lock");

    updater.transaction_begin(true).await.expect("begin");
    let err = updater
        .lock_write("sgp/data", 50, 150)
        .await
        .expect_err("overlapping write lock");
    assert_eq!(err, ConnectionError::LockDenied("editing station SGP".into()));
    assert_eq!(err.to_string(), "busy: editing station SGP");
    let err = updater
        .lock_read("sgp/data", 99, 100)
        .await
        .expect_err("read under write lock");
    assert!(err.is_lock_denied());
    updater
        .lock_write("sgp/data", 100, 200)
        .await
        .expect("adjacent range is free");
    updater.transaction_abort().await.expect("abort");

    editor.transaction_commit().await.expect("commit");
    updater.transaction_begin(true).await.expect("begin");
    updater
        .lock_write("sgp/data", 50, 150)
        .await
        .expect("lock after release");
    updater.transaction_commit().await.expect("commit");

    editor.shutdown().await.expect("shutdown");
    updater.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn read_locks_are_shared() {
    let server = MockServer::new();
    let a = server.connect("a").await.expect("connect");
    let b = server.connect("b").await.expect("connect");
    a.transaction_begin(false).await.expect("begin");
    b.transaction_begin(false).await.expect("begin");
    a.lock_read("k", 0, 10).await.expect("read lock a");
    b.lock_read("k", 5, 15).await.expect("read lock b");
    b.transaction_commit().await.expect("commit");
    a.transaction_commit().await.expect("commit");
    a.shutdown().await.expect("shutdown");
    b.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn transaction_state_is_checked() {
    let server = MockServer::new();
    let conn = server.connect("tx").await.expect("connect");
    assert_eq!(
        conn.transaction_commit().await,
        Err(ConnectionError::NoTransaction)
    );
    conn.transaction_begin(false).await.expect("begin");
    assert_eq!(
        conn.transaction_begin(true).await,
        Err(ConnectionError::TransactionOpen)
    );
    assert!(conn.transaction_abort().await.expect("abort").is_empty());
    assert!(matches!(
        conn.transaction_abort().await,
        Err(ConnectionError::NoTransaction)
    ));
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn notifications_run_in_registration_order_before_ack() {
    init_tracing();
    let server = MockServer::new();
    let listener = server.connect("listener").await.expect("connect");
    let sender = server.connect("sender").await.expect("connect");
    let seen: Seen = Arc::default();
    let acked_early = Arc::new(Mutex::new(None));

    listener
        .listen_notification(
            "sgp/raw",
            Arc::new(SlowRecorder {
                server: server.clone(),
                acked_early: Arc::clone(&acked_early),
                seen: Arc::clone(&seen),
            }),
            true,
        )
        .await
        .expect("listen slow");
    listener
        .listen_notification(
            "sgp/raw",
            Arc::new(Recorder {
                tag: "second",
                seen: Arc::clone(&seen),
            }),
            true,
        )
        .await
        .expect("listen second");
    // Round trip so the server has processed the registration.
    listener.list_files("", None).await.expect("sync");

    sender.send_notification("sgp/raw", 10, 20).await.expect("notify");
    eventually(|| seen.lock().len() == 2).await;
    let tags: Vec<_> = seen.lock().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["slow", "second"]);
    assert_eq!(
        seen.lock()[0].1,
        Notification {
            key: "sgp/raw".into(),
            start: 10,
            end: 20
        }
    );
    eventually(|| server.acknowledged().len() == 1).await;
    assert_eq!(*acked_early.lock(), Some(false));

    listener.shutdown().await.expect("shutdown");
    sender.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn transactional_notifications_arrive_on_commit() {
    let server = MockServer::new();
    let listener = server.connect("listener").await.expect("connect");
    let sender = server.connect("sender").await.expect("connect");
    let seen: Seen = Arc::default();
    listener
        .listen_notification(
            "k",
            Arc::new(Recorder {
                tag: "only",
                seen: Arc::clone(&seen),
            }),
            false,
        )
        .await
        .expect("listen");
    listener.list_files("", None).await.expect("sync");

    sender.transaction_begin(true).await.expect("begin");
    sender.send_notification("k", 1, 2).await.expect("notify");
    sender.list_files("", None).await.expect("sync");
    listener.list_files("", None).await.expect("sync");
    assert!(seen.lock().is_empty());

    sender.transaction_commit().await.expect("commit");
    eventually(|| seen.lock().len() == 1).await;
    // No synchronous listener, so the acknowledgement went out on arrival.
    eventually(|| server.acknowledged().len() == 1).await;

    listener.shutdown().await.expect("shutdown");
    sender.shutdown().await.expect("shutdown");
}

struct Requester {
    conn: archive_client::Connection,
    listed: Arc<Mutex<Option<usize>>>,
}

#[async_trait]
impl NotificationListener for Requester {
    async fn on_notification(&self, _notification: &Notification) {
        let names = self.conn.list_files("", None).await.expect("list inside listener");
        *self.listed.lock() = Some(names.len());
    }
}

#[test_timeout::tokio_timeout_test]
async fn listeners_can_use_their_own_connection() {
    let server = MockServer::new();
    server.put_file("x", &b"x"[..]);
    let conn = server.connect("reentrant").await.expect("connect");
    let listed = Arc::new(Mutex::new(None));
    conn.listen_notification(
        "k",
        Arc::new(Requester {
            conn: conn.clone(),
            listed: Arc::clone(&listed),
        }),
        true,
    )
    .await
    .expect("listen");
    conn.list_files("", None).await.expect("sync");

    server.notify("k", 0, 1);
    eventually(|| listed.lock().is_some()).await;
    assert_eq!(*listed.lock(), Some(1));
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn committed_write_lock_hits_overlapping_intents() {
    let server = MockServer::new();
    let holder = server.connect("holder").await.expect("connect");
    let writer = server.connect("writer").await.expect("connect");
    let hits = Arc::new(Mutex::new(Vec::new()));

    holder
        .listen_intent("sgp/clean", Arc::new(HitRecorder(Arc::clone(&hits))))
        .await
        .expect("listen");
    let intent = holder
        .acquire_intent("sgp/clean", 0, 100, true)
        .await
        .expect("intent");
    assert!(intent.is_realized());
    assert_eq!(server.held_intents("sgp/clean"), vec![(0, 100)]);

    writer.transaction_begin(true).await.expect("begin");
    writer.lock_write("sgp/clean", 50, 200).await.expect("lock");
    writer.transaction_commit().await.expect("commit");

    eventually(|| !hits.lock().is_empty()).await;
    assert_eq!(
        hits.lock()[0],
        IntentHit {
            key: "sgp/clean".into(),
            start: 50,
            end: 100
        }
    );

    intent.release(&holder, true).await.expect("release");
    assert!(server.held_intents("sgp/clean").is_empty());
    holder.shutdown().await.expect("shutdown");
    writer.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn intents_follow_the_transaction_outcome() {
    let server = MockServer::new();
    let conn = server.connect("intents").await.expect("connect");

    conn.transaction_begin(true).await.expect("begin");
    let intent = conn.acquire_intent("k", 0, 10, false).await.expect("acquire");
    assert!(!intent.is_realized());
    assert!(server.held_intents("k").is_empty());
    conn.transaction_commit().await.expect("commit");
    assert!(intent.is_realized());
    assert_eq!(server.held_intents("k"), vec![(0, 10)]);

    conn.transaction_begin(true).await.expect("begin");
    intent.release(&conn, false).await.expect("deferred release");
    let mut rolled_back = conn.transaction_abort().await.expect("abort");
    assert_eq!(rolled_back.len(), 1);
    assert!(rolled_back[0].is_realized());
    assert_eq!(server.held_intents("k"), vec![(0, 10)]);

    let intent = rolled_back.remove(0);
    conn.transaction_begin(true).await.expect("begin");
    intent.release(&conn, false).await.expect("deferred release");
    conn.transaction_commit().await.expect("commit");
    assert!(server.held_intents("k").is_empty());

    conn.transaction_begin(true).await.expect("begin");
    let transient = conn.acquire_intent("k", 5, 6, false).await.expect("acquire");
    transient.release(&conn, false).await.expect("release");
    assert!(conn.transaction_abort().await.expect("abort").is_empty());
    assert!(server.held_intents("k").is_empty());
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn scoped_transaction_commits_or_aborts() {
    let server = MockServer::new();
    let conn = server.connect("scoped").await.expect("connect");
    let other = server.connect("other").await.expect("connect");

    let held = conn.acquire_intent("k", 0, 10, true).await.expect("acquire");
    let result: Result<(), ConnectionError> = conn
        .transaction(true, |conn| async move {
            conn.lock_write("k", 0, 10).await?;
            held.release(&conn, false).await?;
            Err::<(), _>(ConnectionError::LockDenied("simulated".into()))
        })
        .await;
    assert_eq!(result, Err(ConnectionError::LockDenied("simulated".into())));
    // The rolled back release was forced through after the abort.
    assert!(server.held_intents("k").is_empty());

    other.transaction_begin(true).await.expect("begin");
    other.lock_write("k", 0, 10).await.expect("lock released by abort");
    other.transaction_abort().await.expect("abort");

    let value = conn
        .transaction(false, |conn| async move {
            conn.lock_read("k", 0, 10).await?;
            Ok::<_, ConnectionError>(7)
        })
        .await
        .expect("committed");
    assert_eq!(value, 7);

    conn.shutdown().await.expect("shutdown");
    other.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn dropped_transaction_aborts_in_background() {
    let server = MockServer::new();
    let conn = server.connect("dropper").await.expect("connect");
    let other = server.connect("other").await.expect("connect");

    {
        let transaction = conn.begin_transaction(true).await.expect("begin");
        transaction
            .connection()
            .lock_write("k", 0, 10)
            .await
            .expect("lock");
    }

    let transaction = conn.begin_transaction(true).await.expect("begin after drop");
    other.transaction_begin(true).await.expect("begin");
    other.lock_write("k", 0, 10).await.expect("lock freed");
    other.transaction_commit().await.expect("commit");
    transaction.commit().await.expect("commit");

    conn.shutdown().await.expect("shutdown");
    other.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn closed_connections_fail_requests() {
    let server = MockServer::new();
    let conn = server.connect("closing").await.expect("connect");
    conn.shutdown().await.expect("shutdown");
    assert!(conn.is_closed());
    assert_eq!(
        conn.list_files("", None).await,
        Err(ConnectionError::Closed)
    );
    conn.shutdown().await.expect("second shutdown is a no-op");

    let aborted = server.connect("aborted").await.expect("connect");
    aborted.abort();
    assert_eq!(
        aborted.read_bytes("x").await,
        Err(ConnectionError::Closed)
    );
}

#[test_timeout::tokio_timeout_test]
async fn abandoned_request_does_not_disturb_the_queue() {
    let server = MockServer::new();
    server.put_file("a", &b"abc"[..]);
    let conn = server.connect("impatient").await.expect("connect");

    let _ = tokio::time::timeout(Duration::from_micros(1), conn.read_bytes("a")).await;
    assert_eq!(conn.read_bytes("a").await.expect("read"), b"abc");
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn silent_server_times_out() {
    init_tracing();
    let server = MockServer::new();
    let conn = server
        .connect_with("stalled", quick_options())
        .await
        .expect("connect");
    server.stall();

    let err = conn.list_files("", None).await.expect_err("no answer");
    assert!(matches!(err, ConnectionError::Timeout(_)), "{err:?}");
    assert!(conn.is_closed());
    assert_eq!(
        conn.list_files("", None).await,
        Err(ConnectionError::Closed)
    );
}

#[test_timeout::tokio_timeout_test]
async fn watchdog_reports_staleness_then_ends() {
    let server = MockServer::new();
    let options = ConnectionOptions {
        heartbeat_interval: Duration::from_millis(10),
        read_timeout: Duration::from_secs(10),
        ..ConnectionOptions::default()
    };
    let conn = server.connect_with("watched", options).await.expect("connect");

    let mut watchdog = conn.periodic_watchdog(
        Duration::from_millis(20),
        Duration::from_millis(200),
        Duration::from_secs(5),
    );
    let tick = watchdog.tick().await.expect("tick");
    assert!(tick.is_healthy());

    server.stall();
    loop {
        let tick = watchdog.tick().await.expect("tick");
        if tick.stale_heartbeat {
            assert!(!tick.stalled_request);
            break;
        }
    }

    let mut ticks = Box::pin(watchdog.into_stream());
    conn.abort();
    assert!(ticks.next().await.is_none());
}

#[test_timeout::tokio_timeout_test]
async fn cancelled_begin_frees_the_transaction_slot() {
    let server = MockServer::new();
    let conn = server.connect("hasty").await.expect("connect");

    // Gone before the run loop saw it, so it is never sent.
    let mut begin = Box::pin(conn.transaction_begin(true));
    assert!(futures::poll!(begin.as_mut()).is_pending());
    drop(begin);
    conn.transaction_begin(true).await.expect("begin after cancelled begin");
    conn.transaction_commit().await.expect("commit");
    assert!(server.open_transactions().is_empty());

    // Gone after the server opened the transaction.
    let mut begin = Box::pin(conn.transaction_begin(true));
    assert!(futures::poll!(begin.as_mut()).is_pending());
    eventually(|| server.open_transactions() == vec!["hasty".to_string()]).await;
    sleep(Duration::from_millis(20)).await;
    drop(begin);
    conn.list_files("", None).await.expect("round trip");
    assert!(server.open_transactions().is_empty());

    conn.transaction_begin(true).await.expect("begin again");
    assert!(conn.transaction_abort().await.expect("abort").is_empty());
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn begin_answered_after_its_caller_left_is_aborted() {
    let (conn, mut peer) = raw_peer("walkaway", ConnectionOptions::default()).await;

    let mut begin = Box::pin(conn.transaction_begin(true));
    assert!(futures::poll!(begin.as_mut()).is_pending());
    let sent = ClientPacket::read(&mut peer).await.expect("begin");
    assert_eq!(sent, ClientPacket::TransactionBegin { write: true });
    drop(begin);

    reply(&mut peer, ServerPacket::TransactionStarted).await;
    let sent = ClientPacket::read(&mut peer).await.expect("abort");
    assert_eq!(sent, ClientPacket::TransactionAbort);

    // A new begin queues behind the abort.
    let next = tokio::spawn({
        let conn = conn.clone();
        async move { conn.transaction_begin(false).await }
    });
    reply(&mut peer, ServerPacket::TransactionAborted).await;
    let sent = ClientPacket::read(&mut peer).await.expect("second begin");
    assert_eq!(sent, ClientPacket::TransactionBegin { write: false });
    reply(&mut peer, ServerPacket::TransactionStarted).await;
    next.await.expect("join").expect("second begin");
    conn.abort();
}

#[test_timeout::tokio_timeout_test]
async fn cancelled_commit_still_settles_intents() {
    let server = MockServer::new();
    let conn = server.connect("committer").await.expect("connect");
    conn.transaction_begin(true).await.expect("begin");
    let intent = conn.acquire_intent("k", 0, 10, false).await.expect("acquire");

    let mut commit = Box::pin(conn.transaction_commit());
    assert!(futures::poll!(commit.as_mut()).is_pending());
    drop(commit);
    conn.list_files("", None).await.expect("round trip");

    assert!(intent.is_realized());
    assert_eq!(server.held_intents("k"), vec![(0, 10)]);
    assert!(server.open_transactions().is_empty());
    intent.release(&conn, true).await.expect("release");
    conn.shutdown().await.expect("shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn dropped_transaction_releases_rolled_back_intents() {
    let server = MockServer::new();
    let conn = server.connect("forgetful").await.expect("connect");
    let intent = conn.acquire_intent("k", 0, 10, true).await.expect("acquire");

    {
        let transaction = conn.begin_transaction(true).await.expect("begin");
        intent
            .release(transaction.connection(), false)
            .await
            .expect("deferred release");
    }
    conn.list_files("", None).await.expect("round trip");
    conn.list_files("", None).await.expect("round trip");

    assert!(server.open_transactions().is_empty());
    assert!(server.held_intents("k").is_empty());
    conn.shutdown().await.expect("shutdown");
}

struct Sleeper {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl NotificationListener for Sleeper {
    async fn on_notification(&self, _notification: &Notification) {
        self.started.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[test_timeout::tokio_timeout_test]
async fn abort_cancels_a_running_listener() {
    let server = MockServer::new();
    let conn = server.connect("doomed").await.expect("connect");
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    conn.listen_notification(
        "k",
        Arc::new(Sleeper {
            started: Arc::clone(&started),
            finished: Arc::clone(&finished),
        }),
        true,
    )
    .await
    .expect("listen");
    conn.list_files("", None).await.expect("sync");

    server.notify("k", 0, 1);
    eventually(|| started.load(Ordering::SeqCst)).await;
    conn.abort();
    sleep(Duration::from_millis(200)).await;

    assert!(!finished.load(Ordering::SeqCst));
    assert!(server.acknowledged().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn unknown_server_tag_fails_every_waiter() {
    init_tracing();
    let (conn, mut peer) = raw_peer("garbled", ConnectionOptions::default()).await;

    let waiters = tokio::spawn({
        let conn = conn.clone();
        async move { tokio::join!(conn.list_files("a/", None), conn.list_files("b/", None)) }
    });
    let sent = ClientPacket::read(&mut peer).await.expect("first request");
    assert!(matches!(sent, ClientPacket::ListFiles { .. }), "{sent:?}");
    peer.write_all(&[0xEE]).await.expect("garbage");

    let (first, second) = waiters.await.expect("join");
    let expected = Err(ConnectionError::Protocol(WireError::UnknownPacketType(0xEE)));
    assert_eq!(first, expected);
    assert_eq!(second, expected);
    assert!(conn.is_closed());
    assert_eq!(
        conn.list_files("c/", None).await,
        Err(ConnectionError::Closed)
    );
}

#[test_timeout::tokio_timeout_test]
async fn mismatched_reply_is_fatal() {
    let (conn, mut peer) = raw_peer("confused", ConnectionOptions::default()).await;

    let waiter = tokio::spawn({
        let conn = conn.clone();
        async move { conn.list_files("a/", None).await }
    });
    ClientPacket::read(&mut peer).await.expect("request");
    reply(&mut peer, ServerPacket::WriteLockAcquired).await;

    let err = waiter.await.expect("join").expect_err("reply for another request");
    assert!(matches!(err, ConnectionError::UnexpectedPacket(_)), "{err:?}");
    assert_eq!(
        conn.transaction_begin(true).await,
        Err(ConnectionError::Closed)
    );
}

#[test_timeout::tokio_timeout_test]
async fn silence_is_fatal_between_heartbeats() {
    let options = ConnectionOptions {
        heartbeat_interval: Duration::from_secs(60),
        read_timeout: Duration::from_millis(100),
        ..ConnectionOptions::default()
    };
    let (conn, mut peer) = raw_peer("quiet", options).await;

    let started = std::time::Instant::now();
    let err = conn.list_files("", None).await.expect_err("no answer");
    assert!(matches!(err, ConnectionError::Timeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        ClientPacket::read(&mut peer).await,
        Ok(ClientPacket::ListFiles { .. })
    ));
}
