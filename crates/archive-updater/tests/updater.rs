use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_client::mock::MockServer;
use archive_client::Connection;
use archive_updater::telemetry::try_init_tracing;
use archive_updater::{
    IdleHook, PersistedState, StateFile, StationsController, UpdateManager, UpdatePolicy,
    UpdateProgress, UpdaterConfig, UpdaterError, UpdaterResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;

/// Averages `raw/<name>` into `derived/<name>`. Raw data lives in files named
/// `data/<name>/<start>-<end>`.
struct Averager {
    name: String,
    source_key: String,
    output_key: String,
    ready_on_notification: bool,
    performed: Arc<Mutex<Vec<(i64, i64)>>>,
    fail_next: Arc<AtomicBool>,
}

impl Averager {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source_key: format!("raw/{name}"),
            output_key: format!("derived/{name}"),
            ready_on_notification: true,
            performed: Arc::default(),
            fail_next: Arc::default(),
        }
    }

    fn waiting_for_hits(mut self) -> Self {
        self.ready_on_notification = false;
        self
    }
}

#[async_trait]
impl UpdatePolicy for Averager {
    fn name(&self) -> &str {
        &self.name
    }

    fn listen_keys(&self) -> Vec<String> {
        vec![self.source_key.clone()]
    }

    fn intent_keys(&self) -> Vec<String> {
        vec![self.source_key.clone()]
    }

    fn ready_on_notification(&self, _key: &str) -> bool {
        self.ready_on_notification
    }

    async fn get_modified(
        &self,
        connection: &Connection,
        modified_after: Option<i64>,
    ) -> UpdaterResult<Vec<(i64, i64)>> {
        let prefix = format!("data/{}/", self.name);
        let names = connection.list_files(&prefix, modified_after).await?;
        Ok(names
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix)?.split_once('-'))
            .filter_map(|(start, end)| Some((start.parse().ok()?, end.parse().ok()?)))
            .collect())
    }

    async fn perform_update(&self, connection: &Connection, start: i64, end: i64) -> UpdaterResult<()> {
        connection.lock_read(&self.source_key, start, end).await?;
        connection.lock_write(&self.output_key, start, end).await?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(UpdaterError::policy(&self.name, "average diverged"));
        }
        connection
            .write_bytes(&format!("out/{}/{start}-{end}", self.name), b"avg".to_vec())
            .await?;
        self.performed.lock().push((start, end));
        Ok(())
    }
}

fn scratch_config() -> UpdaterConfig {
    UpdaterConfig {
        state_dir: std::env::temp_dir().join(format!("archive-updater-{}", uuid::Uuid::new_v4())),
        log_filter: "warn".to_string(),
        ..UpdaterConfig::default()
    }
}

fn cleanup(config: &UpdaterConfig) {
    let _ = std::fs::remove_dir_all(&config.state_dir);
}

async fn wait_for_ready<P: UpdatePolicy>(manager: &UpdateManager<P>, expected: &[(i64, i64)]) {
    while manager.ready_ranges().await != expected {
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_pending<P: UpdatePolicy>(manager: &UpdateManager<P>, expected: &[(i64, i64)]) {
    while manager.pending_ranges().await != expected {
        sleep(Duration::from_millis(5)).await;
    }
}

struct Harness {
    server: MockServer,
    config: UpdaterConfig,
    controller: StationsController,
}

async fn harness(server: MockServer, config: UpdaterConfig) -> Harness {
    try_init_tracing(&config);
    let connection = server
        .connect_with("updater", config.connection_options())
        .await
        .expect("connect");
    let controller = StationsController::new(connection, &config);
    Harness {
        server,
        config,
        controller,
    }
}

#[test_timeout::tokio_timeout_test]
async fn single_notification_runs_once() {
    let mut h = harness(MockServer::new(), scratch_config()).await;
    let policy = Averager::new("sgp");
    let performed = Arc::clone(&policy.performed);
    let manager = h.controller.add(policy);
    h.controller.start().await.expect("start");

    h.server.notify("raw/sgp", 1000, 2000);
    wait_for_ready(&manager, &[(1000, 2000)]).await;
    assert_eq!(h.server.held_intents("raw/sgp"), vec![(1000, 2000)]);

    let progress = h.controller.do_any_update().await.expect("update");
    assert_eq!(progress, UpdateProgress::Updated("sgp".into()));
    assert_eq!(*performed.lock(), vec![(1000, 2000)]);
    assert!(manager.pending_ranges().await.is_empty());
    assert!(h.server.held_intents("raw/sgp").is_empty());
    assert!(h.server.file("out/sgp/1000-2000").is_some());
    while h.server.acknowledged().is_empty() {
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        h.controller.do_any_update().await.expect("idle pass"),
        UpdateProgress::Idle
    );
    let state = StateFile::for_station(&h.config.state_dir, "sgp")
        .load()
        .await
        .expect("load")
        .expect("state written");
    assert!(state.pending.is_empty());

    h.controller.shutdown().await.expect("shutdown");
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn no_updates_are_handed_out_after_shutdown() {
    let mut h = harness(MockServer::new(), scratch_config()).await;
    let manager = h.controller.add(Averager::new("sgp"));
    h.controller.start().await.expect("start");
    h.server.notify("raw/sgp", 1000, 2000);
    wait_for_ready(&manager, &[(1000, 2000)]).await;

    h.controller.shutdown().await.expect("shutdown");
    assert!(matches!(
        manager.next_update().await,
        Err(UpdaterError::ShuttingDown)
    ));
    assert!(matches!(
        h.controller.do_any_update().await,
        Err(UpdaterError::ShuttingDown)
    ));
    // The pass's transaction was abandoned, and the backlog survives for the next start.
    assert!(h.server.open_transactions().is_empty());
    assert_eq!(manager.pending_ranges().await, vec![(1000, 2000)]);
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn overlapping_notifications_merge_before_running() {
    let mut h = harness(MockServer::new(), scratch_config()).await;
    let manager = h.controller.add(Averager::new("sgp"));
    h.controller.start().await.expect("start");

    h.server.notify("raw/sgp", 1000, 2000);
    h.server.notify("raw/sgp", 1500, 2500);
    wait_for_pending(&manager, &[(1000, 2500)]).await;
    assert_eq!(manager.ready_ranges().await, vec![(1000, 2500)]);
    // The absorbed range's intent is gone; only the union is reserved.
    assert_eq!(h.server.held_intents("raw/sgp"), vec![(1000, 2500)]);

    let persisted = StateFile::for_station(&h.config.state_dir, "sgp")
        .load()
        .await
        .expect("load")
        .expect("state written");
    assert_eq!(persisted.pending, vec![(1000, 2500)]);

    h.controller.shutdown().await.expect("shutdown");
    assert!(h.server.held_intents("raw/sgp").is_empty());
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn denied_station_rotates_behind_the_others() {
    let server = MockServer::new();
    let mut h = harness(server.clone(), scratch_config()).await;
    let contended = h.controller.add(Averager::new("x"));
    let y_policy = Averager::new("y");
    let y_performed = Arc::clone(&y_policy.performed);
    let free = h.controller.add(y_policy);
    h.controller.start().await.expect("start");

    let editor = server.connect("editor").await.expect("editor");
    editor.transaction_begin(true).await.expect("begin");
    editor.set_transaction_status("editing x").await.expect("status");
    editor.lock_write("derived/x", 0, 10_000).await.expect("lock");

    server.notify("raw/x", 1000, 2000);
    server.notify("raw/y", 1000, 2000);
    wait_for_ready(&contended, &[(1000, 2000)]).await;
    wait_for_ready(&free, &[(1000, 2000)]).await;
    assert_eq!(h.controller.order(), vec!["x", "y"]);

    let progress = h.controller.do_any_update().await.expect("denied pass");
    assert_eq!(progress, UpdateProgress::Denied("x".into()));
    assert_eq!(h.controller.order(), vec!["y", "x"]);
    assert_eq!(contended.ready_ranges().await, vec![(1000, 2000)]);
    assert_eq!(server.held_intents("raw/x"), vec![(1000, 2000)]);

    let progress = h.controller.do_any_update().await.expect("free pass");
    assert_eq!(progress, UpdateProgress::Updated("y".into()));
    assert_eq!(*y_performed.lock(), vec![(1000, 2000)]);

    editor.transaction_commit().await.expect("commit");
    let progress = h.controller.do_any_update().await.expect("retry pass");
    assert_eq!(progress, UpdateProgress::Updated("x".into()));
    assert!(server.held_intents("raw/x").is_empty());

    h.controller.shutdown().await.expect("shutdown");
    editor.shutdown().await.expect("editor shutdown");
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn failed_update_is_reinstated() {
    let mut h = harness(MockServer::new(), scratch_config()).await;
    let policy = Averager::new("sgp");
    let fail_next = Arc::clone(&policy.fail_next);
    let performed = Arc::clone(&policy.performed);
    let manager = h.controller.add(policy);
    h.controller.start().await.expect("start");

    h.server.notify("raw/sgp", 1000, 2000);
    wait_for_ready(&manager, &[(1000, 2000)]).await;
    fail_next.store(true, Ordering::SeqCst);

    let err = h.controller.do_any_update().await.expect_err("policy failure");
    assert!(matches!(err, UpdaterError::Policy { ref station, .. } if station == "sgp"));
    assert_eq!(manager.ready_ranges().await, vec![(1000, 2000)]);
    assert_eq!(h.server.held_intents("raw/sgp"), vec![(1000, 2000)]);
    assert!(h.server.file("out/sgp/1000-2000").is_none());

    let progress = h.controller.do_any_update().await.expect("retry");
    assert_eq!(progress, UpdateProgress::Updated("sgp".into()));
    assert_eq!(*performed.lock(), vec![(1000, 2000)]);

    h.controller.shutdown().await.expect("shutdown");
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn dropped_ticket_puts_the_range_back() {
    let mut h = harness(MockServer::new(), scratch_config()).await;
    let manager = h.controller.add(Averager::new("sgp"));
    h.controller.start().await.expect("start");
    manager.merge(1000, 2000, true).await.expect("merge");

    let ticket = manager.next_update().await.expect("next").expect("ready range");
    assert_eq!(ticket.bounds(), (1000, 2000));
    assert!(manager.pending_ranges().await.is_empty());
    drop(ticket);

    wait_for_ready(&manager, &[(1000, 2000)]).await;
    assert_eq!(h.server.held_intents("raw/sgp"), vec![(1000, 2000)]);
    h.controller.shutdown().await.expect("shutdown");
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn intent_hit_schedules_reserved_range() {
    let server = MockServer::new();
    let mut h = harness(server.clone(), scratch_config()).await;
    let manager = h.controller.add(Averager::new("sgp").waiting_for_hits());
    h.controller.start().await.expect("start");

    server.notify("raw/sgp", 1000, 2000);
    server.notify("raw/sgp", 5000, 6000);
    wait_for_pending(&manager, &[(1000, 2000), (5000, 6000)]).await;
    assert!(manager.ready_ranges().await.is_empty());
    assert_eq!(h.controller.do_any_update().await.expect("idle"), UpdateProgress::Idle);

    let editor = server.connect("editor").await.expect("editor");
    editor.transaction_begin(true).await.expect("begin");
    editor.lock_write("raw/sgp", 1500, 1600).await.expect("lock");
    editor.transaction_commit().await.expect("commit");

    wait_for_ready(&manager, &[(1000, 2000)]).await;
    let progress = h.controller.do_any_update().await.expect("update");
    assert_eq!(progress, UpdateProgress::Updated("sgp".into()));
    assert_eq!(manager.pending_ranges().await, vec![(5000, 6000)]);

    h.controller.shutdown().await.expect("shutdown");
    editor.shutdown().await.expect("editor shutdown");
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn flush_marks_intersecting_ranges() {
    let mut h = harness(MockServer::new(), scratch_config()).await;
    let manager = h.controller.add(Averager::new("sgp").waiting_for_hits());
    h.controller.start().await.expect("start");
    manager.merge(1000, 2000, false).await.expect("merge");
    manager.merge(5000, 6000, false).await.expect("merge");
    manager.merge(9000, 9500, false).await.expect("merge");

    assert_eq!(manager.flush(5500, 9100).await, 2);
    assert_eq!(manager.ready_ranges().await, vec![(5000, 6000), (9000, 9500)]);
    assert_eq!(manager.flush(5500, 9100).await, 0, "already queued");

    h.controller.shutdown().await.expect("shutdown");
    cleanup(&h.config);
}

#[test_timeout::tokio_timeout_test]
async fn reload_after_crash_loses_nothing() {
    let server = MockServer::new();
    let config = scratch_config();
    server.put_file("data/sgp/1000-2000", "a");

    let mut first = harness(server.clone(), config.clone()).await;
    let manager = first.controller.add(Averager::new("sgp"));
    first.controller.start().await.expect("start");
    assert_eq!(manager.pending_ranges().await, vec![(1000, 2000)]);
    server.notify("raw/sgp", 5000, 6000);
    wait_for_pending(&manager, &[(1000, 2000), (5000, 6000)]).await;
    let before = manager.pending_ranges().await;

    // Crash: the connection dies with the manager's intents still held.
    first.controller.connection().abort();
    drop(manager);
    drop(first);
    while !server.session_names().is_empty() {
        sleep(Duration::from_millis(5)).await;
    }

    server.put_file("data/sgp/8000-9000", "b");
    let mut second = harness(server.clone(), config.clone()).await;
    let reloaded = second.controller.add(Averager::new("sgp"));
    second.controller.start().await.expect("restart");

    let mut expected = before;
    expected.push((8000, 9000));
    assert_eq!(reloaded.pending_ranges().await, expected);
    assert_eq!(reloaded.ready_ranges().await.len(), 3);
    assert_eq!(server.held_intents("raw/sgp"), expected);

    second.controller.shutdown().await.expect("shutdown");
    cleanup(&config);
}

#[test_timeout::tokio_timeout_test]
async fn newer_state_version_refuses_to_load() {
    let server = MockServer::new();
    let config = scratch_config();
    let file = StateFile::for_station(&config.state_dir, "sgp");
    let mut future = PersistedState::new(0, vec![(1, 2)]);
    future.version += 1;
    file.store(&future).await.expect("store");

    let mut h = harness(server, config).await;
    h.controller.add(Averager::new("sgp"));
    let err = h.controller.start().await.expect_err("version mismatch");
    assert!(matches!(err, UpdaterError::StateVersion { found: 2, .. }), "{err}");

    h.controller.shutdown().await.expect("shutdown");
    let untouched = std::fs::read_to_string(file.path()).expect("state file");
    assert!(untouched.contains("\"version\":2"), "{untouched}");
    cleanup(&h.config);
}

struct CountingHook {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IdleHook for CountingHook {
    fn cadence(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn on_idle(&mut self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[test_timeout::tokio_timeout_test]
async fn run_loop_wakes_on_ready_work_and_stops() {
    let server = MockServer::new();
    let mut h = harness(server.clone(), scratch_config()).await;
    let policy = Averager::new("sgp");
    let performed = Arc::clone(&policy.performed);
    h.controller.add(policy);
    h.controller.start().await.expect("start");

    let calls = Arc::new(AtomicUsize::new(0));
    let mut hook = CountingHook {
        calls: Arc::clone(&calls),
    };
    let (stop, stopped) = watch::channel(false);

    let drive = async {
        while calls.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        server.notify("raw/sgp", 1000, 2000);
        while performed.lock().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
        stop.send(true).expect("controller listening");
    };
    let (result, ()) = tokio::join!(h.controller.run(stopped, Some(&mut hook as &mut dyn IdleHook)), drive);
    result.expect("run");

    assert_eq!(*performed.lock(), vec![(1000, 2000)]);
    h.controller.shutdown().await.expect("shutdown");
    cleanup(&h.config);
}
