use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn station_counter(name: &str, help: &str) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), &["station"])
        .expect("station counter options are valid");
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
}

pub static UPDATES_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    station_counter(
        "archive_updates_completed_total",
        "updates that committed, by station",
    )
});

pub static UPDATES_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    station_counter(
        "archive_updates_failed_total",
        "updates that failed and were reinstated, by station",
    )
});

pub static LOCK_DENIED: Lazy<IntCounterVec> = Lazy::new(|| {
    station_counter(
        "archive_updates_lock_denied_total",
        "updates abandoned on a lock denial, by station",
    )
});

pub static NOTIFICATIONS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    station_counter(
        "archive_notifications_received_total",
        "notifications merged into the backlog, by station",
    )
});

pub static INTENT_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    station_counter(
        "archive_intent_hits_total",
        "intent hits received, by station",
    )
});

pub static PENDING_RANGES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("archive_pending_ranges", "ranges awaiting recomputation, by station"),
        &["station"],
    )
    .expect("pending gauge options are valid");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
