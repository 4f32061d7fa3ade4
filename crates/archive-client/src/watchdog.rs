use std::time::Duration;

use futures::Stream;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::warn;

use crate::connection::Connection;
use crate::error::ConnectionResult;

/// One liveness observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogTick {
    /// Nothing arrived from the server within the heartbeat timeout.
    pub stale_heartbeat: bool,
    /// The outstanding request has waited longer than the request timeout.
    pub stalled_request: bool,
}

impl WatchdogTick {
    pub fn is_healthy(&self) -> bool {
        !self.stale_heartbeat && !self.stalled_request
    }
}

/// Periodic liveness ticks for a connection, used to drive external keepalive
/// signalling such as a service manager watchdog.
pub struct Watchdog {
    connection: Connection,
    interval: Interval,
    heartbeat_timeout: Duration,
    request_timeout: Duration,
}

impl Connection {
    pub fn periodic_watchdog(
        &self,
        interval: Duration,
        heartbeat_timeout: Duration,
        request_timeout: Duration,
    ) -> Watchdog {
        let mut ticks = interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Watchdog {
            connection: self.clone(),
            interval: ticks,
            heartbeat_timeout,
            request_timeout,
        }
    }
}

impl Watchdog {
    /// Waits for the next period and reports what it saw. Fails once the
    /// connection has closed.
    pub async fn tick(&mut self) -> ConnectionResult<WatchdogTick> {
        self.interval.tick().await;
        let shared = &self.connection.shared;
        if shared.is_closed() {
            return Err(shared.failure());
        }

        let silent = shared.activity.since_last_received();
        let waiting = shared.activity.request_age();
        let tick = WatchdogTick {
            stale_heartbeat: silent >= self.heartbeat_timeout,
            stalled_request: waiting.is_some_and(|age| age >= self.request_timeout),
        };
        if tick.stale_heartbeat {
            warn!(
                name = %self.connection.name(),
                silent_ms = silent.as_millis() as u64,
                "archive server stopped answering heartbeats"
            );
        }
        if tick.stalled_request {
            warn!(
                name = %self.connection.name(),
                waiting_ms = waiting.unwrap_or_default().as_millis() as u64,
                "archive request is taking too long"
            );
        }
        Ok(tick)
    }

    /// The ticks as a stream that ends when the connection closes.
    pub fn into_stream(self) -> impl Stream<Item = WatchdogTick> + Send {
        futures::stream::unfold(self, |mut watchdog| async move {
            let tick = watchdog.tick().await.ok()?;
            Some((tick, watchdog))
        })
    }
}
