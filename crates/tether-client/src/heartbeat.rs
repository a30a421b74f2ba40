//! Ping/pong liveness for socket transports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No pong arrived within the timeout after a ping.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Pong bookkeeping shared between the driver and the heartbeat task.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    pongs: AtomicU64,
    last_pong: Mutex<Option<Instant>>,
    notify: Notify,
}

impl HeartbeatMonitor {
    /// Ping every `interval`, allow `timeout` for each pong.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            pongs: AtomicU64::new(0),
            last_pong: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Ping period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pong deadline after each ping.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record an inbound pong.
    pub fn record_pong(&self) {
        *self.last_pong.lock() = Some(Instant::now());
        let _ = self.pongs.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Total pongs recorded.
    pub fn pong_count(&self) -> u64 {
        self.pongs.load(Ordering::Acquire)
    }

    /// When the last pong arrived.
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }

    /// Wait until a pong newer than `seen` is recorded.
    async fn pong_after(&self, seen: u64) {
        loop {
            // Register before checking so a pong between the check and the
            // await is not missed.
            let notified = self.notify.notified();
            if self.pong_count() > seen {
                return;
            }
            notified.await;
        }
    }
}

/// Drive the ping/pong cycle until a pong is missed or `cancel` fires.
///
/// Every `interval` the counter is sampled and `ping` is invoked; a pong must
/// be recorded within `timeout` of that ping.
pub async fn run_heartbeat<F>(
    monitor: &HeartbeatMonitor,
    ping: F,
    cancel: CancellationToken,
) -> HeartbeatResult
where
    F: Fn(),
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = time::sleep(monitor.interval()) => {}
        }

        let seen = monitor.pong_count();
        ping();

        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            answered = time::timeout(monitor.timeout(), monitor.pong_after(seen)) => {
                if answered.is_err() {
                    return HeartbeatResult::TimedOut;
                }
            }
        }
    }
}
