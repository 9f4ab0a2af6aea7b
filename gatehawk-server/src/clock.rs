use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::events::{Event, EventBus};

/// Monotonic clock with a monotonic-to-wall offset.
///
/// The offset is recorded at startup and re-synced by the watcher task if the
/// wall clock jumps (e.g. NTP sync after boot). Once any race has started the
/// offset is frozen so saved timestamps stay consistent.
pub struct Clock {
    start: Instant,
    /// epoch ms corresponding to monotonic second 0.
    offset_ms: AtomicI64,
    frozen: AtomicBool,
}

impl Clock {
    pub fn new() -> Self {
        let epoch_now = epoch_millis_now();
        Self {
            start: Instant::now(),
            offset_ms: AtomicI64::new(epoch_now),
            frozen: AtomicBool::new(false),
        }
    }

    /// Monotonic seconds since process start.
    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Convert a monotonic timestamp to wall-clock epoch milliseconds.
    pub fn to_epoch_millis(&self, monotonic_secs: f64) -> f64 {
        self.offset_ms.load(Ordering::Relaxed) as f64 + monotonic_secs * 1000.0
    }

    /// Program start as epoch milliseconds.
    pub fn program_start_epoch_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Stop the watcher from adjusting the offset. Called when the first
    /// race starts.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Relaxed);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    /// Re-anchor the offset against the current wall clock. Returns the
    /// adjustment in milliseconds when one was applied.
    pub fn resync(&self, drift_threshold_ms: i64) -> Option<i64> {
        let mt = self.now();
        let epoch_now = epoch_millis_now();
        let diff_ms = epoch_now - self.to_epoch_millis(mt) as i64;
        if diff_ms.abs() > drift_threshold_ms {
            let new_offset = epoch_now - (mt * 1000.0) as i64;
            self.offset_ms.store(new_offset, Ordering::Relaxed);
            Some(diff_ms)
        } else {
            None
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn epoch_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const CLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DRIFT_THRESHOLD_MS: i64 = 30_000;

/// Watch for wall-clock jumps until the first race starts. On adjustment the
/// new program start epoch is published so joined cluster primaries receive
/// an updated `join_cluster_response`.
pub fn spawn_clock_watcher(clock: Arc<Clock>, bus: Arc<EventBus>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLOCK_CHECK_INTERVAL).await;
            if clock.is_frozen() {
                break;
            }
            if let Some(diff_ms) = clock.resync(DRIFT_THRESHOLD_MS) {
                info!(
                    shift_secs = diff_ms as f64 / 1000.0,
                    prog_start_epoch = clock.program_start_epoch_ms(),
                    "Adjusting program start epoch for system clock shift"
                );
                bus.publish(
                    Event::ClusterJoin,
                    serde_json::json!({
                        "prog_start_epoch": clock.program_start_epoch_ms(),
                        "resync": true,
                    }),
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_conversion_tracks_monotonic_time() {
        let clock = Clock::new();
        let a = clock.to_epoch_millis(clock.now());
        let b = clock.to_epoch_millis(clock.now());
        assert!(b >= a, "epoch conversion must be non-decreasing");
    }

    #[test]
    fn resync_applies_only_past_threshold() {
        let clock = Clock::new();
        // Freshly anchored clock has no drift.
        assert_eq!(clock.resync(30_000), None);

        // Force an artificial 60s drift by shifting the stored offset.
        let shifted = clock.offset_ms.load(Ordering::Relaxed) - 60_000;
        clock.offset_ms.store(shifted, Ordering::Relaxed);
        let before = clock.to_epoch_millis(clock.now()) as i64;
        let adjustment = clock.resync(30_000).expect("drift should trigger resync");
        // Offset change equals the observed drift, within scheduling slop.
        let after = clock.to_epoch_millis(clock.now()) as i64;
        assert!((after - before - adjustment).abs() < 100);
    }

    #[test]
    fn freeze_is_sticky() {
        let clock = Clock::new();
        assert!(!clock.is_frozen());
        clock.freeze();
        assert!(clock.is_frozen());
    }
}
