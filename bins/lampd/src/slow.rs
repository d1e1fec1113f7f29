//! Slow-event supervision.
//!
//! Every processed event runs under a timer; crossing a threshold logs at
//! the matching severity and bumps a counter. Thresholds are atomics so the
//! HTTP surface can adjust them at runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::config::SlowEventConfig;

#[derive(Default)]
pub struct SlowEventStats {
    pub warn_count: AtomicU64,
    pub error_count: AtomicU64,
    pub critical_count: AtomicU64,
    pub max_duration_ms: AtomicU64,
}

pub struct SlowEventLogger {
    warn_ms: AtomicU64,
    error_ms: AtomicU64,
    critical_ms: AtomicU64,
    stats: SlowEventStats,
}

impl SlowEventLogger {
    pub fn new(config: &SlowEventConfig) -> Self {
        Self {
            warn_ms: AtomicU64::new(config.warn_threshold_ms),
            error_ms: AtomicU64::new(config.error_threshold_ms),
            critical_ms: AtomicU64::new(config.critical_threshold_ms),
            stats: SlowEventStats::default(),
        }
    }

    pub fn set_thresholds(&self, warn: Duration, error: Duration, critical: Duration) {
        self.warn_ms.store(warn.as_millis() as u64, Ordering::Relaxed);
        self.error_ms.store(error.as_millis() as u64, Ordering::Relaxed);
        self.critical_ms
            .store(critical.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn warn_threshold(&self) -> Duration {
        Duration::from_millis(self.warn_ms.load(Ordering::Relaxed))
    }

    pub fn thresholds_ms(&self) -> (u64, u64, u64) {
        (
            self.warn_ms.load(Ordering::Relaxed),
            self.error_ms.load(Ordering::Relaxed),
            self.critical_ms.load(Ordering::Relaxed),
        )
    }

    pub fn stats(&self) -> &SlowEventStats {
        &self.stats
    }

    /// Starts a timer scoped to one event. Dropping it without `finish`
    /// also records.
    pub fn timer<'a>(&'a self, operation: &'a str, dialog_id: &str) -> SlowEventTimer<'a> {
        SlowEventTimer {
            logger: self,
            operation,
            dialog_id: dialog_id.to_owned(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn check_and_log(&self, operation: &str, dialog_id: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;

        let mut prev_max = self.stats.max_duration_ms.load(Ordering::Relaxed);
        while ms > prev_max {
            match self.stats.max_duration_ms.compare_exchange_weak(
                prev_max,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => prev_max = seen,
            }
        }

        let critical = self.critical_ms.load(Ordering::Relaxed);
        let err = self.error_ms.load(Ordering::Relaxed);
        let warn_at = self.warn_ms.load(Ordering::Relaxed);

        if ms >= critical {
            self.stats.critical_count.fetch_add(1, Ordering::Relaxed);
            error!(operation, dialog_id, elapsed_ms = ms, "critically slow event");
        } else if ms >= err {
            self.stats.error_count.fetch_add(1, Ordering::Relaxed);
            error!(operation, dialog_id, elapsed_ms = ms, "slow event");
        } else if ms >= warn_at {
            self.stats.warn_count.fetch_add(1, Ordering::Relaxed);
            warn!(operation, dialog_id, elapsed_ms = ms, "slow event");
        }
    }
}

pub struct SlowEventTimer<'a> {
    logger: &'a SlowEventLogger,
    operation: &'a str,
    dialog_id: String,
    started: Instant,
    finished: bool,
}

impl SlowEventTimer<'_> {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.started.elapsed();
        self.logger
            .check_and_log(self.operation, &self.dialog_id, elapsed);
        elapsed
    }
}

impl Drop for SlowEventTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.started.elapsed();
            self.logger
                .check_and_log(self.operation, &self.dialog_id, elapsed);
        }
    }
}
