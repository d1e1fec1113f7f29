//! Stale subscription reaper.
//!
//! A periodic sweep over every worker: dialogs whose activity or expiry has
//! lapsed, and dialogs stuck mid-processing past the timeout, are handed
//! back to their owning worker for termination and queued as store deletes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sub_store::SubscriptionStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::dispatcher::DialogDispatcher;

#[derive(Default)]
pub struct ReaperStats {
    pub scan_count: AtomicU64,
    pub expired_reaped: AtomicU64,
    pub stuck_reaped: AtomicU64,
    pub last_scan_duration_ms: AtomicU64,
    pub last_scan_stale_count: AtomicU64,
}

pub struct StaleSubscriptionReaper {
    stats: Arc<ReaperStats>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StaleSubscriptionReaper {
    pub fn start(
        config: Arc<DaemonConfig>,
        dispatcher: Arc<DialogDispatcher>,
        store: Arc<SubscriptionStore>,
    ) -> Self {
        let stats = Arc::new(ReaperStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = ReaperTask {
            scan_interval: Duration::from_secs(config.reaper.scan_interval_secs),
            blf_ttl: config.blf_ttl(),
            mwi_ttl: config.mwi_ttl(),
            stuck_timeout: config.stuck_timeout(),
            dispatcher,
            store,
            stats: Arc::clone(&stats),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        info!("stale subscription reaper started");

        Self {
            stats,
            shutdown_tx,
            task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub fn stats(&self) -> &ReaperStats {
        &self.stats
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("stale subscription reaper stopped");
        }
    }
}

struct ReaperTask {
    scan_interval: Duration,
    blf_ttl: Duration,
    mwi_ttl: Duration,
    stuck_timeout: Duration,
    dispatcher: Arc<DialogDispatcher>,
    store: Arc<SubscriptionStore>,
    stats: Arc<ReaperStats>,
    shutdown: watch::Receiver<bool>,
}

impl ReaperTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = sleep(self.scan_interval) => {}
            }
            self.scan_and_reap().await;
        }
    }

    async fn scan_and_reap(&self) {
        let started = Instant::now();
        self.stats.scan_count.fetch_add(1, Ordering::Relaxed);
        let mut total = 0u64;

        for worker_index in 0..self.dispatcher.num_workers() {
            let stale = self
                .dispatcher
                .collect_stale(worker_index, self.blf_ttl, self.mwi_ttl, self.stuck_timeout)
                .await;

            for info in stale {
                if info.is_stuck {
                    self.stats.stuck_reaped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        dialog_id = %info.dialog_id,
                        tenant = %info.tenant_id,
                        "reaping stuck subscription"
                    );
                } else {
                    self.stats.expired_reaped.fetch_add(1, Ordering::Relaxed);
                }

                if let Err(e) = self.dispatcher.force_terminate(&info.dialog_id) {
                    warn!(dialog_id = %info.dialog_id, error = %e, "force terminate failed");
                }
                self.store.queue_delete(&info.dialog_id);
                total += 1;
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.stats
            .last_scan_duration_ms
            .store(elapsed_ms, Ordering::Relaxed);
        self.stats
            .last_scan_stale_count
            .store(total, Ordering::Relaxed);
        if total > 0 {
            info!(reaped = total, elapsed_ms, "reaper scan complete");
        }
    }
}
