//! Dialog dispatcher: owns the worker pool and routes every inbound event
//! to the worker that owns its dialog.
//!
//! Shard placement is `fnv1a(dialog_id) mod N` with a fixed-key hash, so an
//! event for a given dialog always lands on the same worker for the life of
//! the process, and recovery placement is reproducible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sub_core::{dialog_id, Error, SipEvent, SubscriptionRecord};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::services::Services;
use crate::worker::{DialogWorker, StaleSubscription, WorkerCommand, WorkerHandle, WorkerStats};

/// Stats summed over the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub presence_triggers: u64,
    pub dialogs_active: u64,
    pub dialogs_reaped: u64,
    pub slow_events: u64,
    pub notify_errors: u64,
    pub max_queue_depth: u64,
}

pub struct DialogDispatcher {
    handles: Vec<WorkerHandle>,
    seeds: Mutex<Vec<Option<DialogWorker>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl DialogDispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        let n = services.config.num_workers();
        let (shutdown_tx, _) = watch::channel(false);

        let mut seeds = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for index in 0..n {
            let (worker, handle) =
                DialogWorker::new(index, Arc::clone(&services), shutdown_tx.subscribe());
            seeds.push(Some(worker));
            handles.push(handle);
        }
        info!(workers = n, "dialog dispatcher created");

        Self {
            handles,
            seeds: Mutex::new(seeds),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    pub fn worker_index_for(&self, dialog_id: &str) -> usize {
        (fnv1a64(dialog_id.as_bytes()) % self.handles.len() as u64) as usize
    }

    /// Hands a recovered record to its owning worker. Must run before
    /// `start`; afterwards the workers own their state exclusively.
    pub fn load_recovered_subscription(&self, record: SubscriptionRecord) -> Result<(), Error> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyExists);
        }
        let index = self.worker_index_for(&record.dialog_id);
        let mut seeds = self.seeds.lock();
        match seeds[index].as_mut() {
            Some(worker) => {
                worker.load_recovered_subscription(record);
                Ok(())
            }
            None => Err(Error::ShuttingDown),
        }
    }

    /// Spawns every worker task. All-or-nothing: a dispatcher can only be
    /// started once.
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyExists);
        }
        let mut seeds = self.seeds.lock();
        let mut tasks = self.tasks.lock();
        for seed in seeds.iter_mut() {
            let worker = seed.take().expect("worker seeds consumed only here");
            tasks.push(tokio::spawn(worker.run()));
        }
        info!(workers = self.handles.len(), "dialog dispatcher started");
        Ok(())
    }

    /// Signals every worker and waits for them to drain and exit.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("dialog dispatcher stopped");
    }

    /// Routes one event to the worker owning its dialog.
    pub fn dispatch(&self, mut event: SipEvent) -> Result<(), Error> {
        if !self.started.load(Ordering::Acquire) || *self.shutdown_tx.borrow() {
            return Err(Error::ShuttingDown);
        }
        if !dialog_id::is_valid(&event.dialog_id) {
            return Err(Error::InvalidArgument);
        }
        event.enqueued_at = Some(std::time::Instant::now());

        let handle = &self.handles[self.worker_index_for(&event.dialog_id)];
        match handle.try_enqueue(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                handle.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::CapacityExceeded)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShuttingDown),
        }
    }

    /// Queues a dialog for termination on its owning worker.
    pub fn force_terminate(&self, dialog_id: &str) -> Result<(), Error> {
        let handle = &self.handles[self.worker_index_for(dialog_id)];
        if handle.send_command(WorkerCommand::ForceTerminate(dialog_id.to_owned())) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Asks one worker for its stale dialogs; empty when the worker is
    /// gone or too busy to answer in time.
    pub async fn collect_stale(
        &self,
        worker_index: usize,
        blf_ttl: Duration,
        mwi_ttl: Duration,
        stuck_timeout: Duration,
    ) -> Vec<StaleSubscription> {
        let Some(handle) = self.handles.get(worker_index) else {
            return Vec::new();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if !handle.send_command(WorkerCommand::CollectStale {
            blf_ttl,
            mwi_ttl,
            stuck_timeout,
            reply: reply_tx,
        }) {
            return Vec::new();
        }
        match timeout(Duration::from_secs(5), reply_rx).await {
            Ok(Ok(stale)) => stale,
            _ => {
                warn!(worker = worker_index, "stale scan reply timed out");
                Vec::new()
            }
        }
    }

    pub fn worker_stats(&self) -> Vec<(usize, Arc<WorkerStats>)> {
        self.handles
            .iter()
            .map(|h| (h.index, Arc::clone(&h.stats)))
            .collect()
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        let mut agg = AggregateStats::default();
        for handle in &self.handles {
            let s = &handle.stats;
            agg.events_received += s.events_received.load(Ordering::Relaxed);
            agg.events_processed += s.events_processed.load(Ordering::Relaxed);
            agg.events_dropped += s.events_dropped.load(Ordering::Relaxed);
            agg.presence_triggers += s.presence_triggers.load(Ordering::Relaxed);
            agg.dialogs_active += s.dialogs_active.load(Ordering::Relaxed);
            agg.dialogs_reaped += s.dialogs_reaped.load(Ordering::Relaxed);
            agg.slow_events += s.slow_events.load(Ordering::Relaxed);
            agg.notify_errors += s.notify_errors.load(Ordering::Relaxed);
            agg.max_queue_depth = agg
                .max_queue_depth
                .max(s.queue_depth.load(Ordering::Relaxed));
        }
        agg
    }
}

/// FNV-1a; deterministic across processes, unlike the std hasher.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_is_stable() {
        // Spot values so a refactor cannot silently change shard placement.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        let h1 = fnv1a64(b"call-1;ft=a;tt=b");
        let h2 = fnv1a64(b"call-1;ft=a;tt=b");
        assert_eq!(h1, h2);
        assert_ne!(fnv1a64(b"call-1"), fnv1a64(b"call-2"));
    }
}
