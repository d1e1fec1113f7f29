// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The batched write pipeline and cold-start recovery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use sub_core::{Error, SubscriptionRecord};

use crate::backend::DocumentBackend;
use crate::doc::SubscriptionDoc;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Disabled mode: every operation is a no-op returning Ok.
    pub enabled: bool,
    /// Stamped into each document for provenance.
    pub service_id: String,
    pub sync_interval: Duration,
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_id: "lampd-01".to_owned(),
            sync_interval: Duration::from_secs(5),
            batch_size: 500,
        }
    }
}

#[derive(Default)]
pub struct StoreStats {
    pub upserts: AtomicU64,
    pub deletes: AtomicU64,
    pub loads: AtomicU64,
    pub errors: AtomicU64,
    pub batch_writes: AtomicU64,
    pub queue_depth: AtomicU64,
}

/// A recovered subscription. The resuming instance owes the watcher a
/// full-state NOTIFY as soon as it can send one.
#[derive(Debug, Clone)]
pub struct StoredSubscription {
    pub record: SubscriptionRecord,
    pub needs_full_state_notify: bool,
}

enum PendingOp {
    Upsert(Box<SubscriptionDoc>),
    Delete(String),
}

pub struct SubscriptionStore {
    config: StoreConfig,
    backend: Arc<dyn DocumentBackend>,
    stats: Arc<StoreStats>,
    queue: Arc<Mutex<VecDeque<PendingOp>>>,
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionStore {
    pub fn new(config: StoreConfig, backend: Arc<dyn DocumentBackend>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            backend,
            stats: Arc::new(StoreStats::default()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            wake: Arc::new(Notify::new()),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Starts the sync task. With persistence enabled the backend must
    /// answer a ping, otherwise start-up fails.
    pub async fn start(&self) -> Result<(), Error> {
        if !self.config.enabled {
            info!("subscription persistence disabled");
            return Ok(());
        }
        if self.task.lock().is_some() {
            return Err(Error::AlreadyExists);
        }

        self.backend
            .ping()
            .await
            .map_err(|e| Error::Persistence(format!("backend unreachable: {}", e)))?;

        let syncer = SyncTask {
            backend: Arc::clone(&self.backend),
            stats: Arc::clone(&self.stats),
            queue: Arc::clone(&self.queue),
            wake: Arc::clone(&self.wake),
            shutdown: self.shutdown_tx.subscribe(),
            sync_interval: self.config.sync_interval,
        };
        *self.task.lock() = Some(tokio::spawn(syncer.run()));

        info!(
            sync_secs = self.config.sync_interval.as_secs(),
            batch = self.config.batch_size,
            "subscription store started"
        );
        Ok(())
    }

    /// Stops the sync task and flushes whatever is still queued.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = self.shutdown_tx.send(true);
            self.wake.notify_one();
            let _ = task.await;
        }
        flush_pending(&self.backend, &self.stats, &self.queue).await;
        info!("subscription store stopped");
    }

    /// Queues a record for the next batch flush.
    pub fn queue_upsert(&self, record: &SubscriptionRecord) {
        if !self.config.enabled {
            return;
        }
        let doc = SubscriptionDoc::from_record(record, &self.config.service_id);
        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(PendingOp::Upsert(Box::new(doc)));
            queue.len()
        };
        self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
        if depth >= self.config.batch_size {
            self.wake.notify_one();
        }
    }

    pub fn queue_delete(&self, dialog_id: &str) {
        if !self.config.enabled {
            return;
        }
        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(PendingOp::Delete(dialog_id.to_owned()));
            queue.len()
        };
        self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
        if depth >= self.config.batch_size {
            self.wake.notify_one();
        }
    }

    /// Synchronous upsert for critical transitions. Failures are surfaced
    /// but never stop the caller; the in-memory effect already holds.
    pub async fn save_immediately(&self, record: &SubscriptionRecord) -> Result<(), Error> {
        if !self.config.enabled {
            return Ok(());
        }
        let doc = SubscriptionDoc::from_record(record, &self.config.service_id);
        match self.backend.upsert(doc).await {
            Ok(()) => {
                self.stats.upserts.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(dialog_id = %record.dialog_id, error = %e, "immediate save failed");
                Err(e)
            }
        }
    }

    pub async fn delete_immediately(&self, dialog_id: &str) -> Result<(), Error> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.backend.delete(dialog_id).await {
            Ok(()) => {
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(dialog_id, error = %e, "immediate delete failed");
                Err(e)
            }
        }
    }

    /// Reads every resumable subscription for cold-start recovery.
    pub async fn load_active_subscriptions(&self) -> Result<Vec<StoredSubscription>, Error> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let docs = self
            .backend
            .find_by_lifecycle(&["Active", "Pending"])
            .await
            .map_err(|e| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                e
            })?;

        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            if doc.dialog_id.is_empty() {
                continue;
            }
            out.push(StoredSubscription {
                record: doc.into_record(),
                needs_full_state_notify: true,
            });
            self.stats.loads.fetch_add(1, Ordering::Relaxed);
        }
        info!(count = out.len(), "loaded subscriptions for recovery");
        Ok(out)
    }

    pub async fn load_subscription(&self, dialog_id: &str) -> Result<StoredSubscription, Error> {
        if !self.config.enabled {
            return Err(Error::NotFound);
        }
        match self.backend.find(dialog_id).await? {
            Some(doc) => Ok(StoredSubscription {
                record: doc.into_record(),
                needs_full_state_notify: true,
            }),
            None => Err(Error::NotFound),
        }
    }
}

struct SyncTask {
    backend: Arc<dyn DocumentBackend>,
    stats: Arc<StoreStats>,
    queue: Arc<Mutex<VecDeque<PendingOp>>>,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    sync_interval: Duration,
}

impl SyncTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    flush_pending(&self.backend, &self.stats, &self.queue).await;
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = self.wake.notified() => {
                    flush_pending(&self.backend, &self.stats, &self.queue).await;
                }
                _ = sleep(self.sync_interval) => {
                    flush_pending(&self.backend, &self.stats, &self.queue).await;
                }
            }
        }
    }
}

async fn flush_pending(
    backend: &Arc<dyn DocumentBackend>,
    stats: &Arc<StoreStats>,
    queue: &Arc<Mutex<VecDeque<PendingOp>>>,
) {
    let batch = {
        let mut queue = queue.lock();
        stats.queue_depth.store(0, Ordering::Relaxed);
        std::mem::take(&mut *queue)
    };
    if batch.is_empty() {
        return;
    }

    let started = Instant::now();
    let count = batch.len();

    for op in batch {
        let result = match op {
            PendingOp::Upsert(doc) => {
                let r = backend.upsert(*doc).await;
                if r.is_ok() {
                    stats.upserts.fetch_add(1, Ordering::Relaxed);
                }
                r
            }
            PendingOp::Delete(dialog_id) => {
                let r = backend.delete(&dialog_id).await;
                if r.is_ok() {
                    stats.deletes.fetch_add(1, Ordering::Relaxed);
                }
                r
            }
        };
        if let Err(e) = result {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "batched store operation failed");
        }
    }

    stats.batch_writes.fetch_add(1, Ordering::Relaxed);
    let elapsed = started.elapsed();
    if elapsed > Duration::from_millis(100) {
        warn!(
            ops = count,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow batch flush"
        );
    }
}
