//! Presence event router.
//!
//! Translates each raw call-state event into per-watcher NOTIFY triggers
//! and fans them into the dialog dispatcher. The ingress queue is bounded
//! and lossy so backpressure never blocks the presence TCP reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use presence_feed::CallStateEvent;
use sub_core::{blf, BlfWatcherIndex, SipEvent, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dispatcher::DialogDispatcher;

#[derive(Default)]
pub struct RouterStats {
    pub events_received: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    pub notifications_generated: AtomicU64,
    pub watchers_not_found: AtomicU64,
    pub queue_depth: AtomicU64,
}

/// Producer-side handle given to the TCP client.
#[derive(Clone)]
pub struct RouterIngress {
    tx: mpsc::Sender<CallStateEvent>,
    stats: Arc<RouterStats>,
    capacity: usize,
}

impl RouterIngress {
    /// Lossy enqueue; a full queue drops the event with a counter bump.
    pub fn deliver(&self, event: CallStateEvent) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(event) {
            Ok(()) => {
                let depth = self.capacity - self.tx.capacity();
                self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(call = %event.presence_call_id, "router queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct PresenceEventRouter {
    ingress: RouterIngress,
    stats: Arc<RouterStats>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PresenceEventRouter {
    pub fn new(
        max_pending_events: usize,
        dispatcher: Arc<DialogDispatcher>,
        index: Arc<BlfWatcherIndex>,
    ) -> Self {
        let capacity = max_pending_events.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(RouterStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = RouterTask {
            rx,
            dispatcher,
            index,
            stats: Arc::clone(&stats),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        info!("presence event router started");

        Self {
            ingress: RouterIngress {
                tx,
                stats: Arc::clone(&stats),
                capacity,
            },
            stats,
            shutdown_tx,
            task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub fn ingress(&self) -> RouterIngress {
        self.ingress.clone()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn on_connection_state_changed(connected: bool, detail: &str) {
        info!(connected, detail, "presence connection state changed");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("presence event router stopped");
        }
    }
}

struct RouterTask {
    rx: mpsc::Receiver<CallStateEvent>,
    dispatcher: Arc<DialogDispatcher>,
    index: Arc<BlfWatcherIndex>,
    stats: Arc<RouterStats>,
    shutdown: watch::Receiver<bool>,
}

impl RouterTask {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.stats.queue_depth.store(
                self.rx.len() as u64,
                Ordering::Relaxed,
            );
            self.route(event);
        }
    }

    fn route(&self, event: CallStateEvent) {
        if !event.is_valid {
            self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Watchers of either party light up; callee watchers win ties.
        let callee_watchers = self.index.lookup(&event.callee_uri);
        let caller_watchers = self.index.lookup(&event.caller_uri);

        let mut watchers: Vec<Watcher> = callee_watchers.clone();
        for watcher in &caller_watchers {
            if !watchers.iter().any(|w| w.dialog_id == watcher.dialog_id) {
                watchers.push(watcher.clone());
            }
        }

        if watchers.is_empty() {
            self.stats.watchers_not_found.fetch_add(1, Ordering::Relaxed);
            trace!(
                callee = %event.callee_uri,
                caller = %event.caller_uri,
                "no watchers for call-state event"
            );
            self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let blf_state = event.state.as_blf_state();
        debug!(
            call = %event.presence_call_id,
            state = blf_state,
            watchers = watchers.len(),
            "routing call-state event"
        );

        for watcher in &watchers {
            let monitored =
                if callee_watchers.iter().any(|w| w.dialog_id == watcher.dialog_id) {
                    &event.callee_uri
                } else {
                    &event.caller_uri
                };

            let body = blf::build_dialog_info_snapshot(
                monitored,
                &event.presence_call_id,
                blf_state,
                &event.direction,
                &event.caller_uri,
                &event.callee_uri,
            );
            let trigger = SipEvent::presence_trigger(
                watcher.dialog_id.clone(),
                watcher.tenant_id.clone(),
                &event.presence_call_id,
                &event.caller_uri,
                &event.callee_uri,
                blf_state,
                &event.direction,
                body,
            );

            match self.dispatcher.dispatch(trigger) {
                Ok(()) => {
                    self.stats
                        .notifications_generated
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        dialog_id = %watcher.dialog_id,
                        error = %e,
                        "presence trigger dispatch failed"
                    );
                }
            }
        }

        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
    }
}
