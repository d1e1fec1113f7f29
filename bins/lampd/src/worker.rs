//! Dialog worker: single-task owner of a shard of dialogs.
//!
//! Each worker is the sole consumer of its bounded inbound channel and the
//! sole owner of its dialog map, so per-dialog FIFO order and the
//! at-most-one-owner rule need no locks. One loop pass drains the inbound
//! queue into a local batch, applies force-terminates, distributes the batch
//! to per-dialog queues, then processes at most one event per dialog so an
//! active dialog cannot starve the rest.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use sub_core::{
    blf, mwi, BlfProcessor, DialogHandle, Lifecycle, MwiProcessor, NotifyPayload, SipDirection,
    SipEvent, SipEventCategory, SipEventSource, SubscriptionInfo, SubscriptionRecord,
    SubscriptionType,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::services::Services;

/// Per-dialog queue GC runs every this many loop passes.
const CLEANUP_INTERVAL: u64 = 1000;

/// Loop tick when idle; bounds how stale cleanup and shutdown checks get.
const IDLE_TICK: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct WorkerStats {
    pub events_received: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    pub presence_triggers: AtomicU64,
    pub dialogs_active: AtomicU64,
    pub dialogs_reaped: AtomicU64,
    pub queue_depth: AtomicU64,
    pub slow_events: AtomicU64,
    pub notify_errors: AtomicU64,
}

/// One stale or stuck dialog, as reported to the reaper.
#[derive(Debug, Clone)]
pub struct StaleSubscription {
    pub dialog_id: String,
    pub tenant_id: String,
    pub kind: SubscriptionType,
    pub lifecycle: Lifecycle,
    pub is_stuck: bool,
}

/// Out-of-band requests; these bypass the bounded event queue so a full
/// queue can never block a termination.
pub enum WorkerCommand {
    ForceTerminate(String),
    CollectStale {
        blf_ttl: Duration,
        mwi_ttl: Duration,
        stuck_timeout: Duration,
        reply: oneshot::Sender<Vec<StaleSubscription>>,
    },
}

struct DialogContext {
    record: SubscriptionRecord,
    queue: VecDeque<SipEvent>,
    handle: Option<DialogHandle>,
    /// Set on recovery: the watcher is owed a full-state NOTIFY at its next
    /// refresh, since this instance never sent it anything.
    needs_full_state_notify: bool,
}

/// Cheap clonable side of a worker, held by the dispatcher.
pub struct WorkerHandle {
    pub index: usize,
    pub stats: Arc<WorkerStats>,
    events_tx: mpsc::Sender<SipEvent>,
    control_tx: mpsc::UnboundedSender<WorkerCommand>,
    queue_capacity: usize,
}

impl WorkerHandle {
    pub fn try_enqueue(&self, event: SipEvent) -> Result<(), mpsc::error::TrySendError<SipEvent>> {
        let result = self.events_tx.try_send(event);
        if result.is_ok() {
            self.stats.events_received.fetch_add(1, Ordering::Relaxed);
            let depth = self.queue_capacity - self.events_tx.capacity();
            self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
        }
        result
    }

    pub fn send_command(&self, command: WorkerCommand) -> bool {
        self.control_tx.send(command).is_ok()
    }
}

/// The owned side; consumed by `run` when the dispatcher starts.
pub struct DialogWorker {
    index: usize,
    services: Arc<Services>,
    stats: Arc<WorkerStats>,
    dialogs: HashMap<String, DialogContext>,
    blf: BlfProcessor,
    mwi: MwiProcessor,
    events_rx: mpsc::Receiver<SipEvent>,
    control_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    shutdown: watch::Receiver<bool>,
    pass_count: u64,
}

impl DialogWorker {
    pub fn new(
        index: usize,
        services: Arc<Services>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, WorkerHandle) {
        let queue_capacity = services
            .config
            .dispatcher
            .max_incoming_queue_per_worker
            .max(1);
        let (events_tx, events_rx) = mpsc::channel(queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WorkerStats::default());

        let worker = Self {
            index,
            services,
            stats: Arc::clone(&stats),
            dialogs: HashMap::new(),
            blf: BlfProcessor::new(),
            mwi: MwiProcessor::new(),
            events_rx,
            control_rx,
            shutdown,
            pass_count: 0,
        };
        let handle = WorkerHandle {
            index,
            stats,
            events_tx,
            control_tx,
            queue_capacity,
        };
        (worker, handle)
    }

    /// Installs a record recovered from the document store. Called before
    /// the worker task starts, so the map is still directly accessible.
    ///
    /// The persisted snapshot may lag the last NOTIFY actually sent, so the
    /// version counter advances by one; the resumed stream stays strictly
    /// above anything the watcher has already seen. No SIP handle exists
    /// until the watcher refreshes.
    pub fn load_recovered_subscription(&mut self, mut record: SubscriptionRecord) {
        record.notify_version = record.notify_version.wrapping_add(1);
        record.last_activity = Instant::now();

        if record.kind == SubscriptionType::Blf
            && record.lifecycle == Lifecycle::Active
            && !record.blf_monitored_uri.is_empty()
        {
            self.services
                .index
                .add(&record.blf_monitored_uri, &record.dialog_id, &record.tenant_id);
        }

        self.services.registry.register(SubscriptionInfo {
            dialog_id: record.dialog_id.clone(),
            tenant_id: record.tenant_id.clone(),
            kind: record.kind,
            lifecycle: record.lifecycle,
            last_activity: SystemTime::now(),
            worker_index: self.index,
        });

        debug!(
            worker = self.index,
            dialog_id = %record.dialog_id,
            kind = record.kind.as_str(),
            "recovered subscription loaded"
        );

        self.dialogs.insert(
            record.dialog_id.clone(),
            DialogContext {
                record,
                queue: VecDeque::new(),
                handle: None,
                needs_full_state_notify: true,
            },
        );
        self.stats
            .dialogs_active
            .store(self.dialogs.len() as u64, Ordering::Relaxed);
    }

    pub async fn run(mut self) {
        debug!(worker = self.index, "dialog worker started");
        let mut batch: VecDeque<SipEvent> = VecDeque::new();
        let mut terminates: Vec<String> = Vec::new();

        loop {
            // Wait for the first piece of work, a command, stop, or the tick.
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {}
                command = self.control_rx.recv() => {
                    if let Some(command) = command {
                        self.stage_command(command, &mut terminates);
                    }
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        batch.push_back(event);
                    }
                }
                _ = sleep(IDLE_TICK) => {}
            }

            // Drain the rest without blocking so producers are freed fast.
            while let Ok(command) = self.control_rx.try_recv() {
                self.stage_command(command, &mut terminates);
            }
            while let Ok(event) = self.events_rx.try_recv() {
                batch.push_back(event);
            }
            self.stats.queue_depth.store(0, Ordering::Relaxed);

            for dialog_id in terminates.drain(..) {
                self.force_terminate_dialog(&dialog_id).await;
            }

            self.distribute(&mut batch).await;
            self.process_dialog_queues().await;

            self.pass_count += 1;
            if self.pass_count % CLEANUP_INTERVAL == 0 {
                self.cleanup_terminated();
            }

            if *self.shutdown.borrow() && self.events_rx.is_empty() {
                // In-flight events finish before the shard goes down.
                while self.dialogs.values().any(|c| !c.queue.is_empty()) {
                    self.process_dialog_queues().await;
                }
                break;
            }
        }

        for (dialog_id, ctx) in &self.dialogs {
            if ctx.record.kind == SubscriptionType::Blf {
                self.services.index.remove_dialog(dialog_id);
            }
        }
        debug!(
            worker = self.index,
            dialogs = self.dialogs.len(),
            "dialog worker stopped"
        );
    }

    fn stage_command(&mut self, command: WorkerCommand, terminates: &mut Vec<String>) {
        match command {
            WorkerCommand::ForceTerminate(dialog_id) => terminates.push(dialog_id),
            WorkerCommand::CollectStale {
                blf_ttl,
                mwi_ttl,
                stuck_timeout,
                reply,
            } => {
                let _ = reply.send(self.collect_stale(blf_ttl, mwi_ttl, stuck_timeout));
            }
        }
    }

    fn collect_stale(
        &self,
        blf_ttl: Duration,
        mwi_ttl: Duration,
        stuck_timeout: Duration,
    ) -> Vec<StaleSubscription> {
        let mut stale = Vec::new();
        for (dialog_id, ctx) in &self.dialogs {
            let record = &ctx.record;
            if record.lifecycle == Lifecycle::Terminated {
                continue;
            }
            let ttl = if record.kind == SubscriptionType::Blf {
                blf_ttl
            } else {
                mwi_ttl
            };
            let is_stuck = record.is_stuck(stuck_timeout);
            let is_stale = record.last_activity.elapsed() > ttl || record.is_expired();
            if is_stale || is_stuck {
                stale.push(StaleSubscription {
                    dialog_id: dialog_id.clone(),
                    tenant_id: record.tenant_id.clone(),
                    kind: record.kind,
                    lifecycle: record.lifecycle,
                    is_stuck,
                });
            }
        }
        stale
    }

    /// Reaper/admin path: tear a dialog down regardless of queued work.
    async fn force_terminate_dialog(&mut self, dialog_id: &str) {
        let Some(ctx) = self.dialogs.get_mut(dialog_id) else {
            return;
        };
        let reached_active = matches!(
            ctx.record.lifecycle,
            Lifecycle::Active | Lifecycle::Terminating
        );
        let send_terminal = reached_active && ctx.handle.is_some();
        let version = send_terminal.then(|| ctx.record.next_notify_version());

        ctx.record.lifecycle = Lifecycle::Terminated;
        ctx.queue.clear();
        let handle = ctx.handle.take();
        let record = ctx.record.clone();

        self.services.index.remove_dialog(dialog_id);
        self.services.registry.unregister(dialog_id);

        if let Some(version) = version {
            let payload = terminal_notify_payload(&record, version);
            if let Some(payload) = payload {
                self.services
                    .sip
                    .send_notify(&record, handle.as_ref(), payload)
                    .await;
            }
        }

        self.services.store.queue_delete(dialog_id);
        self.stats.dialogs_reaped.fetch_add(1, Ordering::Relaxed);
        info!(worker = self.index, dialog_id, "dialog force-terminated");
    }

    /// Sorts a drained batch into per-dialog FIFO queues, admitting new
    /// subscriptions on the way.
    async fn distribute(&mut self, batch: &mut VecDeque<SipEvent>) {
        while let Some(event) = batch.pop_front() {
            if !self.dialogs.contains_key(&event.dialog_id) {
                if event.source == SipEventSource::PresenceFeed {
                    // The watcher is gone; nothing to notify.
                    self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if !self.admit_new_subscription(&event).await {
                    self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            let ctx = self
                .dialogs
                .get_mut(&event.dialog_id)
                .expect("dialog admitted above");
            if ctx.handle.is_none() {
                if let Some(handle) = &event.handle {
                    ctx.handle = Some(handle.clone());
                }
            }
            ctx.queue.push_back(event);
        }
    }

    /// Admission control for a dialog this worker has never seen.
    async fn admit_new_subscription(&mut self, event: &SipEvent) -> bool {
        let config = &self.services.config.dispatcher;
        let is_incoming_subscribe = event.category == SipEventCategory::Subscribe
            && event.direction == SipDirection::Incoming;

        if self.services.registry.count_by_tenant(&event.tenant_id)
            >= config.max_subscriptions_per_tenant
        {
            warn!(
                worker = self.index,
                tenant = %event.tenant_id,
                dialog_id = %event.dialog_id,
                "tenant subscription quota exceeded"
            );
            if is_incoming_subscribe {
                self.services
                    .sip
                    .respond_to_subscribe(event, 403, "Forbidden", None)
                    .await;
            }
            return false;
        }

        if self.dialogs.len() >= config.max_dialogs_per_worker {
            warn!(worker = self.index, "worker dialog capacity exceeded");
            if is_incoming_subscribe {
                self.services
                    .sip
                    .respond_to_subscribe(event, 503, "Service Unavailable", None)
                    .await;
            }
            return false;
        }

        if event.sub_type == SubscriptionType::Unknown {
            debug!(
                worker = self.index,
                dialog_id = %event.dialog_id,
                event_header = %event.event_header,
                "unsupported event package"
            );
            if is_incoming_subscribe {
                self.services
                    .sip
                    .respond_to_subscribe(event, 489, "Bad Event", None)
                    .await;
            }
            return false;
        }

        let mut record = SubscriptionRecord::new(
            event.dialog_id.clone(),
            event.tenant_id.clone(),
            event.sub_type,
        );
        if let Some(expires) = event.expires.filter(|e| *e > 0) {
            record.expires_at =
                Some(SystemTime::now() + Duration::from_secs(u64::from(expires)));
        }
        record.cseq = event.cseq;
        record.from_uri = event.from_uri.clone();
        record.from_tag = event.from_tag.clone();
        record.to_uri = event.to_uri.clone();
        record.to_tag = event.to_tag.clone();
        record.call_id = event.call_id.clone();
        record.contact_uri = event.contact_uri.clone();
        match event.sub_type {
            SubscriptionType::Blf => record.blf_monitored_uri = event.to_uri.clone(),
            SubscriptionType::Mwi => record.mwi_account_uri = event.to_uri.clone(),
            SubscriptionType::Unknown => {}
        }

        self.services.registry.register(SubscriptionInfo {
            dialog_id: event.dialog_id.clone(),
            tenant_id: event.tenant_id.clone(),
            kind: event.sub_type,
            lifecycle: Lifecycle::Pending,
            last_activity: SystemTime::now(),
            worker_index: self.index,
        });

        // A crash right after admission must still leave a resumable trace.
        if let Err(e) = self.services.store.save_immediately(&record).await {
            warn!(dialog_id = %record.dialog_id, error = %e, "create persist failed");
        }

        self.dialogs.insert(
            event.dialog_id.clone(),
            DialogContext {
                record,
                queue: VecDeque::new(),
                handle: event.handle.clone(),
                needs_full_state_notify: false,
            },
        );
        self.stats
            .dialogs_active
            .store(self.dialogs.len() as u64, Ordering::Relaxed);
        true
    }

    /// One round over all dialogs, at most one event each.
    async fn process_dialog_queues(&mut self) {
        let ready: Vec<String> = self
            .dialogs
            .iter()
            .filter(|(_, ctx)| !ctx.queue.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for dialog_id in ready {
            if let Some(ctx) = self.dialogs.get_mut(&dialog_id) {
                if let Some(event) = ctx.queue.pop_front() {
                    self.process_event(&dialog_id, event).await;
                }
            }
        }
    }

    async fn process_event(&mut self, dialog_id: &str, mut event: SipEvent) {
        let Some(mut ctx) = self.dialogs.remove(dialog_id) else {
            return;
        };

        event.dequeued_at = Some(Instant::now());
        ctx.record.is_processing = true;
        ctx.record.processing_started_at = Some(Instant::now());
        ctx.record.touch();
        ctx.record.events_processed += 1;
        let pre_lifecycle = ctx.record.lifecycle;

        let slow = Arc::clone(&self.services.slow);
        let timer = slow.timer(event.category.as_str(), dialog_id);

        if event.source == SipEventSource::PresenceFeed {
            self.handle_presence_trigger(&mut ctx, &event).await;
            self.stats.presence_triggers.fetch_add(1, Ordering::Relaxed);
        } else if event.category == SipEventCategory::Notify
            && event.direction == SipDirection::Outgoing
            && event.status > 0
        {
            self.handle_notify_response(&mut ctx, &event).await;
        } else {
            if ctx.record.kind == SubscriptionType::Unknown
                && event.sub_type != SubscriptionType::Unknown
            {
                ctx.record.kind = event.sub_type;
            }
            let outcome = match ctx.record.kind {
                SubscriptionType::Blf => self.blf.process(&event, &mut ctx.record),
                SubscriptionType::Mwi => self.mwi.process(&event, &mut ctx.record),
                SubscriptionType::Unknown => Err(sub_core::Error::InvalidArgument),
            };
            if let Err(e) = outcome {
                debug!(
                    worker = self.index,
                    dialog_id,
                    category = event.category.as_str(),
                    error = %e,
                    "processor rejected event"
                );
            }
        }

        self.apply_lifecycle_transitions(&mut ctx, &event, pre_lifecycle)
            .await;

        if event.category == SipEventCategory::Subscribe {
            if let Some(expires) = event.expires.filter(|e| *e > 0) {
                ctx.record.expires_at =
                    Some(SystemTime::now() + Duration::from_secs(u64::from(expires)));
            }
        }

        ctx.record.is_processing = false;
        ctx.record.processing_started_at = None;

        let elapsed = timer.finish();
        if elapsed >= self.services.slow.warn_threshold() {
            self.stats.slow_events.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);

        self.dialogs.insert(dialog_id.to_owned(), ctx);
    }

    /// Lifecycle bookkeeping after the processor has run.
    async fn apply_lifecycle_transitions(
        &mut self,
        ctx: &mut DialogContext,
        event: &SipEvent,
        pre_lifecycle: Lifecycle,
    ) {
        let record = &mut ctx.record;
        let is_incoming_subscribe = event.category == SipEventCategory::Subscribe
            && event.direction == SipDirection::Incoming;

        if event.subscription_state == "terminated" || event.expires == Some(0) {
            if record.lifecycle != Lifecycle::Terminated {
                self.services.index.remove_dialog(&record.dialog_id);
            }
            record.lifecycle = Lifecycle::Terminated;

            if is_incoming_subscribe && event.expires == Some(0) {
                self.services
                    .sip
                    .respond_to_subscribe(event, 200, "OK", Some(0))
                    .await;
                let version = record.next_notify_version();
                if let Some(payload) = terminal_notify_payload(record, version) {
                    let record_snapshot = record.clone();
                    self.services
                        .sip
                        .send_notify(&record_snapshot, ctx.handle.as_ref(), payload)
                        .await;
                }
            }

            let record = &mut ctx.record;
            record.dirty = false;
            if let Err(e) = self.services.store.save_immediately(record).await {
                warn!(dialog_id = %record.dialog_id, error = %e, "terminate persist failed");
            }
            self.services.store.queue_delete(&record.dialog_id);
            ctx.handle = None;
            return;
        }

        if pre_lifecycle == Lifecycle::Pending && record.lifecycle == Lifecycle::Active {
            if record.kind == SubscriptionType::Blf && !record.blf_monitored_uri.is_empty() {
                self.services.index.add(
                    &record.blf_monitored_uri,
                    &record.dialog_id,
                    &record.tenant_id,
                );
            }
            self.services.registry.register(SubscriptionInfo {
                dialog_id: record.dialog_id.clone(),
                tenant_id: record.tenant_id.clone(),
                kind: record.kind,
                lifecycle: Lifecycle::Active,
                last_activity: SystemTime::now(),
                worker_index: self.index,
            });

            if is_incoming_subscribe {
                self.services
                    .sip
                    .respond_to_subscribe(event, 200, "OK", event.expires)
                    .await;
                self.send_initial_notify(ctx).await;
            }

            let record = &mut ctx.record;
            record.dirty = false;
            if let Err(e) = self.services.store.save_immediately(record).await {
                warn!(dialog_id = %record.dialog_id, error = %e, "activate persist failed");
            }
            return;
        }

        if record.lifecycle == Lifecycle::Active && is_incoming_subscribe {
            // Refresh: ack and let the batched sync pick the record up.
            self.services
                .sip
                .respond_to_subscribe(event, 200, "OK", event.expires)
                .await;
            if ctx.needs_full_state_notify {
                // Recovery NOTIFY: this refresh is the first live dialog
                // since failover, catch the watcher up.
                self.send_full_state_notify(ctx).await;
                ctx.needs_full_state_notify = false;
            }
            let record = &mut ctx.record;
            record.dirty = false;
            self.services.store.queue_upsert(record);
            return;
        }

        if record.dirty {
            record.dirty = false;
            self.services.store.queue_upsert(record);
        }
    }

    /// RFC 3265-style initial full-state NOTIFY right after activation.
    async fn send_initial_notify(&self, ctx: &mut DialogContext) {
        let record = &mut ctx.record;
        let version = record.next_notify_version();
        let payload = match record.kind {
            SubscriptionType::Blf => {
                let body = blf::build_empty_dialog_info(version, &record.blf_monitored_uri);
                record.blf_last_notify_body = body.clone();
                NotifyPayload {
                    event_package: "dialog".to_owned(),
                    content_type: blf::DIALOG_INFO_CONTENT_TYPE.to_owned(),
                    body,
                    subscription_state: "active".to_owned(),
                    cseq: record.next_notify_cseq(),
                }
            }
            SubscriptionType::Mwi => {
                let body = mwi::build_message_summary_body(record);
                record.mwi_last_notify_body = body.clone();
                NotifyPayload {
                    event_package: "message-summary".to_owned(),
                    content_type: mwi::MESSAGE_SUMMARY_CONTENT_TYPE.to_owned(),
                    body,
                    subscription_state: "active".to_owned(),
                    cseq: record.next_notify_cseq(),
                }
            }
            SubscriptionType::Unknown => return,
        };

        let record_snapshot = ctx.record.clone();
        self.services
            .sip
            .send_notify(&record_snapshot, ctx.handle.as_ref(), payload)
            .await;
    }

    /// Full-state NOTIFY rebuilt from the record's persisted state, with a
    /// fresh version number. The stored body embeds the pre-failover
    /// version, so it is only a template; the state fields are what count.
    async fn send_full_state_notify(&self, ctx: &mut DialogContext) {
        let record = &mut ctx.record;
        let version = record.next_notify_version();
        let payload = match record.kind {
            SubscriptionType::Blf => {
                let body = if record.blf_last_state.is_empty() {
                    blf::build_empty_dialog_info(version, &record.blf_monitored_uri)
                } else {
                    blf::build_dialog_info_xml(
                        version,
                        &record.blf_monitored_uri,
                        &record.blf_presence_call_id,
                        &record.blf_last_state,
                        &record.blf_last_direction,
                        "",
                        "",
                    )
                };
                record.blf_last_notify_body = body.clone();
                NotifyPayload {
                    event_package: "dialog".to_owned(),
                    content_type: blf::DIALOG_INFO_CONTENT_TYPE.to_owned(),
                    body,
                    subscription_state: "active".to_owned(),
                    cseq: record.next_notify_cseq(),
                }
            }
            SubscriptionType::Mwi => {
                let body = mwi::build_message_summary_body(record);
                record.mwi_last_notify_body = body.clone();
                NotifyPayload {
                    event_package: "message-summary".to_owned(),
                    content_type: mwi::MESSAGE_SUMMARY_CONTENT_TYPE.to_owned(),
                    body,
                    subscription_state: "active".to_owned(),
                    cseq: record.next_notify_cseq(),
                }
            }
            SubscriptionType::Unknown => return,
        };

        info!(
            worker = self.index,
            dialog_id = %ctx.record.dialog_id,
            "sending recovery full-state NOTIFY"
        );
        let record_snapshot = ctx.record.clone();
        self.services
            .sip
            .send_notify(&record_snapshot, ctx.handle.as_ref(), payload)
            .await;
    }

    /// BLF trigger from the presence feed: rebuild the body with the
    /// record's own version counter and send.
    async fn handle_presence_trigger(&mut self, ctx: &mut DialogContext, event: &SipEvent) {
        let Some(action) = self.blf.process_presence_trigger(event, &mut ctx.record) else {
            return;
        };

        let record = &mut ctx.record;
        record.blf_last_notify_body = action.body.clone();
        record.next_notify_version();
        record.dirty = true;

        info!(
            worker = self.index,
            dialog_id = %record.dialog_id,
            state = %event.presence_state,
            call = %event.presence_call_id,
            "sending BLF NOTIFY"
        );

        let payload = NotifyPayload {
            event_package: "dialog".to_owned(),
            content_type: action.content_type,
            body: action.body,
            subscription_state: action.subscription_state,
            cseq: record.next_notify_cseq(),
        };
        let record_snapshot = ctx.record.clone();
        self.services
            .sip
            .send_notify(&record_snapshot, ctx.handle.as_ref(), payload)
            .await;
    }

    /// Response to one of our NOTIFYs. 2xx is fine; 481/408/489 and any
    /// other final error mean the dialog is gone at the peer.
    async fn handle_notify_response(&mut self, ctx: &mut DialogContext, event: &SipEvent) {
        if (200..300).contains(&event.status) {
            return;
        }
        if event.status < 400 {
            return;
        }

        warn!(
            worker = self.index,
            dialog_id = %event.dialog_id,
            status = event.status,
            "NOTIFY rejected, terminating subscription"
        );
        self.stats.notify_errors.fetch_add(1, Ordering::Relaxed);

        self.services.index.remove_dialog(&event.dialog_id);
        ctx.record.lifecycle = Lifecycle::Terminated;
        ctx.record.dirty = false;
        ctx.handle = None;

        if let Err(e) = self.services.store.save_immediately(&ctx.record).await {
            warn!(dialog_id = %ctx.record.dialog_id, error = %e, "terminate persist failed");
        }
        self.services.store.queue_delete(&ctx.record.dialog_id);
    }

    /// Drops contexts whose record is terminated (or expired) once their
    /// queues have drained.
    fn cleanup_terminated(&mut self) {
        let doomed: Vec<String> = self
            .dialogs
            .iter()
            .filter(|(_, ctx)| {
                ctx.queue.is_empty()
                    && (ctx.record.lifecycle == Lifecycle::Terminated || ctx.record.is_expired())
            })
            .map(|(id, _)| id.clone())
            .collect();

        if doomed.is_empty() {
            return;
        }
        for dialog_id in &doomed {
            self.services.index.remove_dialog(dialog_id);
            self.services.registry.unregister(dialog_id);
            self.dialogs.remove(dialog_id);
        }
        self.stats
            .dialogs_active
            .store(self.dialogs.len() as u64, Ordering::Relaxed);
        debug!(worker = self.index, cleaned = doomed.len(), "dialog contexts cleaned");
    }
}

/// Body and headers for a terminal NOTIFY; `None` when the package never
/// resolved, since there is no meaningful body to send.
fn terminal_notify_payload(record: &SubscriptionRecord, version: u32) -> Option<NotifyPayload> {
    match record.kind {
        SubscriptionType::Blf => Some(NotifyPayload {
            event_package: "dialog".to_owned(),
            content_type: blf::DIALOG_INFO_CONTENT_TYPE.to_owned(),
            body: blf::build_empty_dialog_info(version, &record.blf_monitored_uri),
            subscription_state: "terminated".to_owned(),
            cseq: record.notify_cseq + 1,
        }),
        SubscriptionType::Mwi => Some(NotifyPayload {
            event_package: "message-summary".to_owned(),
            content_type: mwi::MESSAGE_SUMMARY_CONTENT_TYPE.to_owned(),
            body: mwi::build_terminal_body(),
            subscription_state: "terminated".to_owned(),
            cseq: record.notify_cseq + 1,
        }),
        SubscriptionType::Unknown => None,
    }
}
