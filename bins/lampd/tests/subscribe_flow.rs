//! End-to-end scenarios through a real dispatcher: worker pool, recording
//! SIP stack, in-memory document backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lampd::config::DaemonConfig;
use lampd::dispatcher::DialogDispatcher;
use lampd::reaper::StaleSubscriptionReaper;
use lampd::router::PresenceEventRouter;
use lampd::services::Services;
use presence_feed::{CallState, CallStateEvent};
use sub_core::{
    Lifecycle, RecordingSipStack, SipDirection, SipEvent, SipEventCategory, SipEventSource,
    SubscriptionRecord, SubscriptionType,
};
use sub_store::{DocumentBackend, MemoryBackend, StoreConfig, SubscriptionStore};
use tokio::time::sleep;

struct Harness {
    services: Arc<Services>,
    dispatcher: Arc<DialogDispatcher>,
    stack: Arc<RecordingSipStack>,
    store: Arc<SubscriptionStore>,
}

async fn harness(config: DaemonConfig) -> Harness {
    harness_with_backend(config, Arc::new(MemoryBackend::new())).await
}

async fn harness_with_backend(config: DaemonConfig, backend: Arc<MemoryBackend>) -> Harness {
    let backend: Arc<dyn DocumentBackend> = backend;
    let store = Arc::new(SubscriptionStore::new(
        StoreConfig {
            enabled: true,
            service_id: "test-proc".into(),
            sync_interval: Duration::from_millis(50),
            batch_size: 100,
        },
        backend,
    ));
    store.start().await.unwrap();

    let stack = Arc::new(RecordingSipStack::new());
    let sip: Arc<dyn sub_core::SipStack> = stack.clone();
    let services = Services::new(Arc::new(config), Arc::clone(&store), sip);
    let dispatcher = Arc::new(DialogDispatcher::new(Arc::clone(&services)));

    Harness {
        services,
        dispatcher,
        stack,
        store,
    }
}

fn small_config(workers: usize) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.dispatcher.num_workers = workers;
    config
}

fn subscribe_event(dialog_id: &str, tenant: &str, to_uri: &str, expires: u32) -> SipEvent {
    let mut ev = SipEvent::new(
        SipEventCategory::Subscribe,
        SipDirection::Incoming,
        SipEventSource::SipStack,
    );
    ev.dialog_id = dialog_id.to_owned();
    ev.tenant_id = tenant.to_owned();
    ev.call_id = dialog_id.to_owned();
    ev.from_uri = format!("sip:watcher@{}", tenant);
    ev.from_tag = "ft1".into();
    ev.to_uri = to_uri.to_owned();
    ev.event_header = "dialog".into();
    ev.sub_type = SubscriptionType::Blf;
    ev.expires = Some(expires);
    ev.cseq = 1;
    ev
}

fn trigger_event(dialog_id: &str, call_id: &str, callee: &str, state: &str) -> SipEvent {
    SipEvent::presence_trigger(
        dialog_id.to_owned(),
        "t.com".to_owned(),
        call_id,
        "sip:100@t.com",
        callee,
        state,
        "inbound",
        String::new(),
    )
}

async fn settle() {
    sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn subscribe_activate_refresh_terminate() {
    let h = harness(small_config(2)).await;
    h.dispatcher.start().unwrap();

    // SUBSCRIBE with expires=300 creates and activates the watcher.
    h.dispatcher
        .dispatch(subscribe_event("dlg-1", "t.com", "sip:200@t.com", 300))
        .unwrap();
    settle().await;

    let responses = h.stack.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 200);
    assert_eq!(responses[0].expires, Some(300));

    let notifies = h.stack.notifies_for("dlg-1");
    assert_eq!(notifies.len(), 1);
    assert!(notifies[0].payload.body.contains("version=\"0\""));
    assert!(!notifies[0].payload.body.contains("<dialog "));
    assert_eq!(notifies[0].payload.subscription_state, "active");

    // A confirmed call on the monitored URI produces NOTIFY version 1.
    h.dispatcher
        .dispatch(trigger_event("dlg-1", "C1", "sip:200@t.com", "confirmed"))
        .unwrap();
    settle().await;

    let notifies = h.stack.notifies_for("dlg-1");
    assert_eq!(notifies.len(), 2);
    assert!(notifies[1].payload.body.contains("version=\"1\""));
    assert!(notifies[1].payload.body.contains("<state>confirmed</state>"));

    // The identical transition is suppressed.
    h.dispatcher
        .dispatch(trigger_event("dlg-1", "C1", "sip:200@t.com", "confirmed"))
        .unwrap();
    settle().await;
    assert_eq!(h.stack.notifies_for("dlg-1").len(), 2);

    // Unsubscribe: 200 OK plus a terminal NOTIFY with version 2.
    h.dispatcher
        .dispatch(subscribe_event("dlg-1", "t.com", "sip:200@t.com", 0))
        .unwrap();
    settle().await;

    let responses = h.stack.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].status, 200);

    let notifies = h.stack.notifies_for("dlg-1");
    assert_eq!(notifies.len(), 3);
    assert!(notifies[2].payload.body.contains("version=\"2\""));
    assert_eq!(notifies[2].payload.subscription_state, "terminated");

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn notify_versions_strictly_increase() {
    let h = harness(small_config(1)).await;
    h.dispatcher.start().unwrap();

    h.dispatcher
        .dispatch(subscribe_event("dlg-v", "t.com", "sip:200@t.com", 600))
        .unwrap();
    for (i, state) in ["trying", "early", "confirmed", "terminated", "trying"]
        .iter()
        .enumerate()
    {
        h.dispatcher
            .dispatch(trigger_event("dlg-v", &format!("C{}", i), "sip:200@t.com", state))
            .unwrap();
    }
    settle().await;

    let notifies = h.stack.notifies_for("dlg-v");
    assert_eq!(notifies.len(), 6);
    for (version, notify) in notifies.iter().enumerate() {
        assert!(
            notify
                .payload
                .body
                .contains(&format!("version=\"{}\"", version)),
            "notify {} carried the wrong version: {}",
            version,
            notify.payload.body
        );
    }

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn tenant_quota_rejects_with_403() {
    let mut config = small_config(1);
    config.dispatcher.max_subscriptions_per_tenant = 2;
    let h = harness(config).await;
    h.dispatcher.start().unwrap();

    for i in 1..=3 {
        h.dispatcher
            .dispatch(subscribe_event(
                &format!("quota-{}", i),
                "tenant-q",
                "sip:200@t.com",
                300,
            ))
            .unwrap();
    }
    settle().await;

    let responses = h.stack.responses();
    assert_eq!(responses.len(), 3);
    let ok = responses.iter().filter(|r| r.status == 200).count();
    let forbidden: Vec<_> = responses.iter().filter(|r| r.status == 403).collect();
    assert_eq!(ok, 2);
    assert_eq!(forbidden.len(), 1);
    assert_eq!(forbidden[0].dialog_id, "quota-3");

    assert_eq!(h.services.registry.count_by_tenant("tenant-q"), 2);
    assert!(h.services.registry.lookup("quota-3").is_none());

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn unsupported_event_package_rejects_with_489() {
    let h = harness(small_config(1)).await;
    h.dispatcher.start().unwrap();

    let mut ev = subscribe_event("dlg-bad", "t.com", "sip:200@t.com", 300);
    ev.event_header = "presence".into();
    ev.sub_type = SubscriptionType::from_event_package("presence");
    h.dispatcher.dispatch(ev).unwrap();
    settle().await;

    let responses = h.stack.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 489);
    assert!(h.services.registry.lookup("dlg-bad").is_none());

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn presence_router_targets_only_matching_watchers() {
    let h = harness(small_config(2)).await;
    h.dispatcher.start().unwrap();

    h.dispatcher
        .dispatch(subscribe_event("watch-200", "t.com", "sip:200@t.com", 600))
        .unwrap();
    h.dispatcher
        .dispatch(subscribe_event("watch-300", "t.com", "sip:300@t.com", 600))
        .unwrap();
    settle().await;
    h.stack.clear();

    let router = PresenceEventRouter::new(
        1000,
        Arc::clone(&h.dispatcher),
        Arc::clone(&h.services.index),
    );

    let mut call = CallStateEvent::new();
    call.presence_call_id = "C42".into();
    call.caller_uri = "sip:100@t.com".into();
    call.callee_uri = "sip:200@t.com".into();
    call.state = CallState::Confirmed;
    call.direction = "inbound".into();
    call.tenant_id = "t.com".into();
    call.revalidate();
    assert!(call.is_valid);

    router.ingress().deliver(call);
    settle().await;

    assert_eq!(h.stack.notifies_for("watch-200").len(), 1);
    assert!(h.stack.notifies_for("watch-300").is_empty());
    assert_eq!(
        router
            .stats()
            .notifications_generated
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    router.stop().await;
    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn recovery_resumes_with_increasing_versions() {
    let backend = Arc::new(MemoryBackend::new());

    // First instance persists an active BLF subscription.
    {
        let h = harness_with_backend(small_config(2), Arc::clone(&backend)).await;
        let mut record = SubscriptionRecord::new(
            "recover-1".into(),
            "t.com".into(),
            SubscriptionType::Blf,
        );
        record.lifecycle = Lifecycle::Active;
        record.notify_version = 7;
        record.blf_monitored_uri = "sip:200@t.com".into();
        record.blf_last_state = "confirmed".into();
        record.blf_last_notify_body = "<dialog-info version=\"6\"/>".into();
        record.from_uri = "sip:watcher@t.com".into();
        record.from_tag = "ft".into();
        record.to_tag = "tt".into();
        record.call_id = "recover-1".into();
        h.store.save_immediately(&record).await.unwrap();
        h.store.stop().await;
    }

    // Peer instance loads it before starting its dispatcher.
    let h = harness_with_backend(small_config(2), backend).await;
    let recovered = h.store.load_active_subscriptions().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].needs_full_state_notify);
    assert_eq!(recovered[0].record.notify_version, 7);

    let worker_index = h.dispatcher.worker_index_for("recover-1");
    for stored in recovered {
        h.dispatcher.load_recovered_subscription(stored.record).unwrap();
    }

    let info = h.services.registry.lookup("recover-1").unwrap();
    assert_eq!(info.lifecycle, Lifecycle::Active);
    assert_eq!(info.worker_index, worker_index);

    let watchers = h.services.index.lookup("sip:200@t.com");
    assert_eq!(watchers.len(), 1);
    assert_eq!(watchers[0].dialog_id, "recover-1");

    h.dispatcher.start().unwrap();

    // A state change on the resumed subscription emits version 8: strictly
    // above anything the first instance could have sent.
    h.dispatcher
        .dispatch(trigger_event("recover-1", "C9", "sip:200@t.com", "early"))
        .unwrap();
    settle().await;

    let notifies = h.stack.notifies_for("recover-1");
    assert_eq!(notifies.len(), 1);
    assert!(notifies[0].payload.body.contains("version=\"8\""));
    assert!(!notifies[0].had_handle);

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn recovered_subscription_refresh_gets_full_state_notify() {
    let backend = Arc::new(MemoryBackend::new());
    {
        let h = harness_with_backend(small_config(1), Arc::clone(&backend)).await;
        let mut record = SubscriptionRecord::new(
            "refresh-1".into(),
            "t.com".into(),
            SubscriptionType::Blf,
        );
        record.lifecycle = Lifecycle::Active;
        record.notify_version = 3;
        record.blf_monitored_uri = "sip:201@t.com".into();
        record.blf_last_state = "confirmed".into();
        record.blf_presence_call_id = "C1".into();
        h.store.save_immediately(&record).await.unwrap();
        h.store.stop().await;
    }

    let h = harness_with_backend(small_config(1), backend).await;
    for stored in h.store.load_active_subscriptions().await.unwrap() {
        h.dispatcher.load_recovered_subscription(stored.record).unwrap();
    }
    h.dispatcher.start().unwrap();

    // The watcher's refresh re-establishes the dialog; the peer owes it the
    // last known state under a fresh version.
    h.dispatcher
        .dispatch(subscribe_event("refresh-1", "t.com", "sip:201@t.com", 300))
        .unwrap();
    settle().await;

    let responses = h.stack.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 200);

    let notifies = h.stack.notifies_for("refresh-1");
    assert_eq!(notifies.len(), 1);
    assert!(notifies[0].payload.body.contains("version=\"4\""));
    assert!(notifies[0].payload.body.contains("<state>confirmed</state>"));
    assert_eq!(notifies[0].payload.subscription_state, "active");

    // The debt is paid once; a second refresh is just a 200.
    h.dispatcher
        .dispatch(subscribe_event("refresh-1", "t.com", "sip:201@t.com", 300))
        .unwrap();
    settle().await;
    assert_eq!(h.stack.notifies_for("refresh-1").len(), 1);
    assert_eq!(h.stack.responses().len(), 2);

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn reaper_terminates_stuck_subscriptions() {
    let mut config = small_config(1);
    config.reaper.scan_interval_secs = 1;
    config.reaper.stuck_processing_timeout_secs = 1;
    let config = Arc::new(config);

    let h = harness(small_config(1)).await;

    // A recovered record frozen mid-processing well past the timeout.
    let mut record = SubscriptionRecord::new(
        "stuck-1".into(),
        "t.com".into(),
        SubscriptionType::Blf,
    );
    record.lifecycle = Lifecycle::Active;
    record.blf_monitored_uri = "sip:200@t.com".into();
    record.is_processing = true;
    record.processing_started_at = Some(Instant::now() - Duration::from_secs(10));
    h.dispatcher.load_recovered_subscription(record).unwrap();
    h.dispatcher.start().unwrap();

    let reaper = StaleSubscriptionReaper::start(
        Arc::clone(&config),
        Arc::clone(&h.dispatcher),
        Arc::clone(&h.store),
    );

    sleep(Duration::from_millis(1800)).await;

    assert!(
        reaper
            .stats()
            .stuck_reaped
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
    assert!(h.services.registry.lookup("stuck-1").is_none());
    assert!(h.services.index.lookup("sip:200@t.com").is_empty());

    reaper.stop().await;
    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn dispatch_guards_reject_bad_input() {
    let h = harness(small_config(1)).await;

    // Not started yet.
    let ev = subscribe_event("dlg-x", "t.com", "sip:200@t.com", 300);
    assert_eq!(h.dispatcher.dispatch(ev), Err(sub_core::Error::ShuttingDown));

    h.dispatcher.start().unwrap();
    assert_eq!(h.dispatcher.start(), Err(sub_core::Error::AlreadyExists));

    let mut bad = subscribe_event("", "t.com", "sip:200@t.com", 300);
    bad.dialog_id = String::new();
    assert_eq!(
        h.dispatcher.dispatch(bad),
        Err(sub_core::Error::InvalidArgument)
    );

    h.dispatcher.stop().await;
    let ev = subscribe_event("dlg-y", "t.com", "sip:200@t.com", 300);
    assert_eq!(h.dispatcher.dispatch(ev), Err(sub_core::Error::ShuttingDown));

    h.store.stop().await;
}

#[tokio::test]
async fn presence_events_for_unknown_dialogs_are_dropped() {
    let h = harness(small_config(1)).await;
    h.dispatcher.start().unwrap();

    h.dispatcher
        .dispatch(trigger_event("ghost-1", "C1", "sip:200@t.com", "confirmed"))
        .unwrap();
    settle().await;

    assert!(h.stack.notifies().is_empty());
    let agg = h.dispatcher.aggregate_stats();
    assert_eq!(agg.events_dropped, 1);

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn mwi_subscription_full_cycle() {
    let h = harness(small_config(1)).await;
    h.dispatcher.start().unwrap();

    let mut ev = subscribe_event("mwi-1", "t.com", "sip:2000@t.com", 600);
    ev.event_header = "message-summary".into();
    ev.sub_type = SubscriptionType::Mwi;
    h.dispatcher.dispatch(ev).unwrap();
    settle().await;

    let notifies = h.stack.notifies_for("mwi-1");
    assert_eq!(notifies.len(), 1);
    assert_eq!(
        notifies[0].payload.content_type,
        "application/simple-message-summary"
    );
    assert!(notifies[0].payload.body.starts_with("Messages-Waiting: no"));

    // Unsubscribe gets the terminal lamp-off body.
    let mut bye = subscribe_event("mwi-1", "t.com", "sip:2000@t.com", 0);
    bye.event_header = "message-summary".into();
    bye.sub_type = SubscriptionType::Mwi;
    h.dispatcher.dispatch(bye).unwrap();
    settle().await;

    let notifies = h.stack.notifies_for("mwi-1");
    assert_eq!(notifies.len(), 2);
    assert_eq!(notifies[1].payload.subscription_state, "terminated");
    assert_eq!(notifies[1].payload.body, "Messages-Waiting: no\r\n");

    h.dispatcher.stop().await;
    h.store.stop().await;
}

#[tokio::test]
async fn notify_error_response_terminates_subscription() {
    let h = harness(small_config(1)).await;
    h.dispatcher.start().unwrap();

    h.dispatcher
        .dispatch(subscribe_event("err-1", "t.com", "sip:200@t.com", 600))
        .unwrap();
    settle().await;
    assert_eq!(h.services.index.lookup("sip:200@t.com").len(), 1);

    // The peer answered one of our NOTIFYs with 481.
    let mut response = SipEvent::new(
        SipEventCategory::Notify,
        SipDirection::Outgoing,
        SipEventSource::SipStack,
    );
    response.dialog_id = "err-1".into();
    response.tenant_id = "t.com".into();
    response.status = 481;
    response.phrase = "Call/Transaction Does Not Exist".into();
    h.dispatcher.dispatch(response).unwrap();
    settle().await;

    assert!(h.services.index.lookup("sip:200@t.com").is_empty());
    let agg = h.dispatcher.aggregate_stats();
    assert_eq!(agg.notify_errors, 1);

    h.dispatcher.stop().await;
    h.store.stop().await;
}
