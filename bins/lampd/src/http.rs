//! HTTP observability surface.
//!
//! Read-only JSON endpoints: `/health`, `/ready`, `/stats`,
//! `/stats/workers`, `/stats/presence`, `/subscriptions[?tenant=…]`, and
//! `/config` with secrets redacted. 200 when healthy/ready, 503 otherwise,
//! 404 for unknown paths, 500 when a handler fails.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use presence_feed::{FailoverManager, PresenceTcpClient};
use serde_json::json;
use sub_store::SubscriptionStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::dispatcher::DialogDispatcher;
use crate::reaper::StaleSubscriptionReaper;
use crate::router::PresenceEventRouter;
use crate::services::Services;

/// Everything the handlers read. All snapshots, no writes.
pub struct HttpDeps {
    pub config: Arc<DaemonConfig>,
    pub services: Arc<Services>,
    pub dispatcher: Arc<DialogDispatcher>,
    pub presence_client: Arc<PresenceTcpClient>,
    pub failover: Arc<FailoverManager>,
    pub router: Arc<PresenceEventRouter>,
    pub reaper: Arc<StaleSubscriptionReaper>,
    pub store: Arc<SubscriptionStore>,
    /// Flipped once start-up completes; `/ready` reports it.
    pub ready: Arc<AtomicBool>,
}

pub struct HttpServer {
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pub local_addr: SocketAddr,
}

impl HttpServer {
    pub fn start(deps: Arc<HttpDeps>) -> Result<Self> {
        let addr: SocketAddr = format!(
            "{}:{}",
            deps.config.http.bind_address, deps.config.http.port
        )
        .parse()
        .context("invalid http bind address")?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let make_svc = make_service_fn(move |_conn| {
            let deps = Arc::clone(&deps);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let deps = Arc::clone(&deps);
                    async move { Ok::<_, Infallible>(handle_request(req, deps)) }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .context("http bind failed")?
            .serve(make_svc);
        let local_addr = server.local_addr();
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

        let task = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!(error = %e, "http server error");
            }
        });
        info!(address = %local_addr, "http readout listening");

        Ok(Self {
            shutdown_tx,
            task: parking_lot::Mutex::new(Some(task)),
            local_addr,
        })
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("http readout stopped");
        }
    }
}

fn handle_request(req: Request<Body>, deps: Arc<HttpDeps>) -> Response<Body> {
    if req.method() != Method::GET {
        return plain_status(StatusCode::NOT_FOUND);
    }

    let path = req.uri().path().to_owned();
    let query = req.uri().query().map(str::to_owned);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        match path.as_str() {
            "/health" => handle_health(&deps),
            "/ready" => handle_ready(&deps),
            "/stats" => handle_stats(&deps),
            "/stats/workers" => handle_stats_workers(&deps),
            "/stats/presence" => handle_stats_presence(&deps),
            "/subscriptions" => handle_subscriptions(&deps, query.as_deref()),
            "/config" => handle_config(&deps),
            _ => plain_status(StatusCode::NOT_FOUND),
        }
    }));

    match result {
        Ok(response) => response,
        Err(_) => {
            error!(path = %path, "http handler panicked");
            plain_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn plain_status(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

fn handle_health(deps: &HttpDeps) -> Response<Body> {
    let presence_ok = deps.presence_client.is_connected();
    // Presence loss degrades the service but does not fail it; the SIP
    // side still answers SUBSCRIBEs.
    let healthy = true;

    let body = json!({
        "sip_bridge": true,
        "dispatcher": true,
        "persistence_enabled": deps.store.is_enabled(),
        "presence_feed": presence_ok,
        "presence_server": deps.presence_client.connected_server(),
        "presence_healthy_servers": deps.failover.healthy_count(),
        "healthy": healthy,
        "degraded": !presence_ok,
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, body)
}

fn handle_ready(deps: &HttpDeps) -> Response<Body> {
    let ready = deps.ready.load(Ordering::Acquire);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, json!({ "ready": ready }))
}

fn handle_stats(deps: &HttpDeps) -> Response<Body> {
    use std::sync::atomic::Ordering::Relaxed;

    let agg = deps.dispatcher.aggregate_stats();
    let registry = &deps.services.registry;
    let index = &deps.services.index;
    let reaper = deps.reaper.stats();
    let slow = &deps.services.slow;
    let (warn_ms, error_ms, critical_ms) = slow.thresholds_ms();
    let slow_stats = slow.stats();
    let store = deps.store.stats();

    let body = json!({
        "dispatcher": {
            "events_received": agg.events_received,
            "events_processed": agg.events_processed,
            "events_dropped": agg.events_dropped,
            "presence_triggers": agg.presence_triggers,
            "dialogs_active": agg.dialogs_active,
            "dialogs_reaped": agg.dialogs_reaped,
            "notify_errors": agg.notify_errors,
            "max_queue_depth": agg.max_queue_depth,
            "slow_events": agg.slow_events,
        },
        "subscriptions": {
            "total": registry.total_count(),
            "blf": registry.count_by_type(sub_core::SubscriptionType::Blf),
            "mwi": registry.count_by_type(sub_core::SubscriptionType::Mwi),
        },
        "blf_index": {
            "monitored_uris": index.monitored_uri_count(),
            "total_watchers": index.total_watcher_count(),
        },
        "reaper": {
            "scans": reaper.scan_count.load(Relaxed),
            "expired": reaper.expired_reaped.load(Relaxed),
            "stuck": reaper.stuck_reaped.load(Relaxed),
            "last_scan_ms": reaper.last_scan_duration_ms.load(Relaxed),
            "last_stale_count": reaper.last_scan_stale_count.load(Relaxed),
        },
        "slow_events": {
            "warn_count": slow_stats.warn_count.load(Relaxed),
            "error_count": slow_stats.error_count.load(Relaxed),
            "critical_count": slow_stats.critical_count.load(Relaxed),
            "max_duration_ms": slow_stats.max_duration_ms.load(Relaxed),
            "warn_threshold_ms": warn_ms,
            "error_threshold_ms": error_ms,
            "critical_threshold_ms": critical_ms,
        },
        "persistence": {
            "enabled": deps.store.is_enabled(),
            "upserts": store.upserts.load(Relaxed),
            "deletes": store.deletes.load(Relaxed),
            "loads": store.loads.load(Relaxed),
            "errors": store.errors.load(Relaxed),
            "batch_writes": store.batch_writes.load(Relaxed),
            "queue_depth": store.queue_depth.load(Relaxed),
        },
    });
    json_response(StatusCode::OK, body)
}

fn handle_stats_workers(deps: &HttpDeps) -> Response<Body> {
    use std::sync::atomic::Ordering::Relaxed;

    let workers: Vec<serde_json::Value> = deps
        .dispatcher
        .worker_stats()
        .into_iter()
        .map(|(index, stats)| {
            json!({
                "index": index,
                "events_received": stats.events_received.load(Relaxed),
                "events_processed": stats.events_processed.load(Relaxed),
                "events_dropped": stats.events_dropped.load(Relaxed),
                "presence_triggers": stats.presence_triggers.load(Relaxed),
                "dialogs_active": stats.dialogs_active.load(Relaxed),
                "queue_depth": stats.queue_depth.load(Relaxed),
                "slow_events": stats.slow_events.load(Relaxed),
            })
        })
        .collect();

    json_response(StatusCode::OK, json!({ "workers": workers }))
}

fn handle_stats_presence(deps: &HttpDeps) -> Response<Body> {
    use std::sync::atomic::Ordering::Relaxed;

    let client = deps.presence_client.stats();
    let router = deps.router.stats();
    let servers: Vec<serde_json::Value> = deps
        .failover
        .all_health()
        .into_iter()
        .map(|h| {
            json!({
                "host": h.endpoint.host,
                "port": h.endpoint.port,
                "priority": h.endpoint.priority,
                "healthy": h.is_healthy,
                "consecutive_failures": h.consecutive_failures,
                "total_successes": h.total_successes,
                "total_failures": h.total_failures,
            })
        })
        .collect();

    let body = json!({
        "client": {
            "connected": deps.presence_client.is_connected(),
            "server": deps.presence_client.connected_server(),
            "events_received": client.events_received.load(Relaxed),
            "bytes_received": client.bytes_received.load(Relaxed),
            "connect_attempts": client.connect_attempts.load(Relaxed),
            "connect_successes": client.connect_successes.load(Relaxed),
            "disconnects": client.disconnect_count.load(Relaxed),
            "failovers": client.failover_count.load(Relaxed),
            "heartbeat_timeouts": client.heartbeat_timeouts.load(Relaxed),
            "parse_errors": client.parse_errors.load(Relaxed),
        },
        "router": {
            "events_received": router.events_received.load(Relaxed),
            "events_processed": router.events_processed.load(Relaxed),
            "events_dropped": router.events_dropped.load(Relaxed),
            "notifications_generated": router.notifications_generated.load(Relaxed),
            "watchers_not_found": router.watchers_not_found.load(Relaxed),
            "queue_depth": router.queue_depth.load(Relaxed),
        },
        "servers": servers,
    });
    json_response(StatusCode::OK, body)
}

fn handle_subscriptions(deps: &HttpDeps, query: Option<&str>) -> Response<Body> {
    const MAX_LISTED: usize = 1000;

    let tenant = query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("tenant="))
            .map(str::to_owned)
    });

    let subs = match &tenant {
        Some(tenant) => deps.services.registry.tenant_subscriptions(tenant),
        None => deps.services.registry.all(),
    };

    let listed: Vec<serde_json::Value> = subs
        .iter()
        .take(MAX_LISTED)
        .map(|s| {
            json!({
                "dialog_id": s.dialog_id,
                "tenant_id": s.tenant_id,
                "type": s.kind.as_str(),
                "lifecycle": s.lifecycle.as_str(),
                "worker": s.worker_index,
            })
        })
        .collect();

    let mut body = json!({
        "count": subs.len(),
        "subscriptions": listed,
    });
    if subs.len() > MAX_LISTED {
        body["truncated"] = json!(true);
    }
    json_response(StatusCode::OK, body)
}

fn handle_config(deps: &HttpDeps) -> Response<Body> {
    let c = &deps.config;
    let servers: Vec<String> = c
        .presence_servers()
        .into_iter()
        .map(|s| format!("{}:{}", s.host, s.port))
        .collect();

    let body = json!({
        "service_id": c.service.service_id,
        "instance_name": c.service.instance_name,
        "num_workers": c.num_workers(),
        "max_subscriptions_per_tenant": c.dispatcher.max_subscriptions_per_tenant,
        "blf_ttl_secs": c.reaper.blf_subscription_ttl_secs,
        "mwi_ttl_secs": c.reaper.mwi_subscription_ttl_secs,
        "presence_servers": servers,
        "failover_strategy": c.failover_strategy().as_str(),
        "persistence_enabled": c.store.enable_persistence,
        "store_uri": "***redacted***",
        "store_database": c.store.database,
        "slow_event_warn_ms": c.slow_event.warn_threshold_ms,
        "slow_event_error_ms": c.slow_event.error_threshold_ms,
        "slow_event_critical_ms": c.slow_event.critical_threshold_ms,
    });
    json_response(StatusCode::OK, body)
}
