//! lampd: multi-tenant SIP event processor for BLF and MWI subscriptions.
//!
//! Terminates SUBSCRIBE dialogs for the `dialog` (RFC 4235) and
//! `message-summary` (RFC 3842) event packages and drives the NOTIFY stream
//! from both the signalling stack and an external TCP presence feed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use presence_feed::{
    client::ClientConfig, ConnectionState, FailoverManager, PresenceTcpClient,
};
use sub_core::SipStack;
use sub_store::{MemoryBackend, StoreConfig, SubscriptionStore};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lampd::config::DaemonConfig;
use lampd::dispatcher::DialogDispatcher;
use lampd::http::{HttpDeps, HttpServer};
use lampd::reaper::StaleSubscriptionReaper;
use lampd::router::PresenceEventRouter;
use lampd::services::Services;
use lampd::sip::{self, SipBridge};

/// SIP event processor daemon for BLF/MWI subscriptions
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the worker count (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,

    /// Override the presence server list (CSV host:port)
    #[arg(long)]
    presence_servers: Option<String>,

    /// Override the HTTP readout port
    #[arg(long)]
    http_port: Option<u16>,

    /// Disable document-store persistence for this run
    #[arg(long)]
    no_persistence: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.dispatcher.num_workers = workers;
    }
    if let Some(servers) = args.presence_servers {
        config.presence.servers = servers;
    }
    if let Some(port) = args.http_port {
        config.http.port = port;
    }
    if args.no_persistence {
        config.store.enable_persistence = false;
    }

    let _log_guard = init_logging(&config)?;
    let config = Arc::new(config);

    info!(
        service_id = %config.service.service_id,
        instance = %config.service.instance_name,
        workers = config.num_workers(),
        "lampd starting"
    );

    // Persistence pipeline. With persistence enabled an unreachable backend
    // is fatal; a half-started processor would silently lose resumability.
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(SubscriptionStore::new(
        StoreConfig {
            enabled: config.store.enable_persistence,
            service_id: config.service.service_id.clone(),
            sync_interval: Duration::from_secs(config.store.sync_interval_secs),
            batch_size: config.store.batch_size,
        },
        backend,
    ));
    store
        .start()
        .await
        .context("subscription store start failed")?;

    // Outbound SIP surface: a channel bridge the embedding stack drains.
    let (bridge, actions_rx) = SipBridge::new();
    let sip: Arc<dyn SipStack> = Arc::new(bridge);
    let action_drain = sip::spawn_action_drain(actions_rx);

    let services = Services::new(Arc::clone(&config), Arc::clone(&store), sip);
    let dispatcher = Arc::new(DialogDispatcher::new(Arc::clone(&services)));

    // Recovery happens before the workers start so a resumed record is
    // installed in its owning shard before any event can race it.
    if store.is_enabled() {
        let recovered = store
            .load_active_subscriptions()
            .await
            .context("recovery load failed")?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovering subscriptions");
            for stored in recovered {
                if let Err(e) = dispatcher.load_recovered_subscription(stored.record) {
                    warn!(error = %e, "recovered subscription rejected");
                }
            }
        }
    }

    dispatcher
        .start()
        .map_err(|e| anyhow::anyhow!("dispatcher start failed: {}", e))?;

    // Presence feed: failover manager, router, TCP reader. A feed outage is
    // a degradation, never fatal.
    let failover = Arc::new(FailoverManager::new(
        config.presence_servers(),
        config.failover_strategy(),
        Duration::from_secs(config.presence.server_cooldown_secs),
    ));
    let router = Arc::new(PresenceEventRouter::new(
        config.presence.max_pending_events,
        Arc::clone(&dispatcher),
        Arc::clone(&services.index),
    ));
    let ingress = router.ingress();
    let presence_client = Arc::new(PresenceTcpClient::new(
        ClientConfig {
            reconnect_interval: Duration::from_secs(config.presence.reconnect_interval_secs),
            reconnect_max_interval: Duration::from_secs(
                config.presence.reconnect_max_interval_secs,
            ),
            read_timeout: Duration::from_secs(config.presence.read_timeout_secs),
            recv_buffer_size: config.presence.recv_buffer_size,
            heartbeat_interval: Duration::from_secs(config.presence.heartbeat_interval_secs),
            heartbeat_miss_threshold: config.presence.heartbeat_miss_threshold,
        },
        Arc::clone(&failover),
        Box::new(move |event| ingress.deliver(event)),
        Some(Box::new(|state, detail| {
            PresenceEventRouter::on_connection_state_changed(
                state == ConnectionState::Connected,
                detail,
            );
        })),
    ));
    presence_client.start();

    let reaper = Arc::new(StaleSubscriptionReaper::start(
        Arc::clone(&config),
        Arc::clone(&dispatcher),
        Arc::clone(&store),
    ));

    let ready = Arc::new(AtomicBool::new(false));
    let http_server = if config.http.enabled {
        Some(HttpServer::start(Arc::new(HttpDeps {
            config: Arc::clone(&config),
            services: Arc::clone(&services),
            dispatcher: Arc::clone(&dispatcher),
            presence_client: Arc::clone(&presence_client),
            failover: Arc::clone(&failover),
            router: Arc::clone(&router),
            reaper: Arc::clone(&reaper),
            store: Arc::clone(&store),
            ready: Arc::clone(&ready),
        }))?)
    } else {
        None
    };

    ready.store(true, Ordering::Release);
    info!(service_id = %config.service.service_id, "all components started");

    // Periodic stats heartbeat until ctrl-c.
    let mut ticker = time::interval(Duration::from_secs(30));
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "signal handler failed");
                }
                warn!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let agg = dispatcher.aggregate_stats();
                info!(
                    events_processed = agg.events_processed,
                    events_received = agg.events_received,
                    dialogs_active = agg.dialogs_active,
                    slow_events = agg.slow_events,
                    presence = presence_client.connection_state().as_str(),
                    "stats heartbeat"
                );
            }
        }
    }

    // Reverse start order.
    info!("shutting down");
    if let Some(http_server) = &http_server {
        http_server.stop().await;
    }
    reaper.stop().await;
    presence_client.stop().await;
    router.stop().await;
    dispatcher.stop().await;
    store.stop().await;
    action_drain.abort();

    info!("lampd stopped cleanly");
    Ok(())
}

/// Console subscriber plus an optional daily-rolling file appender. The
/// returned guard must live for the life of the process so buffered file
/// output is flushed.
fn init_logging(config: &DaemonConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.service.log_level))
        .context("invalid log level")?;

    if config.logging.directory.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(
        &config.logging.directory,
        format!("{}.log", config.logging.base_name),
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}
