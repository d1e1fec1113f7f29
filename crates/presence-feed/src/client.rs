// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Long-lived TCP reader for the presence feed.
//!
//! One task runs the connect→read loop for the life of the process: ask the
//! failover manager for a server, connect with a bounded timeout, then read
//! until EOF, error, heartbeat loss, or idle timeout, reporting health back
//! after every attempt. Reconnects back off exponentially and reset on a
//! successful connect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::event::CallStateEvent;
use crate::failover::{FailoverManager, ServerEndpoint};
use crate::parser::FeedParser;

/// How long one connect attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read poll granularity; heartbeat and idle checks run at this cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

pub type EventCallback = Box<dyn Fn(CallStateEvent) + Send + Sync>;
pub type StateCallback = Box<dyn Fn(ConnectionState, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reconnect_interval: Duration,
    pub reconnect_max_interval: Duration,
    /// Zero-byte idle cutoff; heartbeats count as data.
    pub read_timeout: Duration,
    pub recv_buffer_size: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            reconnect_max_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            recv_buffer_size: 64 * 1024,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_miss_threshold: 3,
        }
    }
}

#[derive(Default)]
pub struct PresenceClientStats {
    pub events_received: AtomicU64,
    pub events_delivered: AtomicU64,
    pub bytes_received: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub disconnect_count: AtomicU64,
    pub failover_count: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub parse_errors: AtomicU64,
}

struct Shared {
    connected: AtomicBool,
    state: Mutex<(ConnectionState, String)>,
    current_server: Mutex<Option<ServerEndpoint>>,
    stats: PresenceClientStats,
    on_event: EventCallback,
    on_state: Option<StateCallback>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState, detail: &str) {
        self.connected
            .store(state == ConnectionState::Connected, Ordering::Release);
        *self.state.lock() = (state, detail.to_owned());
        if let Some(cb) = &self.on_state {
            cb(state, detail);
        }
    }
}

pub struct PresenceTcpClient {
    config: ClientConfig,
    failover: Arc<FailoverManager>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTcpClient {
    pub fn new(
        config: ClientConfig,
        failover: Arc<FailoverManager>,
        on_event: EventCallback,
        on_state: Option<StateCallback>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            failover,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                state: Mutex::new((ConnectionState::Disconnected, String::new())),
                current_server: Mutex::new(None),
                stats: PresenceClientStats::default(),
                on_event,
                on_state,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawns the reader task. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("presence client already started");
            return;
        }
        let reader = ReaderTask {
            config: self.config.clone(),
            failover: Arc::clone(&self.failover),
            shared: Arc::clone(&self.shared),
            shutdown: self.shutdown_tx.subscribe(),
            backoff: self.config.reconnect_interval,
        };
        *task = Some(tokio::spawn(reader.run()));
        info!("presence client started");
    }

    /// Signals the reader to stop and waits for it. The in-flight connect or
    /// read is abandoned at the next poll boundary. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("presence client stopped");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().0
    }

    pub fn connected_server(&self) -> String {
        match &*self.shared.current_server.lock() {
            Some(ep) => format!("{}:{}", ep.host, ep.port),
            None => "(none)".to_owned(),
        }
    }

    pub fn stats(&self) -> &PresenceClientStats {
        &self.shared.stats
    }
}

struct ReaderTask {
    config: ClientConfig,
    failover: Arc<FailoverManager>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    backoff: Duration,
}

impl ReaderTask {
    async fn run(mut self) {
        while !*self.shutdown.borrow() {
            let Some(endpoint) = self.failover.next_server() else {
                warn!("no presence servers configured, waiting");
                self.backoff_wait().await;
                continue;
            };

            let stream = match self.connect(&endpoint).await {
                Ok(stream) => stream,
                Err(reason) => {
                    self.failover.report_failure(&endpoint, &reason);
                    self.shared.stats.failover_count.fetch_add(1, Ordering::Relaxed);
                    if *self.shutdown.borrow() {
                        break;
                    }
                    self.backoff_wait().await;
                    continue;
                }
            };

            self.failover.report_success(&endpoint);
            self.backoff = self.config.reconnect_interval;

            let reason = self.read_loop(stream).await;

            self.shared.stats.disconnect_count.fetch_add(1, Ordering::Relaxed);
            self.shared.set_state(ConnectionState::Disconnected, &reason);
            *self.shared.current_server.lock() = None;
            self.failover.report_failure(&endpoint, &reason);
            self.shared.stats.failover_count.fetch_add(1, Ordering::Relaxed);

            if !*self.shutdown.borrow() {
                self.backoff_wait().await;
            }
        }
        self.shared.set_state(ConnectionState::Disconnected, "stopped");
    }

    async fn connect(&mut self, endpoint: &ServerEndpoint) -> Result<TcpStream, String> {
        let target = format!("{}:{}", endpoint.host, endpoint.port);
        self.shared.set_state(ConnectionState::Connecting, &target);
        self.shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let attempt = timeout(CONNECT_TIMEOUT, TcpStream::connect(&target));
        let result = tokio::select! {
            _ = self.shutdown.changed() => return Err("shutdown".to_owned()),
            result = attempt => result,
        };

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(server = %target, error = %e, "presence connect failed");
                return Err(e.to_string());
            }
            Err(_) => {
                warn!(server = %target, "presence connect timed out");
                return Err("connect timeout".to_owned());
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        *self.shared.current_server.lock() = Some(endpoint.clone());
        self.shared.stats.connect_successes.fetch_add(1, Ordering::Relaxed);
        self.shared.set_state(ConnectionState::Connected, &target);
        info!(server = %target, "presence feed connected");
        Ok(stream)
    }

    /// Reads until the connection is unusable; returns the reason.
    async fn read_loop(&mut self, mut stream: TcpStream) -> String {
        let mut parser = FeedParser::new();
        let mut buf = vec![0u8; self.config.recv_buffer_size.max(1024)];
        let heartbeat_timeout =
            self.config.heartbeat_interval * self.config.heartbeat_miss_threshold;
        let mut last_heartbeat = Instant::now();
        let mut last_data = Instant::now();

        loop {
            if *self.shutdown.borrow() {
                return "shutdown".to_owned();
            }

            let read = tokio::select! {
                _ = self.shutdown.changed() => return "shutdown".to_owned(),
                read = timeout(POLL_INTERVAL, stream.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_) => {
                    // Poll expired with no data; check the supervision timers.
                    if last_heartbeat.elapsed() > heartbeat_timeout {
                        self.shared
                            .stats
                            .heartbeat_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            elapsed_ms = last_heartbeat.elapsed().as_millis() as u64,
                            "presence heartbeat timeout"
                        );
                        return "heartbeat timeout".to_owned();
                    }
                    if last_data.elapsed() > self.config.read_timeout {
                        warn!("presence read timeout");
                        return "read timeout".to_owned();
                    }
                    continue;
                }
                Ok(Ok(0)) => return "peer closed".to_owned(),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return e.to_string(),
            };

            last_data = Instant::now();
            self.shared
                .stats
                .bytes_received
                .fetch_add(n as u64, Ordering::Relaxed);

            let outcome = parser.feed(&buf[..n]);
            if outcome.parse_errors > 0 {
                self.shared
                    .stats
                    .parse_errors
                    .fetch_add(outcome.parse_errors, Ordering::Relaxed);
            }
            if outcome.received_heartbeat || !outcome.events.is_empty() {
                last_heartbeat = Instant::now();
            }

            for event in outcome.events {
                self.shared.stats.events_received.fetch_add(1, Ordering::Relaxed);
                (self.shared.on_event)(event);
                self.shared.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn backoff_wait(&mut self) {
        self.shared.set_state(
            ConnectionState::Reconnecting,
            &format!("backoff={}s", self.backoff.as_secs()),
        );
        tokio::select! {
            _ = self.shutdown.changed() => {}
            _ = sleep(self.backoff) => {}
        }
        self.backoff = (self.backoff * 2).min(self.config.reconnect_max_interval);
    }
}
