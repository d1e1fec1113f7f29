// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Presence server selection, health tracking, and cooldown.
//!
//! The TCP client asks for the next server before each connect attempt and
//! reports the outcome back. Failures put a server into a progressive
//! cooldown; three consecutive failures mark it unhealthy until a success
//! clears it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};

/// `host:port` plus its position-derived priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    /// Lower wins under the priority strategy
    pub priority: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStrategy {
    RoundRobin,
    Priority,
    Random,
}

impl FailoverStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "priority" => FailoverStrategy::Priority,
            "random" => FailoverStrategy::Random,
            _ => FailoverStrategy::RoundRobin,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailoverStrategy::RoundRobin => "round_robin",
            FailoverStrategy::Priority => "priority",
            FailoverStrategy::Random => "random",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub endpoint: ServerEndpoint,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub cooldown_until: Option<Instant>,
}

impl ServerHealth {
    fn new(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint,
            is_healthy: true,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            last_attempt: None,
            last_success: None,
            last_failure: None,
            cooldown_until: None,
        }
    }

    fn in_cooldown(&self) -> bool {
        match self.cooldown_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}

struct Inner {
    servers: Vec<ServerHealth>,
    round_robin_index: usize,
}

pub struct FailoverManager {
    strategy: FailoverStrategy,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl FailoverManager {
    pub fn new(
        endpoints: Vec<ServerEndpoint>,
        strategy: FailoverStrategy,
        cooldown: Duration,
    ) -> Self {
        info!(
            servers = endpoints.len(),
            strategy = strategy.as_str(),
            "failover manager initialised"
        );
        Self {
            strategy,
            cooldown,
            inner: Mutex::new(Inner {
                servers: endpoints.into_iter().map(ServerHealth::new).collect(),
                round_robin_index: 0,
            }),
        }
    }

    /// Picks the next server to try. When every server is in cooldown, the
    /// one whose cooldown expires soonest is returned so the client never
    /// stalls forever; `None` only when no servers are configured.
    pub fn next_server(&self) -> Option<ServerEndpoint> {
        let mut inner = self.inner.lock();
        if inner.servers.is_empty() {
            return None;
        }

        let pick = match self.strategy {
            FailoverStrategy::RoundRobin => select_round_robin(&mut inner),
            FailoverStrategy::Priority => select_priority(&inner),
            FailoverStrategy::Random => select_random(&inner),
        };

        let pick = pick.or_else(|| {
            // All in cooldown: force the soonest-expiring one.
            let idx = inner
                .servers
                .iter()
                .enumerate()
                .min_by_key(|(_, h)| h.cooldown_until)
                .map(|(i, _)| i);
            if let Some(i) = idx {
                warn!(
                    host = %inner.servers[i].endpoint.host,
                    port = inner.servers[i].endpoint.port,
                    "all presence servers in cooldown, forcing soonest expiry"
                );
            }
            idx
        })?;

        let health = &mut inner.servers[pick];
        health.last_attempt = Some(Instant::now());
        info!(
            host = %health.endpoint.host,
            port = health.endpoint.port,
            failures = health.consecutive_failures,
            "selected presence server"
        );
        Some(health.endpoint.clone())
    }

    pub fn report_success(&self, endpoint: &ServerEndpoint) {
        let mut inner = self.inner.lock();
        let Some(health) = find_mut(&mut inner.servers, endpoint) else {
            return;
        };
        health.is_healthy = true;
        health.consecutive_failures = 0;
        health.total_successes += 1;
        health.last_success = Some(Instant::now());
        health.cooldown_until = None;

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            total_ok = health.total_successes,
            "presence server healthy"
        );
    }

    pub fn report_failure(&self, endpoint: &ServerEndpoint, reason: &str) {
        let mut inner = self.inner.lock();
        let Some(health) = find_mut(&mut inner.servers, endpoint) else {
            return;
        };
        health.consecutive_failures += 1;
        health.total_failures += 1;
        health.last_failure = Some(Instant::now());

        // Progressive cooldown, capped at five times the base interval.
        let multiplier = health.consecutive_failures.min(5);
        let cooldown = self.cooldown * multiplier;
        health.cooldown_until = Some(Instant::now() + cooldown);

        if health.consecutive_failures >= 3 {
            health.is_healthy = false;
        }

        warn!(
            host = %endpoint.host,
            port = endpoint.port,
            failures = health.consecutive_failures,
            reason,
            cooldown_secs = cooldown.as_secs(),
            "presence server failure"
        );
    }

    pub fn all_health(&self) -> Vec<ServerHealth> {
        self.inner.lock().servers.clone()
    }

    pub fn any_server_available(&self) -> bool {
        self.inner.lock().servers.iter().any(|h| !h.in_cooldown())
    }

    pub fn healthy_count(&self) -> usize {
        self.inner
            .lock()
            .servers
            .iter()
            .filter(|h| h.is_healthy)
            .count()
    }

    /// Returns every server to a clean slate, e.g. after a config reload.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock();
        for h in &mut inner.servers {
            h.is_healthy = true;
            h.consecutive_failures = 0;
            h.cooldown_until = None;
        }
    }
}

fn find_mut<'a>(
    servers: &'a mut [ServerHealth],
    endpoint: &ServerEndpoint,
) -> Option<&'a mut ServerHealth> {
    servers
        .iter_mut()
        .find(|h| h.endpoint.host == endpoint.host && h.endpoint.port == endpoint.port)
}

fn select_round_robin(inner: &mut Inner) -> Option<usize> {
    let n = inner.servers.len();
    // Prefer servers that are both healthy and out of cooldown.
    for offset in 0..n {
        let idx = (inner.round_robin_index + offset) % n;
        if !inner.servers[idx].in_cooldown() && inner.servers[idx].is_healthy {
            inner.round_robin_index = (idx + 1) % n;
            return Some(idx);
        }
    }
    // Fall back to anything out of cooldown.
    for offset in 0..n {
        let idx = (inner.round_robin_index + offset) % n;
        if !inner.servers[idx].in_cooldown() {
            inner.round_robin_index = (idx + 1) % n;
            return Some(idx);
        }
    }
    None
}

fn select_priority(inner: &Inner) -> Option<usize> {
    inner
        .servers
        .iter()
        .enumerate()
        .filter(|(_, h)| !h.in_cooldown())
        .min_by_key(|(_, h)| h.endpoint.priority)
        .map(|(i, _)| i)
}

fn select_random(inner: &Inner) -> Option<usize> {
    let mut available: Vec<usize> = inner
        .servers
        .iter()
        .enumerate()
        .filter(|(_, h)| !h.in_cooldown() && h.is_healthy)
        .map(|(i, _)| i)
        .collect();
    if available.is_empty() {
        available = inner
            .servers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.in_cooldown())
            .map(|(i, _)| i)
            .collect();
    }
    if available.is_empty() {
        return None;
    }
    let pick = rand::thread_rng().gen_range(0..available.len());
    Some(available[pick])
}
