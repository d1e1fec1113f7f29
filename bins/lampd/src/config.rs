//! Daemon configuration.
//!
//! Sections mirror the subsystems; every field has a production default so
//! an empty config file is a working single-node setup. The file format is
//! JSON with `${ENV_VAR}` substitution in string values.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use presence_feed::{FailoverStrategy, ServerEndpoint};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Stamped into persisted documents and the stats readout
    pub service_id: String,
    pub instance_name: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: "lampd-01".into(),
            instance_name: "lampd".into(),
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_url: String,
    pub user_agent: String,
    pub transport: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_url: "sip:*:5060".into(),
            user_agent: "lampd/0.1".into(),
            transport: "udp".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 0 means one worker per available core
    pub num_workers: usize,
    pub max_incoming_queue_per_worker: usize,
    pub max_dialogs_per_worker: usize,
    pub max_subscriptions_per_tenant: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_incoming_queue_per_worker: 50_000,
            max_dialogs_per_worker: 2_000_000,
            max_subscriptions_per_tenant: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub blf_subscription_ttl_secs: u64,
    pub mwi_subscription_ttl_secs: u64,
    pub scan_interval_secs: u64,
    pub stuck_processing_timeout_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            blf_subscription_ttl_secs: 3600,
            mwi_subscription_ttl_secs: 7200,
            scan_interval_secs: 60,
            stuck_processing_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// CSV of `host:port`; list position doubles as priority
    pub servers: String,
    pub reconnect_interval_secs: u64,
    pub reconnect_max_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub recv_buffer_size: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_threshold: u32,
    pub max_pending_events: usize,
    /// `round_robin`, `priority`, or `random`
    pub failover_strategy: String,
    pub server_cooldown_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            servers: "127.0.0.1:9000".into(),
            reconnect_interval_secs: 5,
            reconnect_max_interval_secs: 60,
            read_timeout_secs: 30,
            recv_buffer_size: 65_536,
            heartbeat_interval_secs: 15,
            heartbeat_miss_threshold: 3,
            max_pending_events: 100_000,
            failover_strategy: "round_robin".into(),
            server_cooldown_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub enable_persistence: bool,
    pub uri: String,
    pub database: String,
    pub collection_subscriptions: String,
    pub pool_min_size: u32,
    pub pool_max_size: u32,
    pub write_concern: String,
    pub read_preference: String,
    pub connect_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub sync_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            enable_persistence: true,
            uri: "mongodb://localhost:27017".into(),
            database: "lampd".into(),
            collection_subscriptions: "subscriptions".into(),
            pool_min_size: 2,
            pool_max_size: 10,
            write_concern: "majority".into(),
            read_preference: "primaryPreferred".into(),
            connect_timeout_ms: 5_000,
            socket_timeout_ms: 10_000,
            sync_interval_secs: 5,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlowEventConfig {
    pub warn_threshold_ms: u64,
    pub error_threshold_ms: u64,
    pub critical_threshold_ms: u64,
}

impl Default for SlowEventConfig {
    fn default() -> Self {
        Self {
            warn_threshold_ms: 50,
            error_threshold_ms: 200,
            critical_threshold_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".into(),
            port: 8080,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_connections: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Empty directory disables the file appender
    pub directory: String,
    pub base_name: String,
    pub console_level: String,
    pub max_file_size_mb: u64,
    pub max_rotated_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
            base_name: "lampd".into(),
            console_level: "warn".into(),
            max_file_size_mb: 50,
            max_rotated_files: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub service: ServiceConfig,
    pub sip: SipConfig,
    pub dispatcher: DispatcherConfig,
    pub reaper: ReaperConfig,
    pub presence: PresenceConfig,
    pub store: StoreSection,
    pub slow_event: SlowEventConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let substituted = substitute_env(&raw);
        let config: DaemonConfig = serde_json::from_str(&substituted)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Effective worker count: configured, or one per core.
    pub fn num_workers(&self) -> usize {
        if self.dispatcher.num_workers > 0 {
            self.dispatcher.num_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8)
        }
    }

    /// Parses the CSV server list; position becomes priority, the port
    /// defaults to 9000.
    pub fn presence_servers(&self) -> Vec<ServerEndpoint> {
        parse_servers(&self.presence.servers)
    }

    pub fn failover_strategy(&self) -> FailoverStrategy {
        FailoverStrategy::parse(&self.presence.failover_strategy)
    }

    pub fn blf_ttl(&self) -> Duration {
        Duration::from_secs(self.reaper.blf_subscription_ttl_secs)
    }

    pub fn mwi_ttl(&self) -> Duration {
        Duration::from_secs(self.reaper.mwi_subscription_ttl_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.reaper.stuck_processing_timeout_secs)
    }
}

fn parse_servers(csv: &str) -> Vec<ServerEndpoint> {
    let mut servers = Vec::new();
    for (priority, token) in csv.split(',').enumerate() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (host, port) = match token.rsplit_once(':') {
            Some((host, port_str)) => {
                (host.to_owned(), port_str.parse::<u16>().unwrap_or(9000))
            }
            None => (token.to_owned(), 9000),
        };
        servers.push(ServerEndpoint {
            host,
            port,
            priority,
        });
    }
    servers
}

/// Replaces `${NAME}` in the raw config text with the environment value, or
/// the empty string when unset.
fn substitute_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DaemonConfig::default();
        assert!(cfg.num_workers() >= 1);
        assert_eq!(cfg.dispatcher.max_subscriptions_per_tenant, 5_000);
        assert_eq!(cfg.reaper.scan_interval_secs, 60);
        assert_eq!(cfg.presence_servers().len(), 1);
        assert_eq!(cfg.failover_strategy(), FailoverStrategy::RoundRobin);
    }

    #[test]
    fn parses_server_csv() {
        let servers = parse_servers("feed1.example.com:9000, feed2.example.com:9001,bare-host");
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].host, "feed1.example.com");
        assert_eq!(servers[0].priority, 0);
        assert_eq!(servers[1].port, 9001);
        assert_eq!(servers[1].priority, 1);
        assert_eq!(servers[2].host, "bare-host");
        assert_eq!(servers[2].port, 9000);
    }

    #[test]
    fn parses_partial_json() {
        let json = r#"{
            "dispatcher": { "num_workers": 4 },
            "presence": { "servers": "a:1,b:2", "failover_strategy": "priority" }
        }"#;
        let cfg: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.num_workers(), 4);
        assert_eq!(cfg.presence_servers().len(), 2);
        assert_eq!(cfg.failover_strategy(), FailoverStrategy::Priority);
        // Untouched sections keep defaults.
        assert_eq!(cfg.store.batch_size, 500);
    }

    #[test]
    fn env_substitution() {
        std::env::set_var("LAMPD_TEST_DB", "subs_test");
        let raw = r#"{"store": {"database": "${LAMPD_TEST_DB}"}}"#;
        let cfg: DaemonConfig = serde_json::from_str(&substitute_env(raw)).unwrap();
        assert_eq!(cfg.store.database, "subs_test");

        let raw = r#"{"store": {"database": "${LAMPD_UNSET_VAR}"}}"#;
        let cfg: DaemonConfig = serde_json::from_str(&substitute_env(raw)).unwrap();
        assert_eq!(cfg.store.database, "");
    }
}
