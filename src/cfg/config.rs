// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Runtime configuration of one node, loaded from YAML.
///
/// Every section and field has a default, so an empty document is a valid
/// configuration. Durations are written in the unit named by the key
/// (`*_ms`, `*_seconds`).
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub dns: DnsConfig,
    pub peers: PeerConfig,
    pub sandbox: SandboxConfig,
    pub server: ServerConfig,
    pub crawl: CrawlConfig,
    pub index: IndexConfig,
}

/// Keys shared by every participant of one network.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// Well-known key the integrity MAC is derived from. Cooperative
    /// integrity, not authentication.
    pub key: String,
    /// When set, frames with an unknown message kind are skipped instead of
    /// rejected, so newer minor versions can talk past this node.
    pub accept_unknown_kinds: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            key: "rednet-public".to_string(),
            accept_unknown_kinds: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "send_timeout_ms", with = "serde_millis")]
    pub send_timeout: Duration,
    pub retries: u32,
    #[serde(rename = "retry_backoff_ms", with = "serde_millis")]
    pub retry_backoff: Duration,
    #[serde(rename = "keepalive_interval_ms", with = "serde_millis")]
    pub keepalive_interval: Duration,
    #[serde(rename = "replay_window_seconds", with = "serde_secs")]
    pub replay_window: Duration,
    #[serde(rename = "clock_skew_seconds", with = "serde_secs")]
    pub skew: Duration,
    /// Per-connection inbound queue bound; overflow drops the oldest entry.
    pub inbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(5000),
            retries: 2,
            retry_backoff: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(30_000),
            replay_window: Duration::from_secs(300),
            skew: Duration::from_secs(60),
            inbound_queue: 256,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DnsConfig {
    #[serde(rename = "cache_ttl_seconds", with = "serde_secs")]
    pub cache_ttl: Duration,
    #[serde(rename = "max_cache_ttl_seconds", with = "serde_secs")]
    pub max_cache_ttl: Duration,
    #[serde(rename = "stale_grace_seconds", with = "serde_secs")]
    pub stale_grace: Duration,
    #[serde(rename = "negative_ttl_seconds", with = "serde_secs")]
    pub negative_ttl: Duration,
    #[serde(rename = "query_window_ms", with = "serde_millis")]
    pub query_window: Duration,
    #[serde(rename = "verification_timeout_ms", with = "serde_millis")]
    pub verification_timeout: Duration,
    /// Return unverified answers instead of failing with unreachable.
    pub allow_unverified: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            max_cache_ttl: Duration::from_secs(3600),
            stale_grace: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(15),
            query_window: Duration::from_millis(800),
            verification_timeout: Duration::from_millis(1000),
            allow_unverified: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct PeerConfig {
    #[serde(rename = "freshness_seconds", with = "serde_secs")]
    pub freshness: Duration,
    #[serde(rename = "idle_timeout_seconds", with = "serde_secs")]
    pub idle_timeout: Duration,
    #[serde(rename = "sweep_interval_seconds", with = "serde_secs")]
    pub sweep_interval: Duration,
    /// Capability strings advertised in peer announcements.
    pub capabilities: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
            capabilities: vec!["browse".to_string(), "serve".to_string()],
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    #[serde(rename = "wall_clock_ms", with = "serde_millis")]
    pub wall_clock: Duration,
    pub output_bytes_max: usize,
    pub string_bytes_max: usize,
    pub memory_bytes_max: usize,
    /// Interpreter operation budget per invocation; the deadline is checked
    /// at fixed operation intervals.
    pub op_budget: u64,
    pub concurrent_max: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_millis(5000),
            output_bytes_max: 102_400,
            string_bytes_max: 10_240,
            memory_bytes_max: 1_048_576,
            op_budget: 5_000_000,
            concurrent_max: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(rename = "session_idle_seconds", with = "serde_secs")]
    pub session_idle: Duration,
    pub session_entry_bytes_max: usize,
    pub session_total_bytes_max: usize,
    pub cookie_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_idle: Duration::from_secs(1800),
            session_entry_bytes_max: 1024,
            session_total_bytes_max: 16_384,
            cookie_name: "rdnt_session".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_depth: u32,
    pub max_pages: usize,
    #[serde(rename = "min_interval_ms", with = "serde_millis")]
    pub min_interval: Duration,
    #[serde(rename = "timeout_ms", with = "serde_millis")]
    pub timeout: Duration,
    pub follow_external: bool,
    /// An already-indexed URL is re-fetched only after this age.
    #[serde(rename = "max_age_seconds", with = "serde_secs")]
    pub max_age: Duration,
    pub per_host_fetches: usize,
    /// User-agent token matched against robots directives.
    pub agent: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_pages: 100,
            min_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(5000),
            follow_external: false,
            max_age: Duration::from_secs(3600),
            per_host_fetches: 2,
            agent: "rednet-crawler".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub positions_per_term_per_doc: usize,
    pub snapshot_path: Option<String>,
    #[serde(rename = "snapshot_interval_seconds", with = "serde_secs")]
    pub snapshot_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            positions_per_term_per_doc: 10,
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.network.key.is_empty(), "network.key must not be empty");

        ensure!(
            self.transport.inbound_queue >= 1,
            "transport.inbound_queue must be >= 1"
        );
        ensure!(
            !self.transport.send_timeout.is_zero(),
            "transport.send_timeout_ms must be > 0"
        );

        // A cache TTL above the local maximum is clamped, not rejected.
        if self.dns.cache_ttl > self.dns.max_cache_ttl {
            self.dns.cache_ttl = self.dns.max_cache_ttl;
        }
        ensure!(
            !self.dns.query_window.is_zero(),
            "dns.query_window_ms must be > 0"
        );

        ensure!(
            self.sandbox.output_bytes_max >= 1,
            "sandbox.output_bytes_max must be >= 1"
        );
        ensure!(
            self.sandbox.concurrent_max >= 1,
            "sandbox.concurrent_max must be >= 1"
        );
        ensure!(self.sandbox.op_budget >= 1, "sandbox.op_budget must be >= 1");

        ensure!(
            self.server.session_entry_bytes_max
                <= self.server.session_total_bytes_max,
            "server.session_entry_bytes_max must fit in the total bound"
        );

        ensure!(self.crawl.max_pages >= 1, "crawl.max_pages must be >= 1");
        ensure!(
            self.crawl.per_host_fetches >= 1,
            "crawl.per_host_fetches must be >= 1"
        );

        ensure!(
            self.index.positions_per_term_per_doc >= 1,
            "index.positions_per_term_per_doc must be >= 1"
        );

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_valid() {
        let mut cfg: Config = serde_yaml::from_str("{}").expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.dns.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.transport.retries, 2);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let y = "dns:\n  cache_ttl_seconds: 60\n";
        let cfg: Config = serde_yaml::from_str(y).expect("parse");
        assert_eq!(cfg.dns.cache_ttl, Duration::from_secs(60));
        assert_eq!(cfg.dns.query_window, Duration::from_millis(800));
    }

    #[test]
    fn test_ttl_clamped_to_max() {
        let y = "dns:\n  cache_ttl_seconds: 999999\n  max_cache_ttl_seconds: 600\n";
        let mut cfg: Config = serde_yaml::from_str(y).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.dns.cache_ttl, Duration::from_secs(600));
    }
}
