//! Runtime configuration
//!
//! Everything is optional except the auth secret. Durations are
//! humantime strings (`"250ms"`, `"1s"`, `"1m"`) both in TOML files and
//! in environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main simurgh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimurghConfig {
    /// Symmetric key material for envelope encryption. Required.
    pub auth_secret: String,

    /// Outbound send semaphore size.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries on TCP connection refusal.
    #[serde(default = "default_tcp_connect_retries")]
    pub tcp_connect_retries: u32,

    /// Period of the reaper task.
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Delay after server start before membership operations begin.
    #[serde(default = "default_boot_wait", with = "humantime_serde")]
    pub boot_wait: Duration,

    /// Upper bound on the join handshake.
    #[serde(default = "default_registration_timeout", with = "humantime_serde")]
    pub registration_timeout: Duration,

    /// Probe tick.
    #[serde(default = "default_health_poll_interval", with = "humantime_serde")]
    pub health_poll_interval: Duration,

    /// Per-probe base timeout, inflated by the local-health multiplier.
    #[serde(default = "default_health_check_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// `k` for indirect probing.
    #[serde(default = "default_indirect_check_nodes")]
    pub indirect_check_nodes: usize,

    /// Lower bound factor for the adaptive suspicion timeout.
    #[serde(default = "default_min_suspect_timeout_multiplier")]
    pub min_suspect_timeout_multiplier: f64,

    /// Upper bound factor for the adaptive suspicion timeout.
    #[serde(default = "default_max_suspect_timeout_multiplier")]
    pub max_suspect_timeout_multiplier: f64,

    /// Denominator in the suspicion-timeout modifier formula.
    #[serde(default = "default_min_suspect_nodes_threshold")]
    pub min_suspect_nodes_threshold: usize,

    /// Ceiling of the local-health multiplier.
    #[serde(default = "default_max_suspect_multiplier")]
    pub max_suspect_multiplier: u32,

    /// Node count the registrar's discovery loop waits for.
    #[serde(default = "default_expected_nodes")]
    pub expected_nodes: usize,

    /// Poll cadence of the registrar's discovery loop.
    #[serde(default = "default_discovery_poll_interval", with = "humantime_serde")]
    pub discovery_poll_interval: Duration,

    /// Resolver settings.
    #[serde(default)]
    pub dns: DnsConfig,
}

/// Resolver and DNS client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Outer bound on one resolver query, CNAME chasing included.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Bound on a single upstream request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Upstream nameserver URLs (`udp://…`, `tcp://…`, `https://…`).
    #[serde(default)]
    pub nameservers: Vec<String>,

    /// Suffixes the resolver answers authoritatively (NXDOMAIN on miss).
    #[serde(default)]
    pub zone_domains: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            query_timeout: default_query_timeout(),
            request_timeout: default_request_timeout(),
            nameservers: Vec::new(),
            zone_domains: Vec::new(),
        }
    }
}

fn default_max_concurrency() -> usize {
    2048
}

fn default_tcp_connect_retries() -> u32 {
    3
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_boot_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_registration_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_health_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_check_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_indirect_check_nodes() -> usize {
    3
}

fn default_min_suspect_timeout_multiplier() -> f64 {
    5.0
}

fn default_max_suspect_timeout_multiplier() -> f64 {
    30.0
}

fn default_min_suspect_nodes_threshold() -> usize {
    3
}

fn default_max_suspect_multiplier() -> u32 {
    8
}

fn default_expected_nodes() -> usize {
    1
}

fn default_discovery_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl SimurghConfig {
    /// Build a config with defaults around the given secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            auth_secret: secret.into(),
            max_concurrency: default_max_concurrency(),
            tcp_connect_retries: default_tcp_connect_retries(),
            cleanup_interval: default_cleanup_interval(),
            boot_wait: default_boot_wait(),
            registration_timeout: default_registration_timeout(),
            health_poll_interval: default_health_poll_interval(),
            health_check_timeout: default_health_check_timeout(),
            indirect_check_nodes: default_indirect_check_nodes(),
            min_suspect_timeout_multiplier: default_min_suspect_timeout_multiplier(),
            max_suspect_timeout_multiplier: default_max_suspect_timeout_multiplier(),
            min_suspect_nodes_threshold: default_min_suspect_nodes_threshold(),
            max_suspect_multiplier: default_max_suspect_multiplier(),
            expected_nodes: default_expected_nodes(),
            discovery_poll_interval: default_discovery_poll_interval(),
            dns: DnsConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the environment.
    ///
    /// `AUTH_SECRET` is required; every other variable falls back to its
    /// default. Unparseable values are reported, not ignored.
    pub fn from_env() -> anyhow::Result<Self> {
        let secret =
            std::env::var("AUTH_SECRET").map_err(|_| anyhow::anyhow!("AUTH_SECRET is not set"))?;

        let mut config = Self::with_secret(secret);

        if let Some(value) = env_parse::<usize>("MAX_CONCURRENCY")? {
            config.max_concurrency = value;
        }
        if let Some(value) = env_parse::<u32>("TCP_CONNECT_RETRIES")? {
            config.tcp_connect_retries = value;
        }
        if let Some(value) = env_duration("CLEANUP_INTERVAL")? {
            config.cleanup_interval = value;
        }
        if let Some(value) = env_duration("BOOT_WAIT")? {
            config.boot_wait = value;
        }
        if let Some(value) = env_duration("REGISTRATION_TIMEOUT")? {
            config.registration_timeout = value;
        }
        if let Some(value) = env_duration("HEALTH_POLL_INTERVAL")? {
            config.health_poll_interval = value;
        }
        if let Some(value) = env_duration("HEALTH_CHECK_TIMEOUT")? {
            config.health_check_timeout = value;
        }
        if let Some(value) = env_parse::<usize>("INDIRECT_CHECK_NODES")? {
            config.indirect_check_nodes = value;
        }
        if let Some(value) = env_parse::<f64>("MIN_SUSPECT_TIMEOUT_MULTIPLIER")? {
            config.min_suspect_timeout_multiplier = value;
        }
        if let Some(value) = env_parse::<f64>("MAX_SUSPECT_TIMEOUT_MULTIPLIER")? {
            config.max_suspect_timeout_multiplier = value;
        }
        if let Some(value) = env_parse::<usize>("MIN_SUSPECT_NODES_THRESHOLD")? {
            config.min_suspect_nodes_threshold = value;
        }
        if let Some(value) = env_parse::<u32>("MAX_SUSPECT_MULTIPLIER")? {
            config.max_suspect_multiplier = value;
        }
        if let Some(value) = env_parse::<usize>("EXPECTED_NODES")? {
            config.expected_nodes = value;
        }
        if let Some(value) = env_duration("DISCOVERY_POLL_INTERVAL")? {
            config.discovery_poll_interval = value;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_secret.is_empty() {
            return Err("auth secret must not be empty".to_string());
        }

        if self.indirect_check_nodes == 0 {
            return Err("indirect_check_nodes must be at least 1".to_string());
        }

        if self.min_suspect_timeout_multiplier > self.max_suspect_timeout_multiplier {
            return Err(
                "min_suspect_timeout_multiplier exceeds max_suspect_timeout_multiplier".to_string(),
            );
        }

        if self.min_suspect_nodes_threshold == 0 {
            return Err("min_suspect_nodes_threshold must be at least 1".to_string());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid {name}: {err}")),
        Err(_) => Ok(None),
    }
}

fn env_duration(name: &str) -> anyhow::Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid {name}: {err}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SimurghConfig::with_secret("secret");
        assert_eq!(config.max_concurrency, 2048);
        assert_eq!(config.tcp_connect_retries, 3);
        assert_eq!(config.cleanup_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_secret_fails_validation() {
        let config = SimurghConfig::with_secret("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_durations() {
        let config: SimurghConfig = toml::from_str(
            r#"
            auth_secret = "secret"
            health_poll_interval = "250ms"
            cleanup_interval = "1m"
            "#,
        )
        .unwrap();

        assert_eq!(config.health_poll_interval, Duration::from_millis(250));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_multiplier_bounds_validated() {
        let mut config = SimurghConfig::with_secret("secret");
        config.min_suspect_timeout_multiplier = 50.0;
        assert!(config.validate().is_err());
    }
}
