use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StratumError};

/// One configured mining pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEndpoint {
    /// Pool name for identification
    pub name: String,

    /// Pool URL (stratum+tcp://host:port, stratum+ssl://host:port or host:port)
    pub url: String,

    /// Priority (lower = preferred)
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Worker password (often just 'x' for most pools)
    #[serde(default = "default_password")]
    pub password: String,

    /// Force TLS on or off; derived from the URL scheme when unset
    #[serde(default)]
    pub tls: Option<bool>,

    /// Enable this pool
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Host, port and transport of an endpoint after URL parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority,
            password: default_password(),
            tls: None,
            enabled: true,
        }
    }

    /// Parse URL to extract host, port and TLS flag
    pub fn parse_url(&self) -> Result<EndpointAddress> {
        let (rest, scheme_tls) = if let Some(rest) = self.url.strip_prefix("stratum+tcp://") {
            (rest, false)
        } else if let Some(rest) = self
            .url
            .strip_prefix("stratum+ssl://")
            .or_else(|| self.url.strip_prefix("stratum+tls://"))
        {
            (rest, true)
        } else if let Some(rest) = self
            .url
            .strip_prefix("stratum://")
            .or_else(|| self.url.strip_prefix("tcp://"))
        {
            (rest, false)
        } else {
            (self.url.as_str(), false)
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            StratumError::InvalidConfiguration(format!("Invalid pool URL format: {}", self.url))
        })?;

        if host.is_empty() {
            return Err(StratumError::InvalidConfiguration(format!(
                "Missing host in URL: {}",
                self.url
            )));
        }

        let port = port.parse::<u16>().map_err(|_| {
            StratumError::InvalidConfiguration(format!("Invalid port in URL: {}", self.url))
        })?;

        Ok(EndpointAddress {
            host: host.to_string(),
            port,
            tls: self.tls.unwrap_or(scheme_tls),
        })
    }
}

/// Circuit breaker thresholds, one breaker per endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker keeps its endpoint out of selection
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Reconnection backoff between failed connection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay (milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_ms: u64,

    /// Upper bound on the retry delay (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,

    /// Growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the delay (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_backoff_ms(),
            max_ms: default_max_backoff_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

/// Stratum client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumConfig {
    /// Priority-ordered list of mining pools
    pub pools: Vec<PoolEndpoint>,

    /// User agent string sent with mining.subscribe
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// TCP/TLS connect timeout
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Timeout for subscribe/authorize responses
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// Time after which an unanswered submit is TIMED_OUT
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    /// No mining.notify for this long marks the session DEGRADED
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,

    /// How long a degraded session may wait for traffic when no alternative endpoint exists
    #[serde(default = "default_self_heal_grace_secs")]
    pub self_heal_grace_secs: u64,

    /// Deadline for a replacement session to reach AUTHORIZED
    #[serde(default = "default_failover_timeout_secs")]
    pub failover_timeout_secs: u64,

    /// How long a closing session waits for in-flight submit responses
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Difficulty to suggest once after authorization
    #[serde(default)]
    pub suggest_difficulty: Option<f64>,

    /// Delay between AUTHORIZED and the difficulty suggestion
    #[serde(default = "default_suggest_warmup_secs")]
    pub suggest_warmup_secs: u64,

    /// Jobs kept valid per session when pools do not send clean_jobs
    #[serde(default = "default_max_tracked_jobs")]
    pub max_tracked_jobs: usize,

    /// Longest accepted line from the pool (bytes)
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// CA bundle used to verify TLS endpoints
    #[serde(default = "default_tls_ca_file")]
    pub tls_ca_file: PathBuf,

    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Reconnection backoff settings
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            user_agent: default_user_agent(),
            connection_timeout_secs: default_connection_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            submit_timeout_secs: default_submit_timeout_secs(),
            silence_timeout_secs: default_silence_timeout_secs(),
            self_heal_grace_secs: default_self_heal_grace_secs(),
            failover_timeout_secs: default_failover_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            suggest_difficulty: None,
            suggest_warmup_secs: default_suggest_warmup_secs(),
            max_tracked_jobs: default_max_tracked_jobs(),
            max_line_length: default_max_line_length(),
            tls_ca_file: default_tls_ca_file(),
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl StratumConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn self_heal_grace(&self) -> Duration {
        Duration::from_secs(self.self_heal_grace_secs)
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_secs(self.failover_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn suggest_warmup(&self) -> Duration {
        Duration::from_secs(self.suggest_warmup_secs)
    }

    /// Enabled endpoints sorted by priority; ties keep file order.
    pub fn ordered_endpoints(&self) -> Vec<PoolEndpoint> {
        let mut pools: Vec<PoolEndpoint> =
            self.pools.iter().filter(|p| p.enabled).cloned().collect();
        pools.sort_by_key(|p| p.priority);
        pools
    }

    /// Check the configuration before any session is opened.
    pub fn validate(&self) -> Result<()> {
        if self.ordered_endpoints().is_empty() {
            return Err(StratumError::NoPoolsConfigured);
        }

        let mut names = HashSet::new();
        for pool in &self.pools {
            if !names.insert(pool.name.as_str()) {
                return Err(StratumError::InvalidConfiguration(format!(
                    "Duplicate pool name: {}",
                    pool.name
                )));
            }
            pool.parse_url()?;
        }

        if self.breaker.failure_threshold == 0 {
            return Err(StratumError::InvalidConfiguration(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.silence_timeout_secs == 0 || self.submit_timeout_secs == 0 {
            return Err(StratumError::InvalidConfiguration(
                "silence and submit timeouts must be non-zero".to_string(),
            ));
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(StratumError::InvalidConfiguration(
                "backoff.max_ms must be >= backoff.initial_ms > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) || self.backoff.multiplier < 1.0 {
            return Err(StratumError::InvalidConfiguration(
                "backoff.jitter must be in [0, 1] and backoff.multiplier >= 1".to_string(),
            ));
        }
        if let Some(diff) = self.suggest_difficulty {
            if !(diff.is_finite() && diff > 0.0) {
                return Err(StratumError::InvalidConfiguration(format!(
                    "suggest_difficulty must be positive, got {}",
                    diff
                )));
            }
        }
        if self.max_tracked_jobs == 0 {
            return Err(StratumError::InvalidConfiguration(
                "max_tracked_jobs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

// Default value functions for serde
fn default_priority() -> u32 { 0 }
fn default_password() -> String { "x".to_string() }
fn default_enabled() -> bool { true }
fn default_failure_threshold() -> u32 { 5 }
fn default_cooldown_secs() -> u64 { 60 }
fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 60000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_backoff_jitter() -> f64 { 0.5 }
fn default_connection_timeout_secs() -> u64 { 30 }
fn default_response_timeout_secs() -> u64 { 10 }
fn default_submit_timeout_secs() -> u64 { 30 }
fn default_silence_timeout_secs() -> u64 { 90 }
fn default_self_heal_grace_secs() -> u64 { 30 }
fn default_failover_timeout_secs() -> u64 { 60 }
fn default_drain_timeout_secs() -> u64 { 10 }
fn default_suggest_warmup_secs() -> u64 { 5 }
fn default_max_tracked_jobs() -> usize { 16 }
fn default_max_line_length() -> usize { 64 * 1024 }
fn default_tls_ca_file() -> PathBuf { PathBuf::from("/etc/ssl/certs/ca-certificates.crt") }
fn default_user_agent() -> String {
    format!("minewarden/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_url_parsing() {
        let pool = PoolEndpoint::new("primary", "stratum+tcp://pool.example.com:3333", 0);
        let addr = pool.parse_url().unwrap();
        assert_eq!(addr.host, "pool.example.com");
        assert_eq!(addr.port, 3333);
        assert!(!addr.tls);

        let pool = PoolEndpoint::new("secure", "stratum+ssl://pool.example.com:443", 1);
        assert!(pool.parse_url().unwrap().tls);

        let mut pool = PoolEndpoint::new("forced", "pool.example.com:4444", 2);
        pool.tls = Some(true);
        let addr = pool.parse_url().unwrap();
        assert!(addr.tls);
        assert_eq!(addr.port, 4444);

        assert!(PoolEndpoint::new("bad", "stratum+tcp://pool", 0).parse_url().is_err());
        assert!(PoolEndpoint::new("bad", "stratum+tcp://pool:99999", 0).parse_url().is_err());
    }

    #[test]
    fn test_ordered_endpoints_skip_disabled() {
        let mut disabled = PoolEndpoint::new("c", "c.example.com:3333", 0);
        disabled.enabled = false;
        let config = StratumConfig {
            pools: vec![
                PoolEndpoint::new("b", "b.example.com:3333", 2),
                PoolEndpoint::new("a", "a.example.com:3333", 1),
                disabled,
            ],
            ..Default::default()
        };

        let names: Vec<_> = config.ordered_endpoints().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            StratumConfig::default().validate(),
            Err(StratumError::NoPoolsConfigured)
        ));

        let mut config = StratumConfig {
            pools: vec![
                PoolEndpoint::new("a", "a.example.com:3333", 0),
                PoolEndpoint::new("a", "b.example.com:3333", 1),
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.pools[1].name = "b".to_string();
        assert!(config.validate().is_ok());

        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: StratumConfig = serde_json::from_str(
            r#"{"pools":[{"name":"p","url":"stratum+tcp://p.example.com:3333"}]}"#,
        )
        .unwrap();

        assert_eq!(config.silence_timeout(), Duration::from_secs(90));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(60));
        assert_eq!(config.pools[0].password, "x");
        assert!(config.validate().is_ok());
    }
}
