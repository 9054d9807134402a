//! Environment-driven configuration

use anyhow::{anyhow, bail, Context};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::executor::RetryPolicy;
use crate::facade::TtlPolicy;
use crate::health::HealthCalculator;
use crate::models::Provider;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub nerdgraph_url: String,
    pub nerdgraph_api_key: Option<String>,
    pub account_id: u64,
    pub provider: Provider,
    pub cache_capacity: usize,
    pub topology_ttl: Duration,
    pub metrics_ttl: Duration,
    pub batch_window: Duration,
    pub batch_max_size: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub attempt_timeout: Duration,
    pub cache_sweep_interval: Duration,
    pub health_policy_path: Option<PathBuf>,
    /// Serve from the built-in demo data instead of NerdGraph
    pub fixture_mode: bool,
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} '{}': {}", name, raw, e)),
        None => Ok(default),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<bool> {
    match lookup(name).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => bail!("Invalid {} '{}': expected true or false", name, other),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let secs = |name: &str, default: u64| parsed(&lookup, name, default).map(Duration::from_secs);
        let millis =
            |name: &str, default: u64| parsed(&lookup, name, default).map(Duration::from_millis);

        let config = Self {
            listen_addr: parsed(&lookup, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            nerdgraph_url: lookup("NERDGRAPH_URL")
                .unwrap_or_else(|| "https://api.newrelic.com/graphql".to_string()),
            nerdgraph_api_key: lookup("NERDGRAPH_API_KEY").filter(|k| !k.is_empty()),
            account_id: parsed(&lookup, "ACCOUNT_ID", 0)?,
            provider: parsed(&lookup, "KAFKA_PROVIDER", Provider::AwsMsk)?,
            cache_capacity: parsed(&lookup, "CACHE_CAPACITY", crate::cache::DEFAULT_CAPACITY)?,
            topology_ttl: secs("TOPOLOGY_TTL_SECS", 300)?,
            metrics_ttl: secs("METRICS_TTL_SECS", 30)?,
            batch_window: millis("BATCH_WINDOW_MS", 25)?,
            batch_max_size: parsed(&lookup, "BATCH_MAX_SIZE", 20)?,
            retry_max_attempts: parsed(&lookup, "RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay: millis("RETRY_BASE_DELAY_MS", 200)?,
            retry_max_delay: millis("RETRY_MAX_DELAY_MS", 5000)?,
            attempt_timeout: millis("ATTEMPT_TIMEOUT_MS", 10_000)?,
            cache_sweep_interval: secs("CACHE_SWEEP_INTERVAL_SECS", 60)?,
            health_policy_path: lookup("HEALTH_POLICY_PATH").map(PathBuf::from),
            fixture_mode: flag(&lookup, "FIXTURE_MODE")?,
        };

        if !config.fixture_mode {
            if config.nerdgraph_api_key.is_none() {
                bail!("NERDGRAPH_API_KEY is required unless FIXTURE_MODE=true");
            }
            if config.account_id == 0 {
                bail!("ACCOUNT_ID is required unless FIXTURE_MODE=true");
            }
        }
        if config.cache_capacity == 0 {
            bail!("CACHE_CAPACITY must be at least 1");
        }
        if config.batch_max_size == 0 {
            bail!("BATCH_MAX_SIZE must be at least 1");
        }
        if config.cache_sweep_interval.is_zero() {
            bail!("CACHE_SWEEP_INTERVAL_SECS must be positive");
        }

        Ok(config)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            window: self.batch_window,
            max_batch_size: self.batch_max_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            attempt_timeout: self.attempt_timeout,
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            topology: self.topology_ttl,
            metrics: self.metrics_ttl,
        }
    }

    /// Default health policies, overridden by `HEALTH_POLICY_PATH` if set.
    pub fn health_calculator(&self) -> anyhow::Result<HealthCalculator> {
        let Some(path) = &self.health_policy_path else {
            return Ok(HealthCalculator::new());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read health policy {}", path.display()))?;
        HealthCalculator::from_json(&json)
            .with_context(|| format!("Invalid health policy {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_in_fixture_mode() {
        let config = config(&[("FIXTURE_MODE", "true")]).unwrap();

        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.provider, Provider::AwsMsk);
        assert_eq!(config.cache_capacity, 500);
        assert_eq!(config.ttl_policy(), TtlPolicy::default());
        assert_eq!(config.batch_config(), BatchConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_credentials_required_outside_fixture_mode() {
        assert!(config(&[]).is_err());
        assert!(config(&[("NERDGRAPH_API_KEY", "NRAK-x")]).is_err());

        let config = config(&[("NERDGRAPH_API_KEY", "NRAK-x"), ("ACCOUNT_ID", "42")]).unwrap();
        assert_eq!(config.account_id, 42);
        assert!(!config.fixture_mode);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = config(&[("FIXTURE_MODE", "true"), ("CACHE_CAPACITY", "lots")]).unwrap_err();
        assert!(err.to_string().contains("CACHE_CAPACITY"));

        assert!(config(&[("FIXTURE_MODE", "maybe")]).is_err());
        assert!(config(&[("FIXTURE_MODE", "true"), ("KAFKA_PROVIDER", "kinesis")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("FIXTURE_MODE", "1"),
            ("KAFKA_PROVIDER", "confluent_cloud"),
            ("METRICS_TTL_SECS", "10"),
            ("BATCH_WINDOW_MS", "5"),
        ])
        .unwrap();

        assert_eq!(config.provider, Provider::ConfluentCloud);
        assert_eq!(config.metrics_ttl, Duration::from_secs(10));
        assert_eq!(config.batch_window, Duration::from_millis(5));
    }
}
