//! Configuration for the missive queue service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use missive_queue::{
    client::ClientConfig, BackoffStrategy, PacingSchedule, QueueConfig, RetryPolicy,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Sender API
    /// Base URL of the external sender API.
    ///
    /// Environment variable: `EXTERNAL_API_URL`
    #[serde(default = "default_external_api_url", alias = "EXTERNAL_API_URL")]
    pub external_api_url: String,
    /// API key sent as `X-API-Key`.
    ///
    /// Environment variable: `EXTERNAL_API_KEY`
    #[serde(default, alias = "EXTERNAL_API_KEY")]
    pub external_api_key: String,
    /// Request timeout for one delivery in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,

    // Delivery worker
    /// Seconds between delivery cycles.
    ///
    /// Environment variable: `DELIVERY_POLL_INTERVAL_SECONDS`
    #[serde(default = "default_delivery_poll_interval", alias = "DELIVERY_POLL_INTERVAL_SECONDS")]
    pub delivery_poll_interval_seconds: u64,
    /// Messages claimed per delivery cycle.
    ///
    /// Environment variable: `DELIVERY_BATCH_SIZE`
    #[serde(default = "default_delivery_batch_size", alias = "DELIVERY_BATCH_SIZE")]
    pub delivery_batch_size: usize,

    // Bulk expander
    /// Seconds between expander ticks.
    ///
    /// Environment variable: `BULK_POLL_INTERVAL_SECONDS`
    #[serde(default = "default_bulk_poll_interval", alias = "BULK_POLL_INTERVAL_SECONDS")]
    pub bulk_poll_interval_seconds: u64,
    /// Envelopes expanded concurrently.
    ///
    /// Environment variable: `BULK_BATCH_SIZE`
    #[serde(default = "default_bulk_batch_size", alias = "BULK_BATCH_SIZE")]
    pub bulk_batch_size: usize,
    /// Recipient count per minute above which the pacing window grows.
    ///
    /// Environment variable: `PACING_MAX_RATE_PER_MINUTE`
    #[serde(default = "default_max_rate", alias = "PACING_MAX_RATE_PER_MINUTE")]
    pub pacing_max_rate_per_minute: u32,
    /// Smallest pacing window in seconds.
    ///
    /// Environment variable: `PACING_MIN_WINDOW_SECONDS`
    #[serde(default = "default_min_window", alias = "PACING_MIN_WINDOW_SECONDS")]
    pub pacing_min_window_seconds: u64,
    /// Fixed seed for pacing jitter.
    ///
    /// Environment variable: `PACING_SEED`
    #[serde(default, alias = "PACING_SEED")]
    pub pacing_seed: Option<u64>,

    // Leases
    /// Seconds after which a claim is considered abandoned.
    ///
    /// Environment variable: `LEASE_TIMEOUT_SECONDS`
    #[serde(default = "default_lease_timeout", alias = "LEASE_TIMEOUT_SECONDS")]
    pub lease_timeout_seconds: u64,
    /// Seconds between lease reaper passes.
    ///
    /// Environment variable: `REAP_INTERVAL_SECONDS`
    #[serde(default = "default_reap_interval", alias = "REAP_INTERVAL_SECONDS")]
    pub reap_interval_seconds: u64,

    // Retry
    /// Delivery attempts per message; 1 disables retries.
    ///
    /// Environment variable: `MAX_DELIVERY_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Lifecycle
    /// Seconds to wait for the loops to stop on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
    /// Log output format, `text` or `json`.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[serde(default, alias = "LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Config {
    /// Loads and validates configuration from all sources.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Layered providers: defaults, then `config.toml`, then the environment.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Builds the engine configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            delivery_batch_size: self.delivery_batch_size,
            delivery_poll_interval: Duration::from_secs(self.delivery_poll_interval_seconds),
            bulk_batch_size: self.bulk_batch_size,
            bulk_poll_interval: Duration::from_secs(self.bulk_poll_interval_seconds),
            pacing: PacingSchedule {
                max_rate_per_minute: self.pacing_max_rate_per_minute,
                min_window: Duration::from_secs(self.pacing_min_window_seconds),
            },
            pacing_seed: self.pacing_seed,
            lease_timeout: Duration::from_secs(self.lease_timeout_seconds),
            reap_interval: Duration::from_secs(self.reap_interval_seconds),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Builds the sender API client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.external_api_url.clone(),
            api_key: self.external_api_key.clone(),
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Builds the retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if !self.database_url[colon_pos + 1..at_pos].contains('/') {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.delivery_batch_size == 0 {
            anyhow::bail!("delivery_batch_size must be greater than 0");
        }

        if self.bulk_batch_size == 0 {
            anyhow::bail!("bulk_batch_size must be greater than 0");
        }

        for (name, value) in [
            ("delivery_poll_interval_seconds", self.delivery_poll_interval_seconds),
            ("bulk_poll_interval_seconds", self.bulk_poll_interval_seconds),
            ("lease_timeout_seconds", self.lease_timeout_seconds),
            ("reap_interval_seconds", self.reap_interval_seconds),
            ("delivery_timeout_seconds", self.delivery_timeout_seconds),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }

        if self.pacing_max_rate_per_minute == 0 {
            anyhow::bail!("pacing_max_rate_per_minute must be greater than 0");
        }

        if self.max_delivery_attempts == 0 {
            anyhow::bail!("max_delivery_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        reqwest::Url::parse(&self.external_api_url)
            .with_context(|| format!("external_api_url '{}' is not a valid URL", self.external_api_url))?;

        self.to_queue_config().validate().context("invalid queue configuration")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            external_api_url: default_external_api_url(),
            external_api_key: String::new(),
            delivery_timeout_seconds: default_delivery_timeout(),
            delivery_poll_interval_seconds: default_delivery_poll_interval(),
            delivery_batch_size: default_delivery_batch_size(),
            bulk_poll_interval_seconds: default_bulk_poll_interval(),
            bulk_batch_size: default_bulk_batch_size(),
            pacing_max_rate_per_minute: default_max_rate(),
            pacing_min_window_seconds: default_min_window(),
            pacing_seed: None,
            lease_timeout_seconds: default_lease_timeout(),
            reap_interval_seconds: default_reap_interval(),
            max_delivery_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/missive".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_external_api_url() -> String {
    "https://wag.artakusuma.com/api/clients".to_string()
}

fn default_delivery_timeout() -> u64 {
    missive_queue::DEFAULT_TIMEOUT_SECONDS
}

fn default_delivery_poll_interval() -> u64 {
    5
}

fn default_delivery_batch_size() -> usize {
    missive_queue::DEFAULT_DELIVERY_BATCH_SIZE
}

fn default_bulk_poll_interval() -> u64 {
    10
}

fn default_bulk_batch_size() -> usize {
    missive_queue::DEFAULT_BULK_BATCH_SIZE
}

fn default_max_rate() -> u32 {
    100
}

fn default_min_window() -> u64 {
    30
}

fn default_lease_timeout() -> u64 {
    600
}

fn default_reap_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,missive=debug".to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    fn extract() -> figment::error::Result<Config> {
        Config::figment().extract()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let queue = config.to_queue_config();
        assert_eq!(queue.delivery_batch_size, 10);
        assert_eq!(queue.bulk_batch_size, 5);
        assert_eq!(queue.delivery_poll_interval, Duration::from_secs(5));
        assert_eq!(queue.bulk_poll_interval, Duration::from_secs(10));
        assert_eq!(queue.pacing, PacingSchedule::default());
        assert_eq!(queue.retry_policy.max_attempts, 1);
        assert_eq!(queue.client_config.base_url, "https://wag.artakusuma.com/api/clients");
    }

    #[test]
    fn environment_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("DATABASE_URL", "postgresql://queue:secret@db:5432/missive");
            jail.set_env("EXTERNAL_API_URL", "http://gateway.internal/api/clients");
            jail.set_env("EXTERNAL_API_KEY", "k-123");
            jail.set_env("DELIVERY_BATCH_SIZE", "15");
            jail.set_env("BULK_POLL_INTERVAL_SECONDS", "3");
            jail.set_env("PACING_SEED", "99");
            jail.set_env("LOG_FORMAT", "json");

            let config = extract()?;
            assert!(config.validate().is_ok());
            assert_eq!(config.delivery_batch_size, 15);
            assert_eq!(config.bulk_poll_interval_seconds, 3);
            assert_eq!(config.pacing_seed, Some(99));
            assert_eq!(config.log_format, LogFormat::Json);

            let client = config.to_client_config();
            assert_eq!(client.base_url, "http://gateway.internal/api/clients");
            assert_eq!(client.api_key, "k-123");
            Ok(())
        });
    }

    #[test]
    fn file_is_overridden_by_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                delivery_batch_size = 50
                lease_timeout_seconds = 900
                "#,
            )?;
            jail.set_env("DELIVERY_BATCH_SIZE", "7");

            let config = extract()?;
            assert_eq!(config.delivery_batch_size, 7);
            assert_eq!(config.lease_timeout_seconds, 900);
            Ok(())
        });
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = Config { bulk_batch_size: 0, ..Config::default() };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("bulk_batch_size"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config { reap_interval_seconds: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_shorter_than_a_batch_of_timeouts_is_rejected() {
        let config = Config {
            delivery_batch_size: 20,
            delivery_timeout_seconds: 30,
            lease_timeout_seconds: 600,
            ..Config::default()
        };
        let error = config.validate().unwrap_err();
        assert!(format!("{error:#}").contains("lease_timeout"));
    }

    #[test]
    fn invalid_api_url_is_rejected() {
        let config = Config { external_api_url: "not a url".to_string(), ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn jitter_outside_unit_range_is_rejected() {
        let config = Config { retry_jitter_factor: 1.5, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn database_password_is_masked() {
        let config = Config {
            database_url: "postgresql://queue:hunter2@db:5432/missive".to_string(),
            ..Config::default()
        };
        assert_eq!(config.database_url_masked(), "postgresql://queue:***@db:5432/missive");

        let config = Config {
            database_url: "postgresql://db:5432/missive".to_string(),
            ..Config::default()
        };
        assert_eq!(config.database_url_masked(), "postgresql://db:5432/missive");

        let config = Config {
            database_url: "postgresql://queue@db:5432/missive".to_string(),
            ..Config::default()
        };
        assert_eq!(config.database_url_masked(), "postgresql://queue@db:5432/missive");
    }
}
