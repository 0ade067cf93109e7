//! Service configuration.
//!
//! Layered, later sources winning:
//! 1. Defaults in code
//! 2. `config/{environment}.toml` (optional)
//! 3. Environment variables with the `STOCKLEDGER__` prefix, e.g.
//!    `STOCKLEDGER__DATABASE__URL` or `STOCKLEDGER__ALERTS__INTERVAL=30000`

use config::{ConfigError, Environment, File};
use serde::Deserialize;

use stockledger_observability::LogSettings;

use crate::retry::RetryPolicy;
use crate::workers::PeriodicRunner;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// development, production, ...
    pub environment: String,
    pub log: LogSettings,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    /// Version-conflict retry of the transaction applier.
    pub retry: RetryPolicy,
    /// Backoff for bus consumers whose handler failed.
    pub consumer_retry: RetryPolicy,
    /// Reorder alert scan schedule.
    pub alerts: PeriodicRunner,
    pub outbox: OutboxSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL URL; in-memory stores are used when absent.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Only used with the `redis` feature.
    pub url: Option<String>,
    pub stream: String,
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub relay: PeriodicRunner,
}

pub const ENV_PREFIX: &str = "STOCKLEDGER";

impl Settings {
    /// Load from files and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("STOCKLEDGER__ENVIRONMENT").unwrap_or_else(|_| "development".into());
        Self::builder(&environment)?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Code defaults only.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::builder("development")?.build()?.try_deserialize()
    }

    fn builder(
        environment: &str,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("environment", environment)?
            .set_default("log.level", "info")?
            .set_default("log.format", "json")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("redis.stream", "stockledger:events")?
            .set_default("redis.group", "stockledger")?
            .set_default("retry.max_attempts", 5)?
            .set_default("retry.base_delay", 10)?
            .set_default("retry.max_delay", 500)?
            .set_default("retry.strategy", "exponential")?
            .set_default("consumer_retry.max_attempts", 5)?
            .set_default("consumer_retry.base_delay", 100)?
            .set_default("consumer_retry.max_delay", 2_000)?
            .set_default("consumer_retry.strategy", "exponential")?
            .set_default("alerts.interval", 60_000)?
            .set_default("alerts.max_retries", 5)?
            .set_default("alerts.base_backoff", 250)?
            .set_default("outbox.batch_size", 100)?
            .set_default("outbox.relay.interval", 1_000)?
            .set_default("outbox.relay.max_retries", 10)?
            .set_default("outbox.relay.base_backoff", 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stockledger_observability::LogFormat;

    #[test]
    fn defaults_deserialize() {
        let s = Settings::defaults().unwrap();
        assert_eq!(s.server.bind_address(), "0.0.0.0:8080");
        assert_eq!(s.log.format, LogFormat::Json);
        assert!(s.database.url.is_none());
        assert_eq!(s.retry, RetryPolicy::default());
        assert_eq!(s.consumer_retry.max_attempts, 5);
        assert_eq!(s.consumer_retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(s.alerts.interval, Duration::from_secs(60));
        assert_eq!(s.outbox.relay.base_backoff, Duration::from_millis(100));
        assert_eq!(s.outbox.batch_size, 100);
    }
}
