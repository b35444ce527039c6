//! Config module contains the top-level config for the app.
use std::env;
use std::time::Duration;

use config_crate::{Config as RawConfig, ConfigError, Environment, File};

use sentry_integration::SentryConfig;

/// Basic settings - connection strings, thread counts
#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    pub database: String,
    pub thread_count: usize,
    pub db_pool_size: u32,
}

/// Redis holding the coupon stock mirror
#[derive(Debug, Deserialize, Clone)]
pub struct Redis {
    pub url: String,
    pub pool_size: u32,
    pub connection_timeout_ms: u64,
}

impl Redis {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Distributed lock settings
#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Independent redis instances taking part in the quorum.
    /// Empty list means the stock mirror redis is the only instance.
    #[serde(default)]
    pub instances: Vec<String>,
    /// Redis used for release notifications, first instance by default
    pub notify_url: Option<String>,
    pub ttl_ms: u64,
    pub total_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub wait_slice_ms: u64,
    pub drift_factor: f64,
    pub auto_extend: bool,
    pub channel_prefix: String,
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }
}

/// Stock mirror settings
#[derive(Debug, Deserialize, Clone)]
pub struct StockConfig {
    pub key_prefix: String,
    /// Extra lifetime of the mirror after the coupon stops being valid
    pub grace_period_s: u64,
    pub max_ttl_s: u64,
    /// Period of the full reconciliation, disabled when absent
    pub resync_interval_s: Option<u64>,
}

impl StockConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_s)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_s)
    }

    pub fn lock_key(&self, coupon_id: i32) -> String {
        format!("{}:lock:{}", self.key_prefix, coupon_id)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Shutdown {
    pub drain_timeout_ms: u64,
}

/// Global app config
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: Server,
    pub redis: Redis,
    pub lock: LockConfig,
    pub stock: StockConfig,
    pub shutdown: Shutdown,
    pub sentry: Option<SentryConfig>,
}

impl Config {
    /// Creates config from base.toml, which are overwritten by <env>.toml, where env is taken
    /// from RUN_MODE. After that it could be overwritten by env variables with the STQ_COUPONS prefix
    pub fn new() -> Result<Self, ConfigError> {
        // Optional file specific for environment
        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        Config::with_env(env)
    }

    pub fn with_env(env: impl Into<String>) -> Result<Self, ConfigError> {
        let mut s = RawConfig::new();

        s.merge(File::with_name("config/base"))?;
        s.merge(File::with_name(&format!("config/{}", env.into())).required(false))?;
        s.merge(Environment::with_prefix("STQ_COUPONS"))?;
        s.try_into()
    }

    /// Redis urls of the lock quorum
    pub fn lock_instances(&self) -> Vec<String> {
        if self.lock.instances.is_empty() {
            vec![self.redis.url.clone()]
        } else {
            self.lock.instances.clone()
        }
    }

    pub fn lock_notify_url(&self) -> String {
        self.lock
            .notify_url
            .clone()
            .unwrap_or_else(|| self.lock_instances()[0].clone())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.drain_timeout_ms)
    }
}
