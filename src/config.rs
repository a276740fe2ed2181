use serde::Deserialize;
use crate::error::{Result, AppError};
use std::time::Duration;
use config::{Config as ConfigLoader, File, Environment};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_REFILL_INTERVAL_MS: i64 = 100;
const DEFAULT_BUCKET_SIZE: i64 = 10;
const DEFAULT_STATS_INTERVAL_SECS: i64 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // General
    pub log_level: String,

    // Listener
    pub listen_addr: String,
    /// Admitted connections are forwarded here; echoed back when unset.
    #[serde(default)]
    pub upstream_addr: Option<String>,

    // Throttle
    pub refill_interval_ms: u64,
    pub bucket_size: u32,

    // Diagnostics
    pub stats_interval_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let loader = ConfigLoader::builder()
            .set_default("log_level", "info")?
            .set_default("listen_addr", DEFAULT_LISTEN_ADDR)?
            .set_default("refill_interval_ms", DEFAULT_REFILL_INTERVAL_MS)?
            .set_default("bucket_size", DEFAULT_BUCKET_SIZE)?
            .set_default("stats_interval_secs", DEFAULT_STATS_INTERVAL_SECS)?
            .add_source(File::with_name("throttle").required(false))
            .add_source(Environment::with_prefix("THROTTLE").try_parsing(true))
            .build()?;

        let config: Config = loader.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the limiter cannot run with, before anything is bound.
    pub fn validate(&self) -> Result<()> {
        if self.refill_interval_ms == 0 {
            return Err(AppError::InvalidConfig(
                "refill_interval_ms must be greater than zero".into(),
            ));
        }
        if self.bucket_size == 0 {
            return Err(AppError::InvalidConfig(
                "bucket_size must be at least 1".into(),
            ));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(AppError::InvalidConfig("listen_addr is empty".into()));
        }
        Ok(())
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        match self.stats_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
