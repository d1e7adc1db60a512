//! Configuration management for the Registration Service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use ingest_common::DEVICE_REGISTRATIONS_TOPIC;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which queue backend to run against. Decided once at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueBackendConfig {
    /// Remote broker (Redis)
    Broker {
        url: String,
        receive_wait: Duration,
    },
    /// JSON files under a local directory
    Local { dir: PathBuf },
}

/// Consumer retry and polling settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Downstream ingestion endpoint
    pub ingestion_endpoint: String,

    /// Timeout for one downstream call
    pub ingestion_timeout: Duration,

    /// Attempts per delivery
    pub max_retries: u32,

    /// Backoff base; attempt `n` waits `base * 2^n`
    pub retry_base_delay: Duration,

    pub poll_interval: Duration,

    /// Records stuck in `processing` longer than this are failed
    pub processing_lease: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ingestion_endpoint: "http://localhost:3001/api/ingestion/mock".to_string(),
            ingestion_timeout: Duration::from_millis(10_000),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1_000),
            poll_interval: Duration::from_millis(2_000),
            processing_lease: None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Root directory for local persistence
    pub data_dir: PathBuf,

    pub queue: QueueBackendConfig,

    /// Topic used by intake and consumer
    pub topic: String,

    pub consumer: ConsumerConfig,

    /// Run the consumer inside the API process
    pub consumer_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let data_dir: PathBuf = env::var("DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let queue = match env::var("QUEUE_BROKER_URL").ok().filter(|s| !s.is_empty()) {
            Some(url) => QueueBackendConfig::Broker {
                url,
                receive_wait: Duration::from_millis(parse_var("BROKER_RECEIVE_WAIT_MS", 5_000)?),
            },
            None => QueueBackendConfig::Local {
                dir: data_dir.join("queue"),
            },
        };

        let defaults = ConsumerConfig::default();
        let consumer = ConsumerConfig {
            ingestion_endpoint: env::var("INGESTION_ENDPOINT")
                .unwrap_or(defaults.ingestion_endpoint),
            ingestion_timeout: Duration::from_millis(parse_var("INGESTION_TIMEOUT_MS", 10_000)?),
            max_retries: parse_var("MAX_RETRIES", 3)?,
            retry_base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 1_000)?),
            poll_interval: Duration::from_millis(parse_var("POLL_INTERVAL_MS", 2_000)?),
            processing_lease: env::var("PROCESSING_LEASE_SECS")
                .ok()
                .map(|v| v.parse::<u64>().context("Invalid PROCESSING_LEASE_SECS"))
                .transpose()?
                .map(Duration::from_secs),
        };

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parse_var("API_PORT", 3001)?,
            data_dir,
            queue,
            topic: env::var("QUEUE_TOPIC")
                .unwrap_or_else(|_| DEVICE_REGISTRATIONS_TOPIC.to_string()),
            consumer,
            consumer_enabled: parse_var("CONSUMER_ENABLED", true)?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.consumer.max_retries == 0 {
            anyhow::bail!("MAX_RETRIES must be greater than 0");
        }

        if self.consumer.poll_interval.is_zero() {
            anyhow::bail!("POLL_INTERVAL_MS must be greater than 0");
        }

        if self.topic.is_empty() {
            anyhow::bail!("QUEUE_TOPIC must not be empty");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Directory holding one JSON file per device
    pub fn devices_dir(&self) -> PathBuf {
        self.data_dir.join("devices")
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Invalid {}: {}", name, raw)),
        Err(_) => Ok(default),
    }
}
