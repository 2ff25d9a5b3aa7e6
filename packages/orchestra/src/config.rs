//! Worker configuration.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Configuration for a worker process.
///
/// Every enqueue default (`target`, `timeout`, `retries`) and every loop
/// parameter (`poll_interval`, `lock_timeout_buffer`, `max_in_flight`) comes
/// from here so embedders configure one thing.
#[derive(Debug, Clone)]
pub struct OrchestraConfig {
    /// This worker's identity; only rows with a matching `target` are leased.
    pub instance_key: String,
    /// Idle sleep between poll cycles (interruptible by the wake signal).
    pub poll_interval: Duration,
    /// Lease duration. Must comfortably exceed one heartbeat plus a store
    /// round trip, or an executing row can be re-leased mid-run.
    pub lock_timeout_buffer: Duration,
    /// Maximum concurrently executing commands inside this worker.
    pub max_in_flight: usize,
    /// Per-attempt timeout applied when an enqueued command has none.
    pub default_timeout: Duration,
    /// Retry budget applied when an enqueued command has none.
    pub default_retries: i32,
    /// Prefix for the commands table name.
    pub table_prefix: String,
}

impl Default for OrchestraConfig {
    fn default() -> Self {
        Self {
            instance_key: "default".to_string(),
            poll_interval: Duration::from_secs(5),
            lock_timeout_buffer: Duration::from_secs(10),
            max_in_flight: 100,
            default_timeout: Duration::from_secs(60),
            default_retries: 3,
            table_prefix: "ORCH_".to_string(),
        }
    }
}

impl OrchestraConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above. Reads `.env` if present (development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let defaults = Self::default();

        Ok(Self {
            instance_key: env::var("ORCHESTRA_INSTANCE_KEY").unwrap_or(defaults.instance_key),
            poll_interval: millis_var("ORCHESTRA_POLL_INTERVAL_MS", defaults.poll_interval)?,
            lock_timeout_buffer: millis_var(
                "ORCHESTRA_LOCK_TIMEOUT_BUFFER_MS",
                defaults.lock_timeout_buffer,
            )?,
            max_in_flight: parsed_var("ORCHESTRA_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            default_timeout: millis_var("ORCHESTRA_DEFAULT_TIMEOUT_MS", defaults.default_timeout)?,
            default_retries: parsed_var("ORCHESTRA_DEFAULT_RETRIES", defaults.default_retries)?,
            table_prefix: env::var("ORCHESTRA_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
        })
    }

    /// Create a config with a specific instance key, defaults elsewhere.
    pub fn with_instance_key(instance_key: impl Into<String>) -> Self {
        Self {
            instance_key: instance_key.into(),
            ..Default::default()
        }
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

fn millis_var(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(parsed_var(
        key,
        default.as_millis() as u64,
    )?))
}
