//! Environment-variable configuration loader.
//!
//! Adapted from `services/forwarder/src/config.rs`'s raw-then-validated
//! shape, but sourced from environment variables instead of a TOML file —
//! that's this system's documented configuration contract.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub edge_name: String,
    pub site_id: String,
    pub site_name: String,
    pub registration_token: String,

    pub tcp_host: String,
    pub tcp_port: u16,

    pub db_path: PathBuf,

    pub cloud_api_url: String,

    pub session_poll_interval: Duration,
    pub event_send_timeout: Duration,
    pub rest_max_retries: u32,
    pub rest_retry_delay: Duration,
    pub rest_backoff_multiplier: u32,
    pub rest_max_retry_delay: Duration,
    pub cloud_batch_size: usize,
    pub batch_interval: Duration,

    pub heartbeat_timeout: Duration,
    pub activity_idle: Duration,
    pub activity_stale: Duration,

    pub session_cache_expiry: Duration,

    pub offline_trigger_delay: Duration,
    pub offline_max_events_per_batch: usize,
    pub offline_batch_retention_days: u32,

    pub work_hours_start: Option<String>,
    pub work_hours_end: Option<String>,
    pub timezone: Option<String>,
}

impl GatewayConfig {
    /// Load configuration from the process environment, applying the
    /// documented defaults for every optional variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            edge_name: required("EDGE_NAME")?,
            site_id: required("SITE_ID")?,
            site_name: required("SITE_NAME")?,
            registration_token: required("REGISTRATION_TOKEN")?,

            tcp_host: string_or("TCP_HOST", "0.0.0.0"),
            tcp_port: u16_or("TCP_PORT", 8899)?,

            db_path: PathBuf::from(string_or("DB_PATH", "data/edge.sqlite3")),

            cloud_api_url: required("CLOUD_API_URL")?,

            session_poll_interval: millis_or("SESSION_POLL_INTERVAL_MS", 5_000)?,
            event_send_timeout: millis_or("EVENT_SEND_TIMEOUT_MS", 10_000)?,
            rest_max_retries: u32_or("REST_MAX_RETRIES", 3)?,
            rest_retry_delay: millis_or("REST_RETRY_DELAY_MS", 1_000)?,
            rest_backoff_multiplier: u32_or("REST_BACKOFF_MULTIPLIER", 2)?,
            rest_max_retry_delay: millis_or("REST_MAX_RETRY_DELAY_MS", 30_000)?,
            cloud_batch_size: usize_or("CLOUD_BATCH_SIZE", 50)?,
            batch_interval: millis_or("BATCH_INTERVAL_MS", 5_000)?,

            heartbeat_timeout: millis_or("HEARTBEAT_TIMEOUT_MS", 60_000)?,
            activity_idle: millis_or("ACTIVITY_IDLE_MS", 300_000)?,
            activity_stale: millis_or("ACTIVITY_STALE_MS", 1_800_000)?,

            session_cache_expiry: millis_or("SESSION_CACHE_EXPIRY_MS", 14_400_000)?,

            offline_trigger_delay: millis_or("OFFLINE_TRIGGER_DELAY_MS", 5_000)?,
            offline_max_events_per_batch: usize_or("OFFLINE_MAX_EVENTS_PER_BATCH", 1_000)?,
            offline_batch_retention_days: u32_or("OFFLINE_BATCH_RETENTION_DAYS", 30)?,

            work_hours_start: env::var("WORK_HOURS_START").ok(),
            work_hours_end: env::var("WORK_HOURS_END").ok(),
            timezone: env::var("TIMEZONE").ok(),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn string_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => v.parse::<T>().map_err(|_| ConfigError::Invalid {
            name,
            value: v,
            reason: "not a valid number".to_owned(),
        }),
    }
}

fn u16_or(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    parse_env(name, default)
}

fn u32_or(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    parse_env(name, default)
}

fn usize_or(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    parse_env(name, default)
}

fn millis_or(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_env(name, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation in tests must be serialized; std::env is process-global.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_required_vars() {
        env::set_var("EDGE_NAME", "edge-1");
        env::set_var("SITE_ID", "site-1");
        env::set_var("SITE_NAME", "Site One");
        env::set_var("REGISTRATION_TOKEN", "tok");
        env::set_var("CLOUD_API_URL", "https://cloud.example.com");
    }

    fn clear_vars() {
        for k in [
            "EDGE_NAME",
            "SITE_ID",
            "SITE_NAME",
            "REGISTRATION_TOKEN",
            "CLOUD_API_URL",
            "TCP_PORT",
        ] {
            env::remove_var(k);
        }
    }

    #[test]
    fn applies_documented_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        set_required_vars();
        let cfg = GatewayConfig::from_env().unwrap();
        assert_eq!(cfg.tcp_port, 8899);
        assert_eq!(cfg.tcp_host, "0.0.0.0");
        assert_eq!(cfg.cloud_batch_size, 50);
        assert_eq!(cfg.rest_max_retries, 3);
        clear_vars();
    }

    #[test]
    fn rejects_missing_required_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        let err = GatewayConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("EDGE_NAME")));
        clear_vars();
    }

    #[test]
    fn overrides_from_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        set_required_vars();
        env::set_var("TCP_PORT", "9100");
        let cfg = GatewayConfig::from_env().unwrap();
        assert_eq!(cfg.tcp_port, 9100);
        clear_vars();
    }
}
