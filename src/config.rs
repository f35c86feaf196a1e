//! Server configuration from environment variables
//!
//! Every setting has a default. Values that fail to parse are logged and
//! replaced by the default instead of aborting start-up.

use crate::state::registry::DEFAULT_CODE_ATTEMPTS;
use crate::types::SessionLimits;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

const MIN_PING_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Connections silent for this long are closed
    pub idle_timeout: Duration,
    /// How often the gateway pings; pongs count as activity
    pub ping_interval: Duration,
    pub max_code_attempts: u32,
    pub limits: SessionLimits,
    /// Directory with the static client bundle, served as fallback
    pub static_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            max_code_attempts: DEFAULT_CODE_ATTEMPTS,
            limits: SessionLimits::default(),
            static_dir: None,
        }
    }
}

/// Read and parse one variable; unset or blank is `Ok(None)`
fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

fn var_or<T: FromStr>(key: &'static str, default: T) -> T {
    match parse_var(key) {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(e) => {
            tracing::warn!("{}, using default", e);
            default
        }
    }
}

impl ServerConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let limits = SessionLimits::default();

        let config = Self {
            addr: var_or("LIVEPOLL_ADDR", defaults.addr),
            idle_timeout: Duration::from_secs(var_or(
                "LIVEPOLL_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )),
            ping_interval: Duration::from_secs(var_or(
                "LIVEPOLL_PING_INTERVAL_SECS",
                DEFAULT_PING_INTERVAL_SECS,
            )),
            max_code_attempts: var_or("LIVEPOLL_CODE_ATTEMPTS", defaults.max_code_attempts),
            limits: SessionLimits {
                max_name_chars: var_or("LIVEPOLL_MAX_NAME_CHARS", limits.max_name_chars),
                max_question_chars: var_or(
                    "LIVEPOLL_MAX_QUESTION_CHARS",
                    limits.max_question_chars,
                ),
                max_option_chars: var_or("LIVEPOLL_MAX_OPTION_CHARS", limits.max_option_chars),
                max_options: var_or("LIVEPOLL_MAX_OPTIONS", limits.max_options),
                max_timer_seconds: var_or("LIVEPOLL_MAX_TIMER_SECS", limits.max_timer_seconds),
                max_chat_chars: var_or("LIVEPOLL_MAX_CHAT_CHARS", limits.max_chat_chars),
                chat_log_capacity: var_or(
                    "LIVEPOLL_CHAT_LOG_CAPACITY",
                    limits.chat_log_capacity,
                ),
            },
            static_dir: std::env::var("STATIC_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty()),
        };

        tracing::info!(
            addr = %config.addr,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            ping_period_ms = config.ping_period().as_millis() as u64,
            code_attempts = config.max_code_attempts,
            static_dir = ?config.static_dir,
            "Server config loaded"
        );

        config
    }

    /// Ping period the gateway uses. A ping interval that would not fire
    /// before the idle timeout is replaced by a third of the timeout.
    pub fn ping_period(&self) -> Duration {
        let period = if self.ping_interval.is_zero() || self.ping_interval >= self.idle_timeout {
            self.idle_timeout / 3
        } else {
            self.ping_interval
        };
        period.max(MIN_PING_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "LIVEPOLL_ADDR",
        "LIVEPOLL_IDLE_TIMEOUT_SECS",
        "LIVEPOLL_PING_INTERVAL_SECS",
        "LIVEPOLL_CODE_ATTEMPTS",
        "LIVEPOLL_MAX_NAME_CHARS",
        "LIVEPOLL_MAX_OPTIONS",
        "LIVEPOLL_CHAT_LOG_CAPACITY",
        "STATIC_DIR",
    ];

    // Environment mutation is process-wide; every test here is #[serial]
    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    fn set(key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = ServerConfig::from_env();

        assert_eq!(config.addr.to_string(), "0.0.0.0:5000");
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.ping_period(), Duration::from_secs(30));
        assert_eq!(config.max_code_attempts, 32);
        assert_eq!(config.limits.max_name_chars, 40);
        assert!(config.static_dir.is_none());
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        set("LIVEPOLL_ADDR", "127.0.0.1:7000");
        set("LIVEPOLL_MAX_OPTIONS", "4");
        set("LIVEPOLL_CHAT_LOG_CAPACITY", "0");
        set("STATIC_DIR", "client/dist");

        let config = ServerConfig::from_env();
        assert_eq!(config.addr.port(), 7000);
        assert_eq!(config.limits.max_options, 4);
        assert_eq!(config.limits.chat_log_capacity, 0);
        assert_eq!(config.static_dir.as_deref(), Some("client/dist"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        set("LIVEPOLL_IDLE_TIMEOUT_SECS", "soon");
        set("LIVEPOLL_CODE_ATTEMPTS", "-3");

        let config = ServerConfig::from_env();
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.max_code_attempts, 32);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_parse_var_reports_key() {
        clear_env();
        set("LIVEPOLL_MAX_NAME_CHARS", "many");

        let err = parse_var::<usize>("LIVEPOLL_MAX_NAME_CHARS").unwrap_err();
        assert!(err.to_string().contains("LIVEPOLL_MAX_NAME_CHARS"));

        clear_env();
    }

    #[test]
    fn test_ping_period_stays_below_idle_timeout() {
        let mut config = ServerConfig {
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        assert_eq!(config.ping_period(), Duration::from_secs(20));

        config.ping_interval = Duration::ZERO;
        assert_eq!(config.ping_period(), Duration::from_secs(20));

        config.ping_interval = Duration::from_secs(5);
        assert_eq!(config.ping_period(), Duration::from_secs(5));

        config.idle_timeout = Duration::ZERO;
        assert_eq!(config.ping_period(), MIN_PING_PERIOD);
    }

    #[test]
    #[serial]
    fn test_ping_interval_from_env() {
        clear_env();
        set("LIVEPOLL_IDLE_TIMEOUT_SECS", "120");
        set("LIVEPOLL_PING_INTERVAL_SECS", "15");

        let config = ServerConfig::from_env();
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert!(config.ping_period() < config.idle_timeout);

        clear_env();
    }
}
