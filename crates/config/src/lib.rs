//! Configuration for the sockpool daemon and client library.
//!
//! Configuration is environment-driven: [`Config::from_env`] applies
//! the `SOCKET_POOL_*` / `REDIS_*` variables over built-in defaults.
//! There is no config file; the daemon is meant to be parameterized by
//! its service unit.
//!
//! Unparseable values fall back to the default with a warning rather
//! than failing startup; [`Config::validate`] catches the combinations
//! that cannot work at all (zero pool size, empty socket path).

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

/// Default IPC socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/socket_pool_service.sock";
/// Default PID file path.
pub const DEFAULT_PID_FILE: &str = "/tmp/socket_pool_service.pid";

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub client: ClientConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
}

/// Daemon-side settings: pool sizing, timeouts, maintenance cadence.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// IPC socket path (`SOCKET_POOL_UNIX_PATH`)
    pub socket_path: PathBuf,
    /// PID file path
    pub pid_file: PathBuf,
    /// Hard cap on pooled connections (`SOCKET_POOL_MAX_SIZE`)
    pub max_pool_size: usize,
    /// Idle TTL after which pooled sockets are evicted (`SOCKET_POOL_TIMEOUT`)
    pub connection_timeout: Duration,
    /// Connect attempts per upstream endpoint (`SOCKET_POOL_MAX_RETRIES`)
    pub max_retries: u32,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Send/receive timeout on upstream sockets
    pub io_timeout: Duration,
    /// Sleep between connect attempts
    pub retry_delay: Duration,
    /// Upstream reply buffer size
    pub response_buffer: usize,
    /// IPC request read cap
    pub request_buffer: usize,
    /// Expired-connection sweep cadence
    pub cleanup_interval: Duration,
    /// Metrics snapshot cadence
    pub metrics_interval: Duration,
    /// Metric emission gate (`SOCKET_POOL_METRICS_ENABLED`)
    pub metrics_enabled: bool,
    /// Health self-check cadence (`SOCKET_POOL_HEALTH_INTERVAL`)
    pub health_check_interval: Duration,
    /// Grace period for in-flight requests on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            max_pool_size: 100,
            connection_timeout: Duration::from_secs(30),
            max_retries: 3,
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(100),
            response_buffer: 2048,
            request_buffer: 4096,
            cleanup_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            metrics_enabled: true,
            health_check_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Client-library settings: retries, circuit breaker, result cache.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// IPC socket path to reach the daemon
    pub socket_path: PathBuf,
    /// Overall timeout per IPC round trip (`SOCKET_POOL_CLIENT_TIMEOUT`)
    pub timeout: Duration,
    /// Retry attempts per request (`SOCKET_POOL_RETRY_ATTEMPTS`)
    pub retry_attempts: u32,
    /// Base retry delay, scaled linearly by attempt (`SOCKET_POOL_RETRY_DELAY`)
    pub retry_delay: Duration,
    /// Circuit breaker gate (`SOCKET_POOL_CIRCUIT_BREAKER`)
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures before the circuit opens (`SOCKET_POOL_CB_THRESHOLD`)
    pub cb_threshold: u32,
    /// Open-circuit cooldown (`SOCKET_POOL_CB_TIMEOUT`)
    pub cb_timeout: Duration,
    /// Result cache gate (`SOCKET_POOL_CACHE_ENABLED`)
    pub cache_enabled: bool,
    /// Result cache TTL (`SOCKET_POOL_CACHE_TTL`)
    pub cache_ttl: Duration,
    /// Response read cap
    pub max_response_bytes: usize,
    /// Concurrency bound for the batch path
    pub batch_concurrency: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            circuit_breaker_enabled: true,
            cb_threshold: 5,
            cb_timeout: Duration::from_secs(30),
            cache_enabled: false,
            cache_ttl: Duration::from_secs(60),
            max_response_bytes: 8192,
            batch_concurrency: 8,
        }
    }
}

/// External cache (redis) settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Gate (`SOCKET_POOL_REDIS_ENABLED`); the daemon runs fine without it
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// TTL for keyed snapshots
    pub snapshot_ttl: Duration,
    /// Bound on the metric record list
    pub metrics_list_cap: usize,
}

impl RedisConfig {
    /// Connection URL in the form redis expects.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            snapshot_ttl: Duration::from_secs(300),
            metrics_list_cap: 1000,
        }
    }
}

/// Logging settings (`SOCKET_POOL_LOG_LEVEL`, `SOCKET_POOL_LOG_FILE`).
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment over defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Daemon
        if let Some(v) = env_parse::<usize>("SOCKET_POOL_MAX_SIZE") {
            config.daemon.max_pool_size = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_POOL_TIMEOUT") {
            config.daemon.connection_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("SOCKET_POOL_MAX_RETRIES") {
            config.daemon.max_retries = v;
        }
        if let Some(v) = env_string("SOCKET_POOL_UNIX_PATH") {
            config.daemon.socket_path = PathBuf::from(&v);
            config.client.socket_path = PathBuf::from(v);
        }
        if let Some(v) = env_bool("SOCKET_POOL_METRICS_ENABLED") {
            config.daemon.metrics_enabled = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_POOL_HEALTH_INTERVAL") {
            config.daemon.health_check_interval = Duration::from_secs(v);
        }

        // Logging
        if let Some(v) = env_string("SOCKET_POOL_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = env_string("SOCKET_POOL_LOG_FILE") {
            config.logging.file = Some(PathBuf::from(v));
        }

        // External cache
        if let Some(v) = env_bool("SOCKET_POOL_REDIS_ENABLED") {
            config.redis.enabled = v;
        }
        if let Some(v) = env_string("REDIS_HOST") {
            config.redis.host = v;
        }
        if let Some(v) = env_parse::<u16>("REDIS_PORT") {
            config.redis.port = v;
        }
        if let Some(v) = env_string("REDIS_PASSWORD") {
            if !v.is_empty() {
                config.redis.password = Some(v);
            }
        }

        // Client
        if let Some(v) = env_parse::<u64>("SOCKET_POOL_CLIENT_TIMEOUT") {
            config.client.timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("SOCKET_POOL_RETRY_ATTEMPTS") {
            config.client.retry_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_POOL_RETRY_DELAY") {
            config.client.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_bool("SOCKET_POOL_CIRCUIT_BREAKER") {
            config.client.circuit_breaker_enabled = v;
        }
        if let Some(v) = env_parse::<u32>("SOCKET_POOL_CB_THRESHOLD") {
            config.client.cb_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_POOL_CB_TIMEOUT") {
            config.client.cb_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_bool("SOCKET_POOL_CACHE_ENABLED") {
            config.client.cache_enabled = v;
        }
        if let Some(v) = env_parse::<u64>("SOCKET_POOL_CACHE_TTL") {
            config.client.cache_ttl = Duration::from_secs(v);
        }

        config
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.max_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "SOCKET_POOL_MAX_SIZE must be at least 1".to_string(),
            ));
        }
        if self.daemon.connection_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "SOCKET_POOL_TIMEOUT must be at least 1 second".to_string(),
            ));
        }
        if self.daemon.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "SOCKET_POOL_UNIX_PATH must not be empty".to_string(),
            ));
        }
        if self.daemon.response_buffer == 0 || self.daemon.request_buffer == 0 {
            return Err(ConfigError::Invalid(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        if self.client.batch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// JSON dump for `get_config` and `config show`, with the redis
    /// password redacted.
    pub fn to_redacted_json(&self) -> Value {
        json!({
            "daemon": {
                "socket_path": self.daemon.socket_path,
                "pid_file": self.daemon.pid_file,
                "max_pool_size": self.daemon.max_pool_size,
                "connection_timeout_s": self.daemon.connection_timeout.as_secs(),
                "max_retries": self.daemon.max_retries,
                "connect_timeout_ms": self.daemon.connect_timeout.as_millis() as u64,
                "io_timeout_ms": self.daemon.io_timeout.as_millis() as u64,
                "response_buffer": self.daemon.response_buffer,
                "request_buffer": self.daemon.request_buffer,
                "cleanup_interval_s": self.daemon.cleanup_interval.as_secs(),
                "metrics_interval_s": self.daemon.metrics_interval.as_secs(),
                "metrics_enabled": self.daemon.metrics_enabled,
                "health_check_interval_s": self.daemon.health_check_interval.as_secs(),
            },
            "client": {
                "timeout_s": self.client.timeout.as_secs(),
                "retry_attempts": self.client.retry_attempts,
                "retry_delay_ms": self.client.retry_delay.as_millis() as u64,
                "circuit_breaker_enabled": self.client.circuit_breaker_enabled,
                "cb_threshold": self.client.cb_threshold,
                "cb_timeout_s": self.client.cb_timeout.as_secs(),
                "cache_enabled": self.client.cache_enabled,
                "cache_ttl_s": self.client.cache_ttl.as_secs(),
            },
            "redis": {
                "enabled": self.redis.enabled,
                "host": self.redis.host,
                "port": self.redis.port,
                "password": self.redis.password.as_ref().map(|_| "********"),
                "snapshot_ttl_s": self.redis.snapshot_ttl.as_secs(),
                "metrics_list_cap": self.redis.metrics_list_cap,
            },
            "logging": {
                "level": self.logging.level,
                "file": self.logging.file,
            },
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = env_string(name)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(var = name, value = %raw, "Ignoring unparseable boolean environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation is process-global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.daemon.max_pool_size, 100);
        assert_eq!(config.daemon.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.daemon.response_buffer, 2048);
        assert_eq!(config.client.retry_attempts, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SOCKET_POOL_MAX_SIZE", "7");
        std::env::set_var("SOCKET_POOL_TIMEOUT", "12");
        std::env::set_var("SOCKET_POOL_UNIX_PATH", "/tmp/alt.sock");
        std::env::set_var("SOCKET_POOL_CB_THRESHOLD", "2");
        std::env::set_var("SOCKET_POOL_REDIS_ENABLED", "true");

        let config = Config::from_env();
        assert_eq!(config.daemon.max_pool_size, 7);
        assert_eq!(config.daemon.connection_timeout, Duration::from_secs(12));
        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/alt.sock"));
        // The client path follows the daemon path override.
        assert_eq!(config.client.socket_path, PathBuf::from("/tmp/alt.sock"));
        assert_eq!(config.client.cb_threshold, 2);
        assert!(config.redis.enabled);

        for var in [
            "SOCKET_POOL_MAX_SIZE",
            "SOCKET_POOL_TIMEOUT",
            "SOCKET_POOL_UNIX_PATH",
            "SOCKET_POOL_CB_THRESHOLD",
            "SOCKET_POOL_REDIS_ENABLED",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn unparseable_env_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SOCKET_POOL_MAX_SIZE", "not-a-number");
        let config = Config::from_env();
        assert_eq!(config.daemon.max_pool_size, 100);
        std::env::remove_var("SOCKET_POOL_MAX_SIZE");
    }

    #[test]
    fn zero_pool_size_rejected() {
        let mut config = Config::default();
        config.daemon.max_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn redacted_dump_hides_password() {
        let mut config = Config::default();
        config.redis.password = Some("hunter2".to_string());
        let dump = config.to_redacted_json();
        assert_eq!(dump["redis"]["password"], "********");
        assert!(dump.to_string().find("hunter2").is_none());
    }

    #[test]
    fn redis_url_forms() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/");
        redis.password = Some("s3cret".to_string());
        assert_eq!(redis.url(), "redis://:s3cret@127.0.0.1:6379/");
    }
}
