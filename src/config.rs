//! Client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_AMI_PORT, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY_MS, DEFAULT_DIAL_TIMEOUT_MS,
    DEFAULT_KEEPALIVE_MS, DEFAULT_PING_FAILURES, DEFAULT_PING_TIMEOUT_MS, GREETING_LEN,
    MAX_ACTION_QUEUE_SIZE,
};
use crate::error::{AmiError, AmiResult};

/// Connection settings. Fixed for the lifetime of an [`AmiConnection`](crate::AmiConnection).
///
/// Durations are written in milliseconds when (de)serialized:
///
/// ```
/// use asterisk_ami_tokio::AmiConfig;
/// use std::time::Duration;
///
/// let config = AmiConfig::new("10.0.0.5:5038", "admin", "secret");
/// assert!(config.enabled);
/// assert_eq!(config.ping_timeout, Duration::from_secs(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    /// A disabled client never dials and reports itself offline.
    pub enabled: bool,
    /// `host:port` of the manager interface.
    pub address: String,
    pub username: String,
    pub password: String,
    /// Bound on the TCP connect, the greeting and the login reply.
    #[serde(rename = "dial_timeout_ms", with = "duration_ms")]
    pub dial_timeout: Duration,
    /// Heartbeat period.
    #[serde(rename = "keepalive_ms", with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// How long a heartbeat waits for its reply.
    #[serde(rename = "ping_timeout_ms", with = "duration_ms")]
    pub ping_timeout: Duration,
    /// Consecutive missed heartbeats that end a session.
    pub ping_failures: u32,
    /// Dial+login attempts per connect round.
    pub connect_attempts: u32,
    /// Pause between attempts, and between rounds after a session is lost.
    #[serde(rename = "connect_delay_ms", with = "duration_ms")]
    pub connect_delay: Duration,
    /// Bytes read as the server banner before logging in.
    pub greeting_len: usize,
    /// Capacity of the outbound action queue.
    pub queue_size: usize,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: format!("127.0.0.1:{}", DEFAULT_AMI_PORT),
            username: String::new(),
            password: String::new(),
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            ping_failures: DEFAULT_PING_FAILURES,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: Duration::from_millis(DEFAULT_CONNECT_DELAY_MS),
            greeting_len: GREETING_LEN,
            queue_size: MAX_ACTION_QUEUE_SIZE,
        }
    }
}

impl fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiConfig")
            .field("enabled", &self.enabled)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("dial_timeout", &self.dial_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("ping_failures", &self.ping_failures)
            .field("connect_attempts", &self.connect_attempts)
            .field("connect_delay", &self.connect_delay)
            .field("greeting_len", &self.greeting_len)
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl AmiConfig {
    /// Enabled configuration with default timings.
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            enabled: true,
            address: address.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Build from `AMI_*` environment variables, defaulting anything unset.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `AMI_ENABLED` | `enabled` |
    /// | `AMI_ADDRESS` | `address` |
    /// | `AMI_USERNAME` | `username` |
    /// | `AMI_PASSWORD` | `password` |
    /// | `AMI_DIAL_TIMEOUT_MS` | `dial_timeout` |
    /// | `AMI_KEEPALIVE_MS` | `keepalive_interval` |
    /// | `AMI_PING_TIMEOUT_MS` | `ping_timeout` |
    /// | `AMI_PING_FAILURES` | `ping_failures` |
    /// | `AMI_CONNECT_ATTEMPTS` | `connect_attempts` |
    /// | `AMI_CONNECT_DELAY_MS` | `connect_delay` |
    pub fn from_env() -> AmiResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> AmiResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("AMI_ENABLED") {
            config.enabled = parse_bool("AMI_ENABLED", &raw)?;
        }
        if let Some(address) = lookup("AMI_ADDRESS") {
            config.address = address;
        }
        if let Some(username) = lookup("AMI_USERNAME") {
            config.username = username;
        }
        if let Some(password) = lookup("AMI_PASSWORD") {
            config.password = password;
        }
        if let Some(raw) = lookup("AMI_DIAL_TIMEOUT_MS") {
            config.dial_timeout = Duration::from_millis(parse_num("AMI_DIAL_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("AMI_KEEPALIVE_MS") {
            config.keepalive_interval = Duration::from_millis(parse_num("AMI_KEEPALIVE_MS", &raw)?);
        }
        if let Some(raw) = lookup("AMI_PING_TIMEOUT_MS") {
            config.ping_timeout = Duration::from_millis(parse_num("AMI_PING_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("AMI_PING_FAILURES") {
            config.ping_failures = parse_num("AMI_PING_FAILURES", &raw)?;
        }
        if let Some(raw) = lookup("AMI_CONNECT_ATTEMPTS") {
            config.connect_attempts = parse_num("AMI_CONNECT_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("AMI_CONNECT_DELAY_MS") {
            config.connect_delay = Duration::from_millis(parse_num("AMI_CONNECT_DELAY_MS", &raw)?);
        }

        Ok(config)
    }

    /// Check an enabled configuration for values the client cannot run with.
    /// A disabled configuration is always valid.
    pub fn validate(&self) -> AmiResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self
            .address
            .trim()
            .is_empty()
        {
            return Err(AmiError::config("address must not be empty"));
        }
        if self
            .username
            .is_empty()
        {
            return Err(AmiError::config("username must not be empty"));
        }
        if self
            .keepalive_interval
            .is_zero()
        {
            return Err(AmiError::config("keepalive interval must be non-zero"));
        }
        if self.connect_attempts == 0 {
            return Err(AmiError::config("connect attempts must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(AmiError::config("queue size must be at least 1"));
        }
        Ok(())
    }
}

fn parse_num<T: FromStr>(name: &str, raw: &str) -> AmiResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| AmiError::config(format!("{}: invalid value '{}'", name, raw)))
}

fn parse_bool(name: &str, raw: &str) -> AmiResult<bool> {
    match raw
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(AmiError::config(format!("{}: invalid value '{}'", name, raw))),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
