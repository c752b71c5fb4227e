//! Client configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::{DEFAULT_CONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};
use crate::correlation::DEFAULT_REQUEST_TIMEOUT_MS;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:3000/ws";
pub const DEFAULT_SESSION_PATH: &str = ".messenger-session.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a ws:// or wss:// url, got '{value}'")]
    InvalidUrl { var: &'static str, value: String },
    #[error("{var} must be at least 1")]
    ZeroAttempts { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub request_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub session_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_WS_URL.to_owned(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            session_path: PathBuf::from(DEFAULT_SESSION_PATH),
        }
    }
}

impl ClientConfig {
    /// Build typed client config from environment variables.
    ///
    /// Optional:
    /// - `MESSENGER_WS_URL`: default `ws://127.0.0.1:3000/ws`
    /// - `MESSENGER_REQUEST_TIMEOUT_MS`: default 5000
    /// - `MESSENGER_CONNECT_ATTEMPTS`: default 3
    /// - `MESSENGER_RETRY_DELAY_MS`: default 1000
    /// - `MESSENGER_SESSION_PATH`: default `.messenger-session.json`
    ///
    /// Unparseable numbers fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Fails on a non-websocket url or zero connect attempts.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ClientConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server_url = lookup("MESSENGER_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_owned());
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl { var: "MESSENGER_WS_URL", value: server_url });
        }

        let connect_attempts = parse_or(&lookup, "MESSENGER_CONNECT_ATTEMPTS", DEFAULT_CONNECT_ATTEMPTS);
        if connect_attempts == 0 {
            return Err(ConfigError::ZeroAttempts { var: "MESSENGER_CONNECT_ATTEMPTS" });
        }

        Ok(Self {
            server_url,
            request_timeout: Duration::from_millis(parse_or(&lookup, "MESSENGER_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)),
            connect_attempts,
            retry_delay: Duration::from_millis(parse_or(&lookup, "MESSENGER_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)),
            session_path: lookup("MESSENGER_SESSION_PATH").map_or_else(|| PathBuf::from(DEFAULT_SESSION_PATH), PathBuf::from),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
