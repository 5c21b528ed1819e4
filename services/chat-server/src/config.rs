use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 1000;
pub const DEFAULT_HISTORY_TURNS: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid listen address `{value}`: {reason}")]
    InvalidListen { value: String, reason: String },
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

/// Fixed-window query allowance for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_queries: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_queries: 100,
            window: Duration::from_secs(3600),
        }
    }
}

/// Per-session behaviour.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_query_length: usize,
    /// Completed turns remembered and handed to the reasoning loop.
    pub history_turns: usize,
    pub rate_limit: RateLimit,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            history_turns: DEFAULT_HISTORY_TURNS,
            rate_limit: RateLimit::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub heartbeat_interval: Duration,
    pub max_connections: usize,
    pub session: SessionSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max connections"));
        }
        if self.session.max_query_length == 0 {
            return Err(ConfigError::Zero("max query length"));
        }
        if self.session.rate_limit.max_queries == 0 {
            return Err(ConfigError::Zero("rate limit"));
        }
        if self.session.rate_limit.window.is_zero() {
            return Err(ConfigError::Zero("rate limit window"));
        }
        Ok(())
    }
}

/// Accepts `host:port`, optionally written as a `ws://` URL.
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    let trimmed = value.trim();
    let bare = trimmed
        .strip_prefix("ws://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    let invalid = |reason: String| ConfigError::InvalidListen {
        value: value.to_string(),
        reason,
    };

    if let Ok(addr) = bare.parse::<SocketAddr>() {
        return Ok(addr);
    }
    bare.to_socket_addrs()
        .map_err(|err| invalid(err.to_string()))?
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses".into()))
}
