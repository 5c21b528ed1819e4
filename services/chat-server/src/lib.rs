//! Session manager and websocket front end for the analytics chat service.

pub mod config;
pub mod health;
pub mod limits;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{
    parse_listen_addr, ConfigError, RateLimit, ServerConfig, SessionSettings,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HISTORY_TURNS, DEFAULT_LISTEN_ADDR,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_QUERY_LENGTH,
};
pub use health::{HealthSnapshot, Overall};
pub use limits::{validate_query, QueryRejection, RateLimiter};
pub use registry::{Admission, SessionRegistry};
pub use server::ChatServer;
pub use session::{terminal_message, Session};
