//! Tool gateway: a uniform `invoke(backend, operation, args)` surface over
//! independently managed MCP tool servers reached via HTTP, websocket or a
//! child process's stdio.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod normalizer;
pub mod status;
mod transport;

pub use client::{BackendCallError, McpBackend, ToolBackend};
pub use config::{
    BackendConfig, BackendManifest, Connection, ResolvedBackend, StdioFraming, TransportKind,
    DEFAULT_MANIFEST_PATH,
};
pub use error::{GatewayError, Result};
pub use gateway::{BackendHealth, ToolGateway, DEFAULT_CALL_TIMEOUT, DEFAULT_RECONNECT_AFTER};
pub use normalizer::{normalize, BackendKind};
pub use status::{BackendState, BackendStatus, LogEntry, LogLevel};
pub use transport::TransportError;
