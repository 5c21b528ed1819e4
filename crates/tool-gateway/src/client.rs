use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ai_agent::OperationInfo;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ResolvedBackend;
use crate::transport::{Transport, TransportError};

const TOOL_CACHE_TTL: Duration = Duration::from_secs(120);
const PROTOCOL_VERSION: &str = "2025-03-26";
const MAX_LIST_PAGES: usize = 16;

/// Why a backend call did not produce a payload.
#[derive(Debug, Error)]
pub enum BackendCallError {
    #[error("no response within {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("backend unreachable: {0:#}")]
    Unavailable(anyhow::Error),
    #[error("invalid response: {0}")]
    Protocol(String),
}

impl From<TransportError> for BackendCallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(limit) => BackendCallError::Timeout(limit),
            TransportError::Connection(err) => BackendCallError::Unavailable(err),
            TransportError::Decode(detail) => BackendCallError::Protocol(detail),
        }
    }
}

/// A live connection to one tool backend. The gateway owns lifecycle and
/// health; implementations only speak the wire protocol.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Lists the operations the backend currently exposes.
    async fn discover(&self) -> anyhow::Result<Vec<OperationInfo>>;

    /// Performs one operation and returns the backend's raw payload.
    /// Backend-reported failures are payloads, not errors.
    async fn call(
        &self,
        operation: &str,
        args: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, BackendCallError>;

    /// Releases the connection. Called once at shutdown.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
struct ToolCache {
    operations: Vec<OperationInfo>,
    fetched_at: Instant,
}

#[derive(Default)]
struct ClientState {
    initialised_epoch: Option<u64>,
    cache_dirty: bool,
    cache: Option<ToolCache>,
}

/// MCP (JSON-RPC 2.0) client for a single backend.
pub struct McpBackend {
    label: String,
    request_timeout: Duration,
    transport: Arc<Transport>,
    request_id: AtomicU64,
    state: Mutex<ClientState>,
    init_lock: Mutex<()>,
}

impl McpBackend {
    pub fn new(resolved: &ResolvedBackend, request_timeout: Duration) -> anyhow::Result<Self> {
        let transport = Transport::new(&resolved.name, &resolved.connection)
            .with_context(|| format!("preparing transport for backend {}", resolved.name))?;
        Ok(Self {
            label: resolved.name.clone(),
            request_timeout: resolved.timeout.unwrap_or(request_timeout),
            transport: Arc::new(transport),
            request_id: AtomicU64::new(1),
            state: Mutex::new(ClientState::default()),
            init_lock: Mutex::new(()),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BackendCallError> {
        let id = self.next_id();
        let body = request_body(id, method, params);
        let payload = self.transport.request(id, &body, timeout).await?;
        extract_result(payload).map_err(BackendCallError::Protocol)
    }

    async fn ensure_initialised(&self) -> Result<(), BackendCallError> {
        let current = self.transport.session_epoch().await;
        {
            let state = self.state.lock().await;
            if current.is_some() && state.initialised_epoch == current {
                return Ok(());
            }
        }

        let _guard = self.init_lock.lock().await;
        let current = self.transport.session_epoch().await;
        {
            let state = self.state.lock().await;
            if current.is_some() && state.initialised_epoch == current {
                return Ok(());
            }
        }

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "analytics-chat",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": true }
            }
        });
        self.send_request("initialize", params, self.request_timeout)
            .await?;
        if let Err(err) = self
            .transport
            .notify(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await
        {
            debug!(target: "tool_gateway", backend = %self.label, error = %err, "initialized notification failed");
        }

        let epoch = self.transport.session_epoch().await;
        let mut state = self.state.lock().await;
        state.initialised_epoch = epoch;
        state.cache_dirty = true;
        debug!(target: "tool_gateway", backend = %self.label, "session initialised");
        Ok(())
    }

    async fn cached_operations(&self) -> Option<Vec<OperationInfo>> {
        let mut state = self.state.lock().await;
        if self.transport.take_list_changed() {
            state.cache_dirty = true;
        }
        if state.cache_dirty {
            return None;
        }
        state
            .cache
            .as_ref()
            .filter(|cache| cache.fetched_at.elapsed() < TOOL_CACHE_TTL)
            .map(|cache| cache.operations.clone())
    }

    async fn update_cache(&self, operations: &[OperationInfo]) {
        let mut state = self.state.lock().await;
        state.cache = Some(ToolCache {
            operations: operations.to_vec(),
            fetched_at: Instant::now(),
        });
        state.cache_dirty = false;
    }
}

#[async_trait]
impl ToolBackend for McpBackend {
    async fn discover(&self) -> anyhow::Result<Vec<OperationInfo>> {
        self.ensure_initialised()
            .await
            .with_context(|| format!("initialising backend {}", self.label))?;
        if let Some(cached) = self.cached_operations().await {
            return Ok(cached);
        }

        let mut operations = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self
                .send_request("tools/list", params, self.request_timeout)
                .await
                .context("requesting tool list")?;
            let page: ToolListResponse =
                serde_json::from_value(result).context("decoding tool list response")?;
            operations.extend(page.tools.into_iter().map(|tool| OperationInfo {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            }));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        self.update_cache(&operations).await;
        Ok(operations)
    }

    async fn call(
        &self,
        operation: &str,
        args: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, BackendCallError> {
        self.ensure_initialised().await?;

        let id = self.next_id();
        let body = request_body(
            id,
            "tools/call",
            json!({ "name": operation, "arguments": args }),
        );
        let mut guard = CancelOnDrop {
            transport: self.transport.clone(),
            request_id: id,
            reason: "request abandoned",
            armed: true,
        };

        match self.transport.request(id, &body, timeout).await {
            Ok(payload) => {
                guard.armed = false;
                Ok(call_result(payload))
            }
            Err(TransportError::Timeout(limit)) => {
                guard.reason = "timed out";
                Err(BackendCallError::Timeout(limit))
            }
            Err(err) => {
                guard.armed = false;
                Err(err.into())
            }
        }
    }

    async fn shutdown(&self) {
        self.transport.close().await;
    }
}

/// Tells the backend to stop working on a request we no longer wait for.
struct CancelOnDrop {
    transport: Arc<Transport>,
    request_id: u64,
    reason: &'static str,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        let body = json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": { "requestId": self.request_id, "reason": self.reason }
        });
        handle.spawn(async move {
            if let Err(err) = transport.notify(&body).await {
                warn!(target: "tool_gateway", error = %err, "failed to send cancellation");
            }
        });
    }
}

fn request_body(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    })
}

fn extract_result(payload: Value) -> Result<Value, String> {
    if let Some(error) = payload.get("error") {
        return Err(rpc_error_message(error));
    }
    match payload {
        Value::Object(mut map) => Ok(map.remove("result").unwrap_or(Value::Object(map))),
        other => Err(format!("expected a JSON-RPC object, got {other}")),
    }
}

/// A JSON-RPC error on `tools/call` is the backend refusing the call, which
/// the caller sees as an error-kind result rather than a transport failure.
fn call_result(payload: Value) -> Value {
    match extract_result(payload) {
        Ok(result) => result,
        Err(message) => json!({
            "isError": true,
            "content": [{ "type": "text", "text": message }]
        }),
    }
}

fn rpc_error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolListResponse {
    #[serde(default)]
    tools: Vec<RemoteToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteToolDescriptor {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "inputSchema")]
    input_schema: Value,
}

impl std::fmt::Debug for McpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBackend")
            .field("label", &self.label)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
