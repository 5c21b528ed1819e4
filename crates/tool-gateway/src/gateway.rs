use std::sync::Arc;
use std::time::{Duration, Instant};

use ai_agent::{Capabilities, OperationInfo, ToolCall, ToolExecutor, ToolInvokeError, ToolResult};
use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::{BackendCallError, McpBackend, ToolBackend};
use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::normalizer::{normalize, BackendKind};
use crate::status::{BackendState, BackendStatus, StatusTracker};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_AFTER: Duration = Duration::from_secs(15);
/// Extra time granted on top of a call's own deadline before the gateway
/// abandons a backend that ignores it.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

struct BackendEntry {
    name: String,
    kind: BackendKind,
    enabled: bool,
    discovery_timeout: Duration,
    backend: Arc<dyn ToolBackend>,
    status: Mutex<StatusTracker>,
    connect_lock: Mutex<()>,
}

/// Liveness of one backend as reported by the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub connected: bool,
    pub operations: Vec<String>,
}

/// Uniform front for every registered tool backend.
pub struct ToolGateway {
    backends: RwLock<IndexMap<String, Arc<BackendEntry>>>,
    default_timeout: Duration,
    reconnect_after: Duration,
}

impl Default for ToolGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolGateway {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(IndexMap::new()),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            reconnect_after: DEFAULT_RECONNECT_AFTER,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// How long an unavailable backend is left alone before the next use
    /// tries to reconnect it.
    pub fn with_reconnect_after(mut self, delay: Duration) -> Self {
        self.reconnect_after = delay;
        self
    }

    /// Registers an MCP backend from its manifest entry. Nothing is dialled
    /// here; the first use (or [`connect_all`](Self::connect_all)) connects.
    pub async fn register(&self, config: BackendConfig) -> Result<()> {
        let resolved = config.resolve()?;
        let backend = McpBackend::new(&resolved, self.default_timeout)
            .map_err(|err| GatewayError::config(&resolved.name, format!("{err:#}")))?;
        let entry = BackendEntry {
            name: resolved.name.clone(),
            kind: resolved.kind,
            enabled: resolved.enabled,
            discovery_timeout: resolved.timeout.unwrap_or(self.default_timeout),
            backend: Arc::new(backend),
            status: Mutex::new(StatusTracker::new(resolved.enabled)),
            connect_lock: Mutex::new(()),
        };
        self.insert(entry).await
    }

    /// Registers an already constructed backend.
    pub async fn register_backend(
        &self,
        name: impl Into<String>,
        kind: BackendKind,
        backend: Arc<dyn ToolBackend>,
    ) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(GatewayError::config("<unnamed>", "backend name is empty"));
        }
        let entry = BackendEntry {
            name,
            kind,
            enabled: true,
            discovery_timeout: self.default_timeout,
            backend,
            status: Mutex::new(StatusTracker::new(true)),
            connect_lock: Mutex::new(()),
        };
        self.insert(entry).await
    }

    async fn insert(&self, entry: BackendEntry) -> Result<()> {
        let mut backends = self.backends.write().await;
        if backends.contains_key(&entry.name) {
            return Err(GatewayError::config(&entry.name, "backend is already registered"));
        }
        info!(
            target: "tool_gateway",
            backend = %entry.name,
            kind = ?entry.kind,
            enabled = entry.enabled,
            "registered backend"
        );
        backends.insert(entry.name.clone(), Arc::new(entry));
        Ok(())
    }

    async fn entry(&self, name: &str) -> Result<Arc<BackendEntry>> {
        self.backends
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))
    }

    async fn entries(&self) -> Vec<Arc<BackendEntry>> {
        self.backends.read().await.values().cloned().collect()
    }

    /// Connects one backend now and returns its operations.
    pub async fn connect(&self, name: &str) -> Result<Vec<OperationInfo>> {
        let entry = self.entry(name).await?;
        self.ensure_ready(&entry).await
    }

    /// Connects every enabled backend concurrently. Failures are logged and
    /// leave the backend marked unavailable; they never abort the others.
    pub async fn connect_all(&self) {
        let entries = self.entries().await;
        let attempts = entries
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| async move { (entry.name.clone(), self.ensure_ready(entry).await) });
        for (name, outcome) in join_all(attempts).await {
            match outcome {
                Ok(operations) => info!(
                    target: "tool_gateway",
                    backend = %name,
                    operations = operations.len(),
                    "backend connected"
                ),
                Err(err) => warn!(
                    target: "tool_gateway",
                    backend = %name,
                    error = %err,
                    "backend failed to connect; marked unavailable"
                ),
            }
        }
    }

    async fn ensure_ready(&self, entry: &BackendEntry) -> Result<Vec<OperationInfo>> {
        if !entry.enabled {
            return Err(GatewayError::unavailable(&entry.name, "backend is disabled"));
        }
        {
            let status = entry.status.lock().await;
            if status.backing_off(self.reconnect_after) {
                let reason = status.last_error().unwrap_or("not connected").to_string();
                return Err(GatewayError::unavailable(&entry.name, reason));
            }
        }

        let _guard = entry.connect_lock.lock().await;
        entry.status.lock().await.connecting();
        let discovered = tokio::time::timeout(entry.discovery_timeout, entry.backend.discover()).await;
        let mut status = entry.status.lock().await;
        match discovered {
            Ok(Ok(operations)) => {
                status.connected(operations.iter().map(|op| op.name.clone()).collect());
                Ok(operations)
            }
            Ok(Err(err)) => {
                let reason = format!("{err:#}");
                status.unavailable(&reason);
                Err(GatewayError::unavailable(&entry.name, reason))
            }
            Err(_) => {
                let reason = format!(
                    "no answer to discovery within {} ms",
                    entry.discovery_timeout.as_millis()
                );
                status.unavailable(&reason);
                Err(GatewayError::unavailable(&entry.name, reason))
            }
        }
    }

    /// Runs one operation and returns its normalized result.
    pub async fn invoke(
        &self,
        backend: &str,
        operation: &str,
        args: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<ToolResult> {
        let entry = self.entry(backend).await?;
        let operations = self.ensure_ready(&entry).await?;
        if !operations.iter().any(|op| op.name == operation) {
            return Err(GatewayError::UnknownOperation {
                backend: backend.to_string(),
                operation: operation.to_string(),
            });
        }

        debug!(target: "tool_gateway", backend, operation, "invoking");
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout + DEADLINE_GRACE,
            entry.backend.call(operation, args, timeout),
        )
        .await
        .unwrap_or(Err(BackendCallError::Timeout(timeout)));

        let mut status = entry.status.lock().await;
        match outcome {
            Ok(raw) => {
                status.record_success(operation, started.elapsed());
                Ok(normalize(entry.kind, &raw))
            }
            Err(BackendCallError::Timeout(_)) => {
                let timeout_ms = timeout.as_millis() as u64;
                status.record_error(operation, &format!("timed out after {timeout_ms} ms"));
                warn!(target: "tool_gateway", backend, operation, timeout_ms, "operation timed out");
                Err(GatewayError::OperationTimeout {
                    backend: backend.to_string(),
                    operation: operation.to_string(),
                    timeout_ms,
                })
            }
            Err(BackendCallError::Unavailable(err)) => {
                let reason = format!("{err:#}");
                status.unavailable(&reason);
                warn!(target: "tool_gateway", backend, operation, error = %reason, "backend became unavailable");
                Err(GatewayError::unavailable(backend, reason))
            }
            Err(BackendCallError::Protocol(detail)) => {
                status.record_error(operation, &detail);
                Err(GatewayError::Protocol {
                    backend: backend.to_string(),
                    detail,
                })
            }
        }
    }

    /// Names of the operations `backend` exposes, connecting it if needed.
    pub async fn list_operations(&self, backend: &str) -> Result<Vec<String>> {
        Ok(self
            .operations(backend)
            .await?
            .into_iter()
            .map(|op| op.name)
            .collect())
    }

    pub async fn operations(&self, backend: &str) -> Result<Vec<OperationInfo>> {
        let entry = self.entry(backend).await?;
        self.ensure_ready(&entry).await
    }

    /// Per-backend availability. Never touches the wire.
    pub async fn health(&self) -> IndexMap<String, bool> {
        let mut health = IndexMap::new();
        for entry in self.entries().await {
            let ready = entry.status.lock().await.state() == BackendState::Ready;
            health.insert(entry.name.clone(), ready);
        }
        health
    }

    pub async fn backend_health(&self) -> IndexMap<String, BackendHealth> {
        let mut health = IndexMap::new();
        for entry in self.entries().await {
            let status = entry.status.lock().await;
            health.insert(
                entry.name.clone(),
                BackendHealth {
                    connected: status.state() == BackendState::Ready,
                    operations: status.operations().to_vec(),
                },
            );
        }
        health
    }

    /// Number of registered backends that are enabled.
    pub async fn enabled_count(&self) -> usize {
        self.entries().await.iter().filter(|e| e.enabled).count()
    }

    pub async fn status_snapshot(&self) -> Vec<(String, BackendStatus)> {
        let mut snapshot = Vec::new();
        for entry in self.entries().await {
            snapshot.push((entry.name.clone(), entry.status.lock().await.snapshot()));
        }
        snapshot
    }

    /// Closes every backend connection.
    pub async fn shutdown(&self) {
        let entries = self.entries().await;
        join_all(entries.iter().map(|entry| entry.backend.shutdown())).await;
        info!(target: "tool_gateway", backends = entries.len(), "tool gateway shut down");
    }
}

#[async_trait]
impl ToolExecutor for ToolGateway {
    async fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::new();
        for entry in self.entries().await {
            if !entry.enabled {
                continue;
            }
            match self.ensure_ready(&entry).await {
                Ok(operations) => {
                    capabilities.insert(entry.name.clone(), operations);
                }
                Err(err) => debug!(
                    target: "tool_gateway",
                    backend = %entry.name,
                    error = %err,
                    "leaving backend out of capabilities"
                ),
            }
        }
        capabilities
    }

    async fn list_operations(&self, backend: &str) -> std::result::Result<Vec<String>, ToolInvokeError> {
        Ok(ToolGateway::list_operations(self, backend).await?)
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        timeout: Duration,
    ) -> std::result::Result<ToolResult, ToolInvokeError> {
        Ok(ToolGateway::invoke(self, &call.backend, &call.operation, &call.args, timeout).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticBackend;

    #[async_trait]
    impl ToolBackend for StaticBackend {
        async fn discover(&self) -> anyhow::Result<Vec<OperationInfo>> {
            Ok(vec![OperationInfo::new("execute_sql", "Run a query")])
        }

        async fn call(
            &self,
            _operation: &str,
            args: &Map<String, Value>,
            _timeout: Duration,
        ) -> std::result::Result<Value, BackendCallError> {
            if args.get("sql").and_then(Value::as_str) == Some("SELEC") {
                return Ok(json!({ "isError": true, "content": [{ "type": "text", "text": "syntax error at or near \"SELEC\"" }] }));
            }
            Ok(json!([{ "region": "EU", "total": 10 }]))
        }
    }

    #[tokio::test]
    async fn duplicate_and_unknown_backends_are_rejected() {
        let gateway = ToolGateway::new();
        gateway
            .register_backend("db", BackendKind::Database, Arc::new(StaticBackend))
            .await
            .unwrap();
        assert!(matches!(
            gateway
                .register_backend("db", BackendKind::Database, Arc::new(StaticBackend))
                .await,
            Err(GatewayError::BackendConfig { .. })
        ));
        assert!(matches!(
            gateway.invoke("nope", "x", &Map::new(), DEFAULT_CALL_TIMEOUT).await,
            Err(GatewayError::UnknownBackend(_))
        ));
        assert!(matches!(
            gateway.invoke("db", "drop_table", &Map::new(), DEFAULT_CALL_TIMEOUT).await,
            Err(GatewayError::UnknownOperation { .. })
        ));
    }

    #[tokio::test]
    async fn backend_failures_come_back_as_error_results() {
        let gateway = ToolGateway::new();
        gateway
            .register_backend("db", BackendKind::Database, Arc::new(StaticBackend))
            .await
            .unwrap();

        let mut args = Map::new();
        args.insert("sql".into(), json!("SELEC"));
        let result = gateway
            .invoke("db", "execute_sql", &args, DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();
        assert!(result.is_error());

        args.insert("sql".into(), json!("SELECT 1"));
        let result = gateway
            .invoke("db", "execute_sql", &args, DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.kind(), "data");

        let status = gateway.status_snapshot().await;
        assert_eq!(status[0].1.success_count, 2);
        assert_eq!(status[0].1.state, BackendState::Ready);
    }

    #[tokio::test]
    async fn invalid_manifest_entries_fail_registration_only() {
        let gateway = ToolGateway::new();
        let broken = BackendConfig {
            endpoint: None,
            ..BackendConfig::remote("ui", "")
        };
        assert!(matches!(
            gateway.register(broken).await,
            Err(GatewayError::BackendConfig { .. })
        ));
        gateway
            .register(BackendConfig::remote("ui", "http://127.0.0.1:3001/mcp"))
            .await
            .unwrap();
        assert_eq!(gateway.health().await.get("ui"), Some(&false));
    }
}
