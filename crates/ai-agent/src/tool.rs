use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single record of tabular output. Key order is column order.
pub type Row = Map<String, Value>;

/// One request to a backend through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub backend: String,
    pub operation: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(
        backend: impl Into<String>,
        operation: impl Into<String>,
        args: Map<String, Value>,
    ) -> Self {
        Self {
            backend: backend.into(),
            operation: operation.into(),
            args,
        }
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.backend, self.operation)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularData {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl TabularData {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a table from loosely shaped records.
    ///
    /// Columns follow the first record's key order; keys first seen in later
    /// records are appended. Every row is filled out to the full column set
    /// with nulls so no value is dropped and every row has the same shape.
    pub fn from_records(records: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.iter().any(|column| column == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                let mut row = Row::new();
                for column in &columns {
                    let value = record.remove(column).unwrap_or(Value::Null);
                    row.insert(column.clone(), value);
                }
                row
            })
            .collect();

        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiResource {
    pub uri: String,
    pub mime_type: String,
    pub content: String,
    pub encoding: String,
}

/// Canonical outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResult {
    Data(TabularData),
    UiResource(UiResource),
    Text { text: String },
    Error { message: String },
}

impl ToolResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::UiResource(_) => "ui_resource",
            Self::Text { .. } => "text",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

impl OperationInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
        }
    }
}

/// Operations each reachable backend exposes, keyed by backend name.
pub type Capabilities = IndexMap<String, Vec<OperationInfo>>;

/// Failures raised by a [`ToolExecutor`] instead of being returned as data.
#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),
    #[error("backend `{backend}` has no operation `{operation}`")]
    UnknownOperation { backend: String, operation: String },
    #[error("backend `{backend}` is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },
    #[error("`{operation}` on backend `{backend}` timed out after {timeout_ms} ms")]
    Timeout {
        backend: String,
        operation: String,
        timeout_ms: u64,
    },
    #[error("tool gateway failure: {0}")]
    Fatal(String),
}

impl ToolInvokeError {
    /// Whether the loop can turn this into an observation and keep going.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn into_observation(self) -> ToolResult {
        let message = match &self {
            Self::UnknownBackend(name) => {
                format!("There is no backend named `{name}`. Use one of the listed backends.")
            }
            Self::UnknownOperation { backend, operation } => format!(
                "Backend `{backend}` has no operation `{operation}`. Use one of its listed operations."
            ),
            Self::BackendUnavailable { backend, .. } => format!(
                "Backend `{backend}` is currently unavailable. Try another approach or explain the limitation."
            ),
            Self::Timeout {
                backend,
                operation,
                timeout_ms,
            } => format!(
                "`{operation}` on `{backend}` did not answer within {}.",
                describe_wait(*timeout_ms)
            ),
            Self::Fatal(detail) => detail.clone(),
        };
        ToolResult::error(message)
    }
}

fn describe_wait(timeout_ms: u64) -> String {
    if timeout_ms < 1000 {
        format!("{timeout_ms} ms")
    } else {
        let seconds = timeout_ms.div_ceil(1000);
        format!("{seconds} second{}", if seconds == 1 { "" } else { "s" })
    }
}

/// The reasoning loop's view of the tool layer.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn capabilities(&self) -> Capabilities;

    async fn list_operations(&self, backend: &str) -> Result<Vec<String>, ToolInvokeError>;

    async fn invoke(
        &self,
        call: &ToolCall,
        timeout: Duration,
    ) -> Result<ToolResult, ToolInvokeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn columns_follow_first_record_and_missing_keys_become_null() {
        let table = TabularData::from_records(vec![
            record(json!({ "name": "Acme", "total_volume": 30 })),
            record(json!({ "total_volume": 20, "name": "Globex", "region": "EU" })),
            record(json!({ "name": "Initech" })),
        ]);

        assert_eq!(table.columns, vec!["name", "total_volume", "region"]);
        let first_keys: Vec<&String> = table.rows[1].keys().collect();
        assert_eq!(first_keys, vec!["name", "total_volume", "region"]);
        assert_eq!(table.rows[0]["region"], Value::Null);
        assert_eq!(table.rows[2]["total_volume"], Value::Null);
        assert_eq!(table.row_count(), 3);
    }

    #[test]
    fn tool_result_serializes_with_kind_tag() {
        let value = serde_json::to_value(ToolResult::error("boom")).unwrap();
        assert_eq!(value, json!({ "kind": "error", "message": "boom" }));
    }

    #[test]
    fn only_fatal_invoke_errors_are_unrecoverable() {
        assert!(ToolInvokeError::UnknownBackend("db".into()).is_recoverable());
        assert!(ToolInvokeError::BackendUnavailable {
            backend: "db".into(),
            reason: "refused".into()
        }
        .is_recoverable());
        assert!(!ToolInvokeError::Fatal("corrupt frame".into()).is_recoverable());
    }

    #[test]
    fn timeout_observation_reports_short_and_long_waits() {
        let message = |timeout_ms| match (ToolInvokeError::Timeout {
            backend: "database".into(),
            operation: "execute_sql".into(),
            timeout_ms,
        })
        .into_observation()
        {
            ToolResult::Error { message } => message,
            other => panic!("unexpected observation {other:?}"),
        };
        assert!(message(250).ends_with("within 250 ms."));
        assert!(message(1000).ends_with("within 1 second."));
        assert!(message(30_500).ends_with("within 31 seconds."));
    }

    #[test]
    fn unavailable_observation_hides_internal_reason() {
        let observation = ToolInvokeError::BackendUnavailable {
            backend: "database".into(),
            reason: "connection refused (os error 111)".into(),
        }
        .into_observation();
        match observation {
            ToolResult::Error { message } => {
                assert!(message.contains("database"));
                assert!(!message.contains("os error"));
            }
            other => panic!("unexpected observation {other:?}"),
        }
    }
}
