//! Maps backend-specific payloads onto [`ToolResult`]. Pure and total: every
//! JSON value produces a result, nothing here returns an error or panics.

use ai_agent::{Row, TabularData, ToolResult, UiResource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ROW_KEYS: [&str; 4] = ["rows", "data", "results", "records"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Database,
    Sandbox,
    Visualization,
    Generic,
}

impl BackendKind {
    /// Guesses the kind from a registration name.
    pub fn infer(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
        if has(&["postgres", "database", "sql", "db", "warehouse"]) {
            BackendKind::Database
        } else if has(&["sandbox", "e2b", "exec", "code", "python"]) {
            BackendKind::Sandbox
        } else if has(&["ui", "chart", "viz", "visual", "plot"]) {
            BackendKind::Visualization
        } else {
            BackendKind::Generic
        }
    }
}

pub fn normalize(kind: BackendKind, raw: &Value) -> ToolResult {
    match raw {
        Value::Object(map) if is_mcp_envelope(map) => normalize_mcp(kind, map),
        other => normalize_payload(kind, other),
    }
}

fn is_mcp_envelope(map: &Map<String, Value>) -> bool {
    map.contains_key("content") || map.contains_key("isError") || map.contains_key("structuredContent")
}

fn normalize_mcp(kind: BackendKind, map: &Map<String, Value>) -> ToolResult {
    let items = map
        .get("content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let text = items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    if map.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = if text.trim().is_empty() {
            "the backend reported an error without details".to_string()
        } else {
            text.trim().to_string()
        };
        return ToolResult::error(message);
    }

    if let Some(resource) = items.iter().enumerate().find_map(|(idx, item)| ui_item(idx, item)) {
        return ToolResult::UiResource(resource);
    }

    match map.get("structuredContent") {
        Some(structured) if !structured.is_null() => return normalize_payload(kind, structured),
        _ => {}
    }

    if items.is_empty() || text.trim().is_empty() {
        return ToolResult::Data(TabularData::empty());
    }
    normalize_text(kind, &text)
}

/// Embedded resources and images inside an MCP content list.
fn ui_item(idx: usize, item: &Value) -> Option<UiResource> {
    match item.get("type").and_then(Value::as_str)? {
        "resource" => {
            let resource = item.get("resource")?.as_object()?;
            resource_from_object(resource)
        }
        "image" => {
            let data = item.get("data").and_then(Value::as_str)?;
            let mime_type = item
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(UiResource {
                uri: format!("ui://image/{idx}"),
                mime_type: mime_type.to_string(),
                content: data.to_string(),
                encoding: "base64".to_string(),
            })
        }
        _ => None,
    }
}

fn resource_from_object(map: &Map<String, Value>) -> Option<UiResource> {
    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    };
    let uri = str_field(&["uri"]).unwrap_or_else(|| "ui://resource".to_string());
    let mime_type = str_field(&["mimeType", "mime_type"]);
    let is_ui = uri.starts_with("ui://") || mime_type.is_some();
    if !is_ui {
        return None;
    }

    let (content, encoding) = if let Some(text) = str_field(&["text", "content", "html"]) {
        let encoding = str_field(&["encoding"]).unwrap_or_else(|| "text".to_string());
        (text, encoding)
    } else {
        (str_field(&["blob"])?, "base64".to_string())
    };
    Some(UiResource {
        uri,
        mime_type: mime_type.unwrap_or_else(|| "text/html".to_string()),
        content,
        encoding,
    })
}

fn normalize_text(kind: BackendKind, text: &str) -> ToolResult {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ToolResult::Data(TabularData::empty());
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            if !parsed.is_string() {
                return normalize_payload(kind, &parsed);
            }
        }
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("error:") || lower.starts_with("error executing") {
        return ToolResult::error(trimmed);
    }
    if kind == BackendKind::Visualization && looks_like_markup(trimmed) {
        return ToolResult::UiResource(UiResource {
            uri: "ui://chart/inline".to_string(),
            mime_type: "text/html".to_string(),
            content: trimmed.to_string(),
            encoding: "text".to_string(),
        });
    }
    ToolResult::text(trimmed)
}

fn looks_like_markup(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html") || lower.starts_with("<div")
        || lower.starts_with("<svg")
}

fn normalize_payload(kind: BackendKind, value: &Value) -> ToolResult {
    match value {
        Value::Null => ToolResult::Data(TabularData::empty()),
        Value::Array(items) => normalize_array(items, None),
        Value::Object(map) => normalize_object(kind, map),
        Value::String(text) => normalize_text(kind, text),
        Value::Bool(_) | Value::Number(_) => ToolResult::text(value.to_string()),
    }
}

fn normalize_array(items: &[Value], columns: Option<&[Value]>) -> ToolResult {
    if items.iter().all(Value::is_object) {
        let records = items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect();
        return ToolResult::Data(TabularData::from_records(records));
    }

    if let Some(columns) = columns {
        let names: Vec<String> = columns
            .iter()
            .map(|column| match column {
                Value::String(name) => name.clone(),
                Value::Object(meta) => meta
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                other => other.to_string(),
            })
            .collect();
        if items.iter().all(Value::is_array) {
            let records = items
                .iter()
                .filter_map(Value::as_array)
                .map(|cells| {
                    names
                        .iter()
                        .cloned()
                        .zip(cells.iter().cloned().chain(std::iter::repeat(Value::Null)))
                        .collect::<Row>()
                })
                .collect();
            let mut table = TabularData::from_records(records);
            if table.columns.is_empty() {
                table.columns = names;
            }
            return ToolResult::Data(table);
        }
    }

    ToolResult::text(Value::Array(items.to_vec()).to_string())
}

fn normalize_object(kind: BackendKind, map: &Map<String, Value>) -> ToolResult {
    if let Some(message) = error_indicator(map) {
        return ToolResult::error(message);
    }

    if map.contains_key("stdout") || map.contains_key("stderr") || map.contains_key("exit_code") {
        return normalize_execution(kind, map);
    }

    if map.contains_key("html") || map.contains_key("uri") || map.contains_key("mimeType") {
        if let Some(resource) = resource_from_object(map) {
            return ToolResult::UiResource(resource);
        }
        if let Some(html) = map.get("html").and_then(Value::as_str) {
            return ToolResult::UiResource(UiResource {
                uri: "ui://chart/inline".to_string(),
                mime_type: "text/html".to_string(),
                content: html.to_string(),
                encoding: "text".to_string(),
            });
        }
    }

    for key in ROW_KEYS {
        match map.get(key) {
            Some(Value::Array(items)) => {
                let columns = map.get("columns").and_then(Value::as_array).map(Vec::as_slice);
                return normalize_array(items, columns);
            }
            Some(Value::Null) => return ToolResult::Data(TabularData::empty()),
            _ => {}
        }
    }

    if map.is_empty() {
        return ToolResult::Data(TabularData::empty());
    }
    if kind == BackendKind::Database {
        return ToolResult::Data(TabularData::from_records(vec![map.clone()]));
    }
    ToolResult::text(Value::Object(map.clone()).to_string())
}

fn error_indicator(map: &Map<String, Value>) -> Option<String> {
    let explicit_failure = map.get("success").and_then(Value::as_bool) == Some(false)
        || map.get("status").and_then(Value::as_str) == Some("error");

    let detail = match map.get("error") {
        Some(Value::String(message)) if !message.trim().is_empty() => Some(message.trim().to_string()),
        Some(Value::Object(err)) => Some(
            err.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(err.clone()).to_string()),
        ),
        Some(Value::Bool(true)) => Some(String::new()),
        _ => None,
    };

    match (detail, explicit_failure) {
        (Some(message), _) if !message.is_empty() => Some(message),
        (Some(_), _) | (None, true) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .unwrap_or("the backend reported an error without details")
                .to_string(),
        ),
        (None, false) => None,
    }
}

fn normalize_execution(kind: BackendKind, map: &Map<String, Value>) -> ToolResult {
    let stdout = map.get("stdout").map(join_stream).unwrap_or_default();
    let stderr = map.get("stderr").map(join_stream).unwrap_or_default();
    let exit_code = map.get("exit_code").and_then(Value::as_i64).unwrap_or(0);

    if exit_code != 0 {
        let detail = if stderr.trim().is_empty() {
            format!("execution exited with status {exit_code}")
        } else {
            stderr.trim().to_string()
        };
        return ToolResult::error(detail);
    }
    if stdout.trim().is_empty() && !stderr.trim().is_empty() {
        return ToolResult::text(format!("stderr: {}", stderr.trim()));
    }
    normalize_text(kind, &stdout)
}

/// Sandboxes report a stream as a string or as a list of chunks.
fn join_stream(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(chunks) => chunks
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
