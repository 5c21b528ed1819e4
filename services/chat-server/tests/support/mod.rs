#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_agent::{
    Decision, DecisionError, DecisionRequest, DecisionStrategy, OperationInfo, ReasoningLoop,
    ToolCall,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chat_protocol::{Envelope, Message};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tool_gateway::{BackendCallError, BackendKind, ToolBackend, ToolGateway};

pub const WAIT: Duration = Duration::from_secs(5);

/// Replays decisions in order, then finishes.
pub struct ScriptedStrategy {
    decisions: TokioMutex<VecDeque<Decision>>,
    gate: Option<Arc<Notify>>,
    pub history_lengths: Mutex<Vec<usize>>,
}

impl ScriptedStrategy {
    pub fn new(decisions: Vec<Decision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: TokioMutex::new(decisions.into()),
            gate: None,
            history_lengths: Mutex::new(Vec::new()),
        })
    }

    /// Each decision waits for one `notify_one` on `gate`.
    pub fn gated(decisions: Vec<Decision>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            decisions: TokioMutex::new(decisions.into()),
            gate: Some(gate),
            history_lengths: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DecisionStrategy for ScriptedStrategy {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.history_lengths
            .lock()
            .unwrap()
            .push(request.history.len());
        Ok(self
            .decisions
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| finish("done")))
    }
}

/// Never finishes: keeps querying with a fresh argument.
pub struct RelentlessStrategy {
    calls: AtomicUsize,
}

impl RelentlessStrategy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DecisionStrategy for RelentlessStrategy {
    async fn decide(&self, _request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(call(
            "database",
            "execute_sql",
            json!({ "sql": format!("SELECT {n}") }),
        ))
    }
}

pub fn call(backend: &str, operation: &str, args: Value) -> Decision {
    let args = match args {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Decision::Call {
        thought: Some(format!("use {backend}.{operation}")),
        call: ToolCall::new(backend, operation, args),
    }
}

pub fn finish(answer: &str) -> Decision {
    Decision::Finish {
        thought: None,
        answer: answer.to_string(),
    }
}

/// In-memory MCP backend returning a fixed payload per operation.
pub struct FakeBackend {
    up: bool,
    payloads: Vec<(&'static str, Value)>,
}

#[async_trait]
impl ToolBackend for FakeBackend {
    async fn discover(&self) -> anyhow::Result<Vec<OperationInfo>> {
        if !self.up {
            return Err(anyhow!("connection refused"));
        }
        Ok(self
            .payloads
            .iter()
            .map(|(name, _)| OperationInfo::new(*name, ""))
            .collect())
    }

    async fn call(
        &self,
        operation: &str,
        _args: &Map<String, Value>,
        _timeout: Duration,
    ) -> Result<Value, BackendCallError> {
        self.payloads
            .iter()
            .find(|(name, _)| *name == operation)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| BackendCallError::Protocol(format!("no payload for {operation}")))
    }
}

pub fn top_merchants() -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": "[{\"name\":\"Acme\",\"total_volume\":300},{\"name\":\"Globex\",\"total_volume\":200},{\"name\":\"Initech\",\"total_volume\":100}]"
        }]
    })
}

pub fn bar_chart() -> Value {
    json!({
        "content": [{
            "type": "resource",
            "resource": {
                "uri": "ui://chart/bar-1",
                "mimeType": "text/html",
                "text": "<div class=\"chart\">top merchants</div>"
            }
        }]
    })
}

pub async fn analytics_gateway(database_up: bool) -> Arc<ToolGateway> {
    let gateway = ToolGateway::new();
    gateway
        .register_backend(
            "database",
            BackendKind::Database,
            Arc::new(FakeBackend {
                up: database_up,
                payloads: vec![("execute_sql", top_merchants())],
            }),
        )
        .await
        .unwrap();
    gateway
        .register_backend(
            "ui",
            BackendKind::Visualization,
            Arc::new(FakeBackend {
                up: true,
                payloads: vec![("show_chart", bar_chart())],
            }),
        )
        .await
        .unwrap();
    Arc::new(gateway)
}

pub fn agent(strategy: Arc<dyn DecisionStrategy>, gateway: Arc<ToolGateway>) -> Arc<ReasoningLoop> {
    Arc::new(ReasoningLoop::builder(strategy, gateway).max_steps(10).build())
}

pub fn query_frame(text: &str) -> String {
    Envelope::new(Message::query(text)).to_json().unwrap()
}

pub async fn next_message(rx: &mut UnboundedReceiver<Envelope>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("outbound channel closed")
        .message
}

/// Collects messages up to and including the next Response or Error.
pub async fn until_terminal(rx: &mut UnboundedReceiver<Envelope>) -> (Vec<Message>, Message) {
    let mut before = Vec::new();
    loop {
        let message = next_message(rx).await;
        if message.is_terminal() {
            return (before, message);
        }
        before.push(message);
    }
}

pub fn status_phase(message: &Message) -> Option<&str> {
    match message {
        Message::Status(status) => Some(status.phase.as_str()),
        _ => None,
    }
}
