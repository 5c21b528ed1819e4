use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tool::{TabularData, ToolCall, ToolResult, UiResource};

/// Coarse position of a run inside the decide, act, observe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reasoning,
    Acting,
    Observing,
    Finalizing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Reasoning => "reasoning",
            Phase::Acting => "acting",
            Phase::Observing => "observing",
            Phase::Finalizing => "finalizing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub thought: Option<String>,
    pub action: ToolCall,
    pub observation: ToolResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    StepBudget,
    WallClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("decision output unparseable after retry: {detail}")]
    MalformedDecision { detail: String },
    #[error("tool gateway failure: {detail}")]
    Gateway { detail: String },
    #[error("language model failure: {detail}")]
    Model { detail: String },
    #[error("the language model is not configured")]
    ModelNotConfigured,
    #[error("run cancelled")]
    Cancelled,
}

impl RunFailure {
    /// Plain-language text safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            RunFailure::MalformedDecision { .. } => {
                "Sorry, I couldn't determine how to answer that. Please try rephrasing your question."
            }
            RunFailure::Gateway { .. } => {
                "The analytics service is temporarily unavailable. Please try again later."
            }
            RunFailure::Model { .. } => {
                "The language model could not be reached. Please try again in a moment."
            }
            RunFailure::ModelNotConfigured => {
                "The language model is not configured. Please contact the administrator."
            }
            RunFailure::Cancelled => "The request was cancelled.",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunFailure::MalformedDecision { .. } => "malformed_decision",
            RunFailure::Gateway { .. } => "gateway_failure",
            RunFailure::Model { .. } => "model_failure",
            RunFailure::ModelNotConfigured => "model_not_configured",
            RunFailure::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed { failure: RunFailure },
    Exhausted { reason: ExhaustReason },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
    pub data: Option<TabularData>,
    pub ui_resource: Option<UiResource>,
}

/// One query's full reasoning lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub query: String,
    pub step_budget: usize,
    pub trace: Vec<TraceStep>,
    pub status: RunStatus,
    pub answer: Option<FinalAnswer>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(query: impl Into<String>, step_budget: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            step_budget,
            trace: Vec::new(),
            status: RunStatus::Running,
            answer: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn steps(&self) -> usize {
        self.trace.len()
    }

    pub fn budget_spent(&self) -> bool {
        self.trace.len() >= self.step_budget
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, RunStatus::Running)
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.status, RunStatus::Exhausted { .. })
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match &self.status {
            RunStatus::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    pub fn last_data(&self) -> Option<&TabularData> {
        self.trace.iter().rev().find_map(|step| match &step.observation {
            ToolResult::Data(table) => Some(table),
            _ => None,
        })
    }

    pub fn last_ui_resource(&self) -> Option<&UiResource> {
        self.trace.iter().rev().find_map(|step| match &step.observation {
            ToolResult::UiResource(resource) => Some(resource),
            _ => None,
        })
    }

    pub(crate) fn record(&mut self, step: TraceStep) {
        debug_assert!(self.trace.len() < self.step_budget);
        self.trace.push(step);
    }

    pub(crate) fn finish(&mut self, status: RunStatus, answer: Option<FinalAnswer>) {
        self.status = status;
        self.answer = answer;
        self.finished_at = Some(Utc::now());
    }

    /// Human-readable rendering used behind the "show reasoning" toggle.
    pub fn render_trace(&self) -> String {
        let mut out = String::new();
        for step in &self.trace {
            let _ = writeln!(out, "Step {}:", step.index);
            if let Some(thought) = step.thought.as_deref() {
                let _ = writeln!(out, "  Thought: {thought}");
            }
            let _ = writeln!(
                out,
                "  Action: {} {}",
                step.action.label(),
                serde_json::Value::Object(step.action.args.clone())
            );
            let _ = writeln!(out, "  Observation: {}", summarize_observation(&step.observation));
        }
        out.trim_end().to_string()
    }
}

/// One-line summary of an observation.
pub fn summarize_observation(observation: &ToolResult) -> String {
    match observation {
        ToolResult::Data(table) => format!(
            "{} row(s) with columns [{}]",
            table.row_count(),
            table.columns.join(", ")
        ),
        ToolResult::UiResource(resource) => {
            format!("rendered {} ({})", resource.uri, resource.mime_type)
        }
        ToolResult::Text { text } => truncate(text, 200),
        ToolResult::Error { message } => format!("error: {}", truncate(message, 200)),
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn step(index: usize, observation: ToolResult) -> TraceStep {
        TraceStep {
            index,
            thought: Some(format!("thinking {index}")),
            action: ToolCall::new("database", "query", Map::new()),
            observation,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn last_data_prefers_most_recent_table() {
        let mut run = Run::new("q", 5);
        let older = TabularData::from_records(vec![json!({ "a": 1 })
            .as_object()
            .cloned()
            .unwrap()]);
        let newer = TabularData::from_records(vec![json!({ "b": 2 })
            .as_object()
            .cloned()
            .unwrap()]);
        run.record(step(1, ToolResult::Data(older)));
        run.record(step(2, ToolResult::Data(newer.clone())));
        run.record(step(3, ToolResult::error("late failure")));
        assert_eq!(run.last_data(), Some(&newer));
        assert!(run.last_ui_resource().is_none());
    }

    #[test]
    fn render_trace_lists_each_step() {
        let mut run = Run::new("q", 5);
        run.record(step(1, ToolResult::text("hello")));
        run.record(step(2, ToolResult::error("syntax error at or near SELEC")));
        let rendered = run.render_trace();
        assert!(rendered.starts_with("Step 1:"));
        assert!(rendered.contains("Action: database.query {}"));
        assert!(rendered.contains("Observation: error: syntax error"));
    }

    #[test]
    fn failures_expose_stable_codes() {
        let failure = RunFailure::MalformedDecision {
            detail: "expected value at line 1".into(),
        };
        assert_eq!(failure.code(), "malformed_decision");
        assert!(!failure.user_message().contains("line 1"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("ok", 5), "ok");
    }
}
