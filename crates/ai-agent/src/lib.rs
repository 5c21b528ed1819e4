//! Reasoning loop for the analytics chat backend.
//! The crate drives a bounded decide, act, observe cycle over a set of tool
//! backends, with the decision step delegated to a pluggable strategy
//! (normally a prompted language model).

use std::time::Duration;

pub mod decision;
pub mod language_model;
pub mod openai;
pub mod orchestrator;
pub mod tool;
pub mod trace;

pub use decision::{
    parse_decision, ConversationTurn, Decision, DecisionError, DecisionRequest,
    DecisionStrategy, PromptConfig, PromptedDecisionStrategy,
};
pub use language_model::{
    LanguageModelClient, LanguageModelResponse, LanguageModelUsage, ModelNotConfigured, ModelOptions,
};
pub use openai::{OpenAiChatClient, OpenAiConfig};
pub use orchestrator::{
    AgentConfig, NoopObserver, ReasoningLoop, ReasoningLoopBuilder, RunEvent, RunObserver,
};
pub use tool::{
    Capabilities, OperationInfo, Row, TabularData, ToolCall, ToolExecutor, ToolInvokeError,
    ToolResult, UiResource,
};
pub use trace::{ExhaustReason, FinalAnswer, Phase, Run, RunFailure, RunStatus, TraceStep};

pub const DEFAULT_AGENT_MAX_STEPS: usize = 10;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
