use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::language_model::{LanguageModelClient, ModelOptions};
use crate::tool::{Capabilities, ToolCall, ToolResult};
use crate::trace::{truncate, TraceStep};

/// Rows of tabular output shown to the model per observation.
const OBSERVATION_ROW_PREVIEW: usize = 20;
const OBSERVATION_TEXT_PREVIEW: usize = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Call {
        thought: Option<String>,
        call: ToolCall,
    },
    Finish {
        thought: Option<String>,
        answer: String,
    },
}

/// A completed exchange from earlier in the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
}

pub struct DecisionRequest<'a> {
    pub query: &'a str,
    pub history: &'a [ConversationTurn],
    pub trace: &'a [TraceStep],
    pub capabilities: &'a Capabilities,
    /// Set when the previous attempt could not be parsed.
    pub correction: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision output could not be parsed: {reason}")]
    Malformed { reason: String, raw: String },
    #[error("decision model call failed: {0}")]
    Model(#[source] anyhow::Error),
}

/// Chooses the next step of a run.
#[async_trait]
pub trait DecisionStrategy: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError>;
}

#[derive(Debug, Clone)]
pub struct PromptConfig {
    pub system_prompt: String,
    pub model_options: ModelOptions,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.trim().to_string(),
            model_options: ModelOptions::default(),
        }
    }
}

/// Decides by prompting a language model for a JSON directive.
pub struct PromptedDecisionStrategy {
    model: Arc<dyn LanguageModelClient>,
    config: PromptConfig,
}

impl PromptedDecisionStrategy {
    pub fn new(model: Arc<dyn LanguageModelClient>, config: PromptConfig) -> Self {
        Self { model, config }
    }

    fn build_prompt(&self, request: &DecisionRequest<'_>) -> String {
        let mut prompt = String::new();
        prompt.push_str("You must decide the next best action given the conversation so far.\n\n");

        prompt.push_str("<<TOOLS>>\n");
        if request.capabilities.is_empty() {
            prompt.push_str("(no backends are currently reachable)\n");
        }
        for (backend, operations) in request.capabilities {
            prompt.push_str(&format!("backend `{backend}`:\n"));
            for operation in operations {
                prompt.push_str(&format!("- {}: {}\n", operation.name, operation.description));
                if !operation.input_schema.is_null() {
                    prompt.push_str(&format!(
                        "  input_schema: {}\n",
                        serde_json::to_string(&operation.input_schema)
                            .unwrap_or_else(|_| "{}".to_string())
                    ));
                }
            }
        }

        prompt.push_str("<<CONTEXT>>\n");
        for turn in request.history {
            prompt.push_str("User: ");
            prompt.push_str(&turn.query);
            prompt.push('\n');
            prompt.push_str("Agent: ");
            prompt.push_str(&turn.answer);
            prompt.push('\n');
        }
        for step in request.trace {
            if let Some(thought) = step.thought.as_deref() {
                prompt.push_str(&format!("Thought[{}]: {}\n", step.index, thought));
            }
            prompt.push_str(&format!(
                "ToolCall[{}]: {} {}\n",
                step.index,
                step.action.label(),
                serde_json::to_string(&step.action.args).unwrap_or_default()
            ));
            prompt.push_str(&format!(
                "Observation[{}]: {}\n",
                step.index,
                render_observation(&step.observation)
            ));
        }

        prompt.push_str("<<TASK>>\n");
        prompt.push_str(request.query);
        if let Some(correction) = request.correction {
            prompt.push_str("\n\n<<CORRECTION>>\n");
            prompt.push_str(correction);
        }
        prompt.push_str("\n\nRespond ONLY with JSON matching this schema:\n");
        prompt.push_str(JSON_SCHEMA_DESCRIPTION.trim());
        prompt
    }
}

#[async_trait]
impl DecisionStrategy for PromptedDecisionStrategy {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        let prompt = self.build_prompt(&request);
        let mut options = self.config.model_options.clone();
        options.system_prompt = Some(self.config.system_prompt.clone());

        let response = self
            .model
            .complete(&prompt, &options)
            .await
            .map_err(DecisionError::Model)?;
        debug!(chars = response.text.len(), "decision model responded");
        parse_decision(&response.text)
    }
}

/// Parses a model reply into a [`Decision`], tolerating code fences and
/// prose around a single JSON object.
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionError> {
    let directive = match serde_json::from_str::<ModelDirective>(raw.trim()) {
        Ok(directive) => directive,
        Err(first_err) => extract_json_object(raw)
            .and_then(|candidate| serde_json::from_str::<ModelDirective>(candidate).ok())
            .ok_or_else(|| DecisionError::Malformed {
                reason: first_err.to_string(),
                raw: raw.to_string(),
            })?,
    };

    match directive {
        ModelDirective::Tool {
            thought,
            backend,
            operation,
            args,
        } => {
            let args = match args {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(DecisionError::Malformed {
                        reason: format!("`args` must be a JSON object, got {other}"),
                        raw: raw.to_string(),
                    })
                }
            };
            if backend.trim().is_empty() || operation.trim().is_empty() {
                return Err(DecisionError::Malformed {
                    reason: "`backend` and `operation` must be non-empty".to_string(),
                    raw: raw.to_string(),
                });
            }
            Ok(Decision::Call {
                thought,
                call: ToolCall::new(backend, operation, args),
            })
        }
        ModelDirective::Finish { thought, answer } => Ok(Decision::Finish { thought, answer }),
    }
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn render_observation(observation: &ToolResult) -> String {
    match observation {
        ToolResult::Data(table) => {
            let preview: Vec<&crate::tool::Row> =
                table.rows.iter().take(OBSERVATION_ROW_PREVIEW).collect();
            let mut rendered = format!(
                "{} row(s), columns [{}]: {}",
                table.row_count(),
                table.columns.join(", "),
                serde_json::to_string(&preview).unwrap_or_default()
            );
            if table.row_count() > OBSERVATION_ROW_PREVIEW {
                rendered.push_str(&format!(
                    " (first {OBSERVATION_ROW_PREVIEW} rows shown)"
                ));
            }
            rendered
        }
        ToolResult::UiResource(resource) => {
            format!("rendered {} as {}", resource.uri, resource.mime_type)
        }
        ToolResult::Text { text } => truncate(text, OBSERVATION_TEXT_PREVIEW),
        ToolResult::Error { message } => format!("ERROR: {message}"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ModelDirective {
    Tool {
        thought: Option<String>,
        backend: String,
        operation: String,
        #[serde(default)]
        args: Value,
    },
    Finish {
        thought: Option<String>,
        answer: String,
    },
}

pub(crate) const CORRECTION_TEMPLATE: &str = "Your previous reply could not be parsed as a decision. \
Reply with exactly one JSON object of type \"tool\" or \"finish\" and nothing else.";

const JSON_SCHEMA_DESCRIPTION: &str = r#"{
  "type": "object",
  "required": ["type"],
  "properties": {
    "type": {
      "type": "string",
      "enum": ["tool", "finish"]
    },
    "thought": {
      "type": "string",
      "description": "Concise reasoning for the chosen action"
    },
    "backend": {
      "type": "string",
      "description": "When type=tool: the backend to call"
    },
    "operation": {
      "type": "string",
      "description": "When type=tool: one of that backend's operations"
    },
    "args": {
      "type": "object",
      "description": "JSON arguments for the selected operation"
    },
    "answer": {
      "type": "string",
      "description": "When finishing: final response for the user"
    }
  }
}"#;

const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are an analytics assistant for a loyalty and rewards business. You answer business questions by querying data and producing charts.
Rules:
- Use the database backend to fetch data before answering questions about numbers; never invent figures.
- Inspect the schema first when you are unsure of table or column names.
- When a chart would help, call a visualization operation with the rows you fetched; a rendered chart ends the task.
- After each tool call, wait for the observation before planning further. If a call fails, correct it or explain the limitation.
- When ready to respond to the user, emit type="finish" with a concise answer.
- Always respond with strict JSON matching the provided schema. Do not include any extra text, code fencing, or commentary.
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language_model::LanguageModelResponse;
    use crate::tool::{OperationInfo, TabularData};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingModel {
        responses: TokioMutex<VecDeque<String>>,
        prompts: TokioMutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModelClient for RecordingModel {
        async fn complete(
            &self,
            prompt: &str,
            _options: &ModelOptions,
        ) -> anyhow::Result<LanguageModelResponse> {
            self.prompts.lock().await.push(prompt.to_string());
            let next = self
                .responses
                .lock()
                .await
                .pop_front()
                .expect("recording model ran out of responses");
            Ok(LanguageModelResponse::new(next))
        }
    }

    fn capabilities() -> Capabilities {
        let mut caps = Capabilities::new();
        caps.insert(
            "database".to_string(),
            vec![OperationInfo::new("query", "Run a read-only SQL query")],
        );
        caps
    }

    #[test]
    fn parses_tool_directive() {
        let decision = parse_decision(
            &json!({
                "type": "tool",
                "thought": "need data",
                "backend": "database",
                "operation": "query",
                "args": { "sql": "select 1" }
            })
            .to_string(),
        )
        .unwrap();
        match decision {
            Decision::Call { thought, call } => {
                assert_eq!(thought.as_deref(), Some("need data"));
                assert_eq!(call.label(), "database.query");
                assert_eq!(call.args["sql"], "select 1");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn parses_directive_wrapped_in_code_fence() {
        let raw = "```json\n{\"type\":\"finish\",\"answer\":\"All done\"}\n```";
        assert_eq!(
            parse_decision(raw).unwrap(),
            Decision::Finish {
                thought: None,
                answer: "All done".into()
            }
        );
    }

    #[test]
    fn rejects_prose_and_non_object_args() {
        assert!(matches!(
            parse_decision("I think we should query the database"),
            Err(DecisionError::Malformed { .. })
        ));
        assert!(matches!(
            parse_decision(r#"{"type":"tool","backend":"database","operation":"query","args":[1]}"#),
            Err(DecisionError::Malformed { .. })
        ));
        assert!(matches!(
            parse_decision(r#"{"type":"wander"}"#),
            Err(DecisionError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn prompt_contains_tools_trace_history_and_correction() {
        let model = Arc::new(RecordingModel {
            responses: TokioMutex::new(VecDeque::from(vec![
                r#"{"type":"finish","answer":"ok"}"#.to_string(),
            ])),
            prompts: TokioMutex::new(Vec::new()),
        });
        let strategy = PromptedDecisionStrategy::new(model.clone(), PromptConfig::default());

        let trace = vec![TraceStep {
            index: 1,
            thought: Some("look at merchants".into()),
            action: ToolCall::new("database", "query", Map::new()),
            observation: ToolResult::Data(TabularData::from_records(vec![json!({
                "name": "Acme"
            })
            .as_object()
            .cloned()
            .unwrap()])),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }];
        let history = vec![ConversationTurn {
            query: "How many merchants?".into(),
            answer: "There are 12.".into(),
        }];
        let caps = capabilities();

        let decision = strategy
            .decide(DecisionRequest {
                query: "Top merchants?",
                history: &history,
                trace: &trace,
                capabilities: &caps,
                correction: Some(CORRECTION_TEMPLATE),
            })
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Finish { .. }));

        let prompts = model.prompts.lock().await;
        let prompt = &prompts[0];
        assert!(prompt.contains("backend `database`"));
        assert!(prompt.contains("- query: Run a read-only SQL query"));
        assert!(prompt.contains("User: How many merchants?"));
        assert!(prompt.contains("Observation[1]: 1 row(s), columns [name]"));
        assert!(prompt.contains("<<CORRECTION>>"));
        assert!(prompt.contains("Top merchants?"));
    }
}
