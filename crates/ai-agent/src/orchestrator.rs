use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::decision::{
    ConversationTurn, Decision, DecisionError, DecisionRequest, DecisionStrategy,
    CORRECTION_TEMPLATE,
};
use crate::language_model::ModelNotConfigured;
use crate::tool::{Capabilities, ToolCall, ToolExecutor, ToolInvokeError, ToolResult};
use crate::trace::{
    summarize_observation, truncate, ExhaustReason, FinalAnswer, Phase, Run, RunFailure,
    RunStatus, TraceStep,
};

/// Unparseable decisions tolerated per step before the run fails.
const MALFORMED_RETRIES: usize = 1;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub tool_timeout: Duration,
    /// Total wall-clock ceiling per run; reaching it counts as exhaustion.
    pub run_deadline: Option<Duration>,
    /// End the run early after this many error observations in a row.
    pub max_consecutive_failures: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: crate::DEFAULT_AGENT_MAX_STEPS,
            tool_timeout: crate::DEFAULT_TOOL_TIMEOUT,
            run_deadline: None,
            max_consecutive_failures: None,
        }
    }
}

/// Progress notifications emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started { run_id: String },
    PhaseChanged { phase: Phase, step: usize },
    Acting {
        step: usize,
        backend: String,
        operation: String,
    },
    Observed { step: usize, kind: String },
}

pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: RunEvent);
}

impl RunObserver for UnboundedSender<RunEvent> {
    fn on_event(&self, event: RunEvent) {
        let _ = self.send(event);
    }
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn on_event(&self, _event: RunEvent) {}
}

enum Interrupt {
    Cancelled,
    Deadline,
}

/// Drives one query through reasoning, acting and observing until it
/// finishes, fails, or runs out of steps.
pub struct ReasoningLoop {
    strategy: Arc<dyn DecisionStrategy>,
    tools: Arc<dyn ToolExecutor>,
    config: AgentConfig,
}

impl ReasoningLoop {
    pub fn builder(
        strategy: Arc<dyn DecisionStrategy>,
        tools: Arc<dyn ToolExecutor>,
    ) -> ReasoningLoopBuilder {
        ReasoningLoopBuilder {
            strategy,
            tools,
            config: AgentConfig::default(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn run(
        &self,
        query: &str,
        history: &[ConversationTurn],
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Run {
        let mut run = Run::new(query, self.config.max_steps);
        let span = info_span!("run", run_id = %run.id);
        self.drive(&mut run, history, observer, cancel)
            .instrument(span)
            .await;
        run
    }

    async fn drive(
        &self,
        run: &mut Run,
        history: &[ConversationTurn],
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
    ) {
        let deadline = self.config.run_deadline.map(|limit| Instant::now() + limit);
        info!(budget = run.step_budget, "run started");
        observer.on_event(RunEvent::Started {
            run_id: run.id.clone(),
        });

        let capabilities = match self
            .guarded(self.tools.capabilities(), cancel, deadline)
            .await
        {
            Ok(capabilities) => capabilities,
            Err(interrupt) => return self.interrupted(run, interrupt),
        };

        let mut consecutive_failures = 0usize;
        loop {
            if run.budget_spent() {
                return self.exhaust(run, ExhaustReason::StepBudget);
            }
            let step = run.steps() + 1;

            observer.on_event(RunEvent::PhaseChanged {
                phase: Phase::Reasoning,
                step,
            });
            let decision = match self
                .guarded(self.decide(run, history, &capabilities), cancel, deadline)
                .await
            {
                Ok(Ok(decision)) => decision,
                Ok(Err(failure)) => return self.fail(run, failure),
                Err(interrupt) => return self.interrupted(run, interrupt),
            };

            let (thought, call) = match decision {
                Decision::Finish { answer, .. } => {
                    observer.on_event(RunEvent::PhaseChanged {
                        phase: Phase::Finalizing,
                        step,
                    });
                    return self.complete(run, answer);
                }
                Decision::Call { thought, call } => (thought, call),
            };

            observer.on_event(RunEvent::Acting {
                step,
                backend: call.backend.clone(),
                operation: call.operation.clone(),
            });
            let started_at = Utc::now();
            let observation = match self.guarded(self.act(run, &call), cancel, deadline).await {
                Ok(Ok(observation)) => observation,
                Ok(Err(failure)) => return self.fail(run, failure),
                Err(interrupt) => return self.interrupted(run, interrupt),
            };

            observer.on_event(RunEvent::PhaseChanged {
                phase: Phase::Observing,
                step,
            });
            debug!(
                step,
                action = %call.label(),
                observation = %summarize_observation(&observation),
                "observed"
            );
            let kind = observation.kind();
            let terminal_visual = matches!(observation, ToolResult::UiResource(_));
            let failed = observation.is_error();
            run.record(TraceStep {
                index: step,
                thought,
                action: call,
                observation,
                started_at,
                finished_at: Utc::now(),
            });
            observer.on_event(RunEvent::Observed {
                step,
                kind: kind.to_string(),
            });

            if terminal_visual {
                observer.on_event(RunEvent::PhaseChanged {
                    phase: Phase::Finalizing,
                    step,
                });
                let answer = visualization_answer(run);
                return self.complete(run, answer);
            }

            if failed {
                consecutive_failures += 1;
                if let Some(limit) = self.config.max_consecutive_failures {
                    if consecutive_failures >= limit {
                        warn!(consecutive_failures, "stopping after repeated tool failures");
                        return self.complete(
                            run,
                            "I wasn't able to retrieve the data: the data tools kept failing. \
                             Please try again later or rephrase your question."
                                .to_string(),
                        );
                    }
                }
            } else {
                consecutive_failures = 0;
            }
        }
    }

    async fn decide(
        &self,
        run: &Run,
        history: &[ConversationTurn],
        capabilities: &Capabilities,
    ) -> Result<Decision, RunFailure> {
        let mut correction: Option<String> = None;
        let mut malformed = 0usize;
        loop {
            let request = DecisionRequest {
                query: &run.query,
                history,
                trace: &run.trace,
                capabilities,
                correction: correction.as_deref(),
            };
            match self.strategy.decide(request).await {
                Ok(decision) => return Ok(decision),
                Err(DecisionError::Malformed { reason, raw }) => {
                    malformed += 1;
                    warn!(
                        attempt = malformed,
                        error = %reason,
                        raw = %truncate(&raw, 300),
                        "decision output unparseable"
                    );
                    if malformed > MALFORMED_RETRIES {
                        return Err(RunFailure::MalformedDecision { detail: reason });
                    }
                    correction = Some(format!("{CORRECTION_TEMPLATE} Parser error: {reason}"));
                }
                Err(DecisionError::Model(err)) => {
                    if err.downcast_ref::<ModelNotConfigured>().is_some() {
                        return Err(RunFailure::ModelNotConfigured);
                    }
                    return Err(RunFailure::Model {
                        detail: format!("{err:#}"),
                    });
                }
            }
        }
    }

    async fn act(&self, run: &Run, call: &ToolCall) -> Result<ToolResult, RunFailure> {
        if let Some(previous) = run.trace.iter().find(|step| &step.action == call) {
            debug!(action = %call.label(), repeat_of = previous.index, "repeated tool call");
            return Ok(ToolResult::error(format!(
                "This exact call was already made in step {}; its observation is above. \
                 Change the arguments, try another operation, or finish.",
                previous.index
            )));
        }

        let operations = match self.tools.list_operations(&call.backend).await {
            Ok(operations) => operations,
            Err(err) => return recover(call, err),
        };
        if !operations.iter().any(|name| name == &call.operation) {
            debug!(action = %call.label(), "operation not offered by backend");
            return Ok(ToolInvokeError::UnknownOperation {
                backend: call.backend.clone(),
                operation: call.operation.clone(),
            }
            .into_observation());
        }

        match self.tools.invoke(call, self.config.tool_timeout).await {
            Ok(result) => Ok(result),
            Err(err) => recover(call, err),
        }
    }

    async fn guarded<F: Future>(
        &self,
        future: F,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<F::Output, Interrupt> {
        let ceiling = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = ceiling => Err(Interrupt::Deadline),
            output = future => Ok(output),
        }
    }

    fn complete(&self, run: &mut Run, text: String) {
        let answer = FinalAnswer {
            text,
            data: run.last_data().cloned(),
            ui_resource: run.last_ui_resource().cloned(),
        };
        info!(steps = run.steps(), "run completed");
        run.finish(RunStatus::Completed, Some(answer));
    }

    fn exhaust(&self, run: &mut Run, reason: ExhaustReason) {
        let mut text = match reason {
            ExhaustReason::StepBudget => format!(
                "I couldn't complete this within the {}-step limit.",
                run.step_budget
            ),
            ExhaustReason::WallClock => "I couldn't complete this within the time limit.".to_string(),
        };
        if run.trace.is_empty() {
            text.push_str(" No steps were completed.");
        } else {
            text.push_str(" Here's how far I got:");
            for step in &run.trace {
                text.push_str(&format!(
                    "\n- Step {}: {} -> {}",
                    step.index,
                    step.action.label(),
                    summarize_observation(&step.observation)
                ));
            }
        }
        let answer = FinalAnswer {
            text,
            data: run.last_data().cloned(),
            ui_resource: None,
        };
        warn!(steps = run.steps(), ?reason, "run exhausted");
        run.finish(RunStatus::Exhausted { reason }, Some(answer));
    }

    fn fail(&self, run: &mut Run, failure: RunFailure) {
        warn!(steps = run.steps(), error = %failure, "run failed");
        run.finish(RunStatus::Failed { failure }, None);
    }

    fn interrupted(&self, run: &mut Run, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Cancelled => self.fail(run, RunFailure::Cancelled),
            Interrupt::Deadline => self.exhaust(run, ExhaustReason::WallClock),
        }
    }
}

fn recover(call: &ToolCall, err: ToolInvokeError) -> Result<ToolResult, RunFailure> {
    if err.is_recoverable() {
        warn!(action = %call.label(), error = %err, "tool call failed");
        Ok(err.into_observation())
    } else {
        Err(RunFailure::Gateway {
            detail: err.to_string(),
        })
    }
}

fn visualization_answer(run: &Run) -> String {
    match run.last_data() {
        Some(table) if !table.is_empty() => format!(
            "Here are the results ({} row(s)) with a visualization.",
            table.row_count()
        ),
        _ => "Here is the visualization you asked for.".to_string(),
    }
}

pub struct ReasoningLoopBuilder {
    strategy: Arc<dyn DecisionStrategy>,
    tools: Arc<dyn ToolExecutor>,
    config: AgentConfig,
}

impl ReasoningLoopBuilder {
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = max_steps.max(1);
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout = timeout;
        self
    }

    pub fn run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.config.run_deadline = deadline;
        self
    }

    pub fn max_consecutive_failures(mut self, limit: Option<usize>) -> Self {
        self.config.max_consecutive_failures = limit;
        self
    }

    pub fn build(self) -> ReasoningLoop {
        ReasoningLoop {
            strategy: self.strategy,
            tools: self.tools,
            config: self.config,
        }
    }
}
