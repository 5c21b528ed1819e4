//! One chat session: decodes client frames, starts runs, and is the only
//! writer of outbound messages for its connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ai_agent::{ConversationTurn, ReasoningLoop, Run, RunEvent, RunFailure, RunObserver, RunStatus};
use chat_protocol::{Envelope, Message, QueryPayload, ResponsePayload, UiResourcePayload};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::config::SessionSettings;
use crate::limits::{validate_query, RateLimiter};

/// Outbound half of a session. Once closed, nothing more is sent.
#[derive(Clone)]
struct Outbound {
    tx: UnboundedSender<Envelope>,
    open: Arc<AtomicBool>,
}

impl Outbound {
    fn send(&self, message: Message) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(Envelope::new(message)).is_ok()
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Memory {
    history: VecDeque<ConversationTurn>,
    last_run: Option<Run>,
    /// Bumped by every clear. A run started before the latest clear does
    /// not write back into memory.
    generation: u64,
}

struct ActiveRun {
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

/// Turns reasoning-loop events into coarse status messages.
struct StatusRelay {
    outbound: Outbound,
}

impl RunObserver for StatusRelay {
    fn on_event(&self, event: RunEvent) {
        if let RunEvent::Acting {
            step,
            backend,
            operation,
        } = event
        {
            self.outbound.send(Message::status(
                "acting",
                Some(format!("Step {step}: running {operation} on {backend}")),
            ));
        }
    }
}

pub struct Session {
    id: String,
    agent: Arc<ReasoningLoop>,
    settings: SessionSettings,
    outbound: Outbound,
    limiter: RateLimiter,
    memory: Arc<Mutex<Memory>>,
    active: Option<ActiveRun>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        agent: Arc<ReasoningLoop>,
        settings: SessionSettings,
        outbound: UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            id: id.into(),
            agent,
            limiter: RateLimiter::new(settings.rate_limit),
            settings,
            outbound: Outbound {
                tx: outbound,
                open: Arc::new(AtomicBool::new(true)),
            },
            memory: Arc::new(Mutex::new(Memory::default())),
            active: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn on_connect(&self) {
        info!(session_id = %self.id, "session opened");
        self.outbound.send(Message::status(
            "connected",
            Some("Connected to analytics service".into()),
        ));
    }

    /// Handles one inbound text frame.
    pub fn on_message(&mut self, raw: &str) {
        let envelope = match Envelope::decode_client(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "dropping undecodable message");
                self.outbound.send(Message::error(
                    "That message could not be understood.",
                    "invalid_message",
                ));
                return;
            }
        };

        debug!(session_id = %self.id, kind = envelope.kind().as_str(), message_id = %envelope.message_id, "inbound message");
        match envelope.message {
            Message::Query(query) => self.on_query(query),
            Message::Ping => {
                self.outbound.send(Message::Pong);
            }
            Message::Pong => {}
            Message::ClearSession => self.clear(),
            other => {
                warn!(session_id = %self.id, kind = other.kind().as_str(), "unexpected inbound message");
                self.outbound.send(Message::error(
                    "That message could not be understood.",
                    "invalid_message",
                ));
            }
        }
    }

    /// Rejects a frame that is not text.
    pub fn on_binary(&self) {
        self.outbound.send(Message::error(
            "Binary messages are not supported.",
            "invalid_message",
        ));
    }

    pub fn send_ping(&self) {
        self.outbound.send(Message::Ping);
    }

    pub fn is_busy(&self) -> bool {
        // Runs finish under the memory lock, so holding it here never
        // observes a run that is idle but has not sent its reply yet.
        let _memory = self.memory();
        self.active
            .as_ref()
            .map_or(false, |run| run.running.load(Ordering::SeqCst))
    }

    /// Completed turns currently remembered.
    pub fn history(&self) -> Vec<ConversationTurn> {
        self.memory().history.iter().cloned().collect()
    }

    /// The most recently finished run, kept for diagnostics.
    pub fn last_run(&self) -> Option<Run> {
        self.memory().last_run.clone()
    }

    fn memory(&self) -> MutexGuard<'_, Memory> {
        lock_memory(&self.memory)
    }

    fn on_query(&mut self, query: QueryPayload) {
        if self.is_busy() {
            debug!(session_id = %self.id, "query rejected while a run is active");
            self.outbound.send(Message::status(
                "busy",
                Some("A query is already being processed. Please wait for it to finish.".into()),
            ));
            return;
        }

        let text = match validate_query(&query.text, self.settings.max_query_length) {
            Ok(text) => text.to_string(),
            Err(rejection) => {
                self.outbound
                    .send(Message::error(rejection.user_message(), "invalid_query"));
                return;
            }
        };

        if let Err(retry_after) = self.limiter.try_acquire() {
            warn!(session_id = %self.id, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
            self.outbound.send(Message::error(
                format!(
                    "Too many questions. Please try again in {} minutes.",
                    retry_after.as_secs().div_ceil(60).max(1)
                ),
                "rate_limited",
            ));
            return;
        }

        self.start_run(text);
    }

    fn start_run(&mut self, query: String) {
        self.outbound.send(Message::status(
            "processing",
            Some("Analyzing your query...".into()),
        ));

        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let (history, generation) = {
            let memory = self.memory();
            (memory.history.iter().cloned().collect::<Vec<_>>(), memory.generation)
        };
        let agent = self.agent.clone();
        let memory = self.memory.clone();
        let outbound = self.outbound.clone();
        let history_turns = self.settings.history_turns;
        let run_cancel = cancel.clone();
        let run_running = running.clone();

        let task = async move {
            let relay = StatusRelay {
                outbound: outbound.clone(),
            };
            let run = agent.run(&query, &history, &relay, &run_cancel).await;
            let reply = terminal_message(&run);
            let mut memory = lock_memory(&memory);
            if memory.generation == generation {
                if let Some(answer) = run.answer.as_ref() {
                    memory.history.push_back(ConversationTurn {
                        query: query.clone(),
                        answer: answer.text.clone(),
                    });
                    while memory.history.len() > history_turns {
                        memory.history.pop_front();
                    }
                }
                memory.last_run = Some(run);
            } else {
                debug!("session cleared during the run; not remembering it");
            }
            if let Some(reply) = reply {
                outbound.send(reply);
            }
            run_running.store(false, Ordering::SeqCst);
        };
        tokio::spawn(task.instrument(Span::current()));
        self.active = Some(ActiveRun { cancel, running });
    }

    fn clear(&mut self) {
        {
            let mut memory = self.memory();
            memory.history.clear();
            memory.last_run = None;
            memory.generation += 1;
        }
        info!(session_id = %self.id, "session cleared");
        self.outbound
            .send(Message::status("cleared", Some("Session cleared".into())));
    }

    /// Stops all outbound traffic and cancels any active run.
    pub fn on_disconnect(&mut self) {
        self.outbound.close();
        if let Some(active) = self.active.take() {
            if active.running.load(Ordering::SeqCst) {
                info!(session_id = %self.id, "cancelling active run on disconnect");
            }
            active.cancel.cancel();
        }
        info!(session_id = %self.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.outbound.close();
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

fn lock_memory(memory: &Mutex<Memory>) -> MutexGuard<'_, Memory> {
    match memory.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The single message that ends a run for the client, if any.
pub fn terminal_message(run: &Run) -> Option<Message> {
    match &run.status {
        RunStatus::Failed {
            failure: RunFailure::Cancelled,
        } => None,
        RunStatus::Failed { failure } => {
            Some(Message::error(failure.user_message(), failure.code()))
        }
        RunStatus::Running => Some(Message::error(
            "Something went wrong while answering. Please try again.",
            "internal",
        )),
        RunStatus::Completed | RunStatus::Exhausted { .. } => {
            let answer = run.answer.as_ref();
            Some(Message::Response(ResponsePayload {
                answer_text: answer.map(|a| a.text.clone()).unwrap_or_default(),
                reasoning_trace: (!run.trace.is_empty()).then(|| run.render_trace()),
                data: answer
                    .and_then(|a| a.data.as_ref())
                    .map(|table| table.rows.clone()),
                ui_resource: answer.and_then(|a| a.ui_resource.as_ref()).map(|ui| {
                    UiResourcePayload {
                        uri: ui.uri.clone(),
                        mime_type: ui.mime_type.clone(),
                        content: ui.content.clone(),
                        encoding: ui.encoding.clone(),
                    }
                }),
                partial: run.is_partial(),
            }))
        }
    }
}
