use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ai_agent::ReasoningLoop;
use anyhow::{Context, Result};
use chat_protocol::{Envelope, Message as ChatMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tool_gateway::ToolGateway;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::health::HealthSnapshot;
use crate::registry::SessionRegistry;
use crate::session::Session;

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Sessions silent for this many heartbeat intervals are closed.
const STALE_AFTER_INTERVALS: u32 = 3;
const HEALTH_LOG_EVERY: Duration = Duration::from_secs(300);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Websocket front end: accepts connections and runs one [`Session`] each.
#[derive(Clone)]
pub struct ChatServer {
    agent: Arc<ReasoningLoop>,
    gateway: Arc<ToolGateway>,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl ChatServer {
    pub fn new(agent: Arc<ReasoningLoop>, gateway: Arc<ToolGateway>, config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(config.max_connections);
        Self {
            agent,
            gateway,
            config,
            registry,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot::collect(&self.gateway, &self.registry).await
    }

    /// Binds the configured address and serves until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind chat server to {}", self.config.listen))?;
        self.serve(listener, cancel).await
    }

    /// Accepts connections in a loop until `cancel` is triggered, then asks
    /// every live session to close.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("reading listener address")?;
        info!(address = %local, "chat server listening");

        let mut health_tick = interval(HEALTH_LOG_EVERY);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = health_tick.tick() => {
                    let health = self.health().await;
                    info!(
                        overall = ?health.overall,
                        active_sessions = health.active_sessions,
                        backends = %serde_json::to_string(&health.backends).unwrap_or_default(),
                        "health"
                    );
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let child_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream, peer, child_cancel).await {
                            debug!(peer = %peer, error = %format!("{err:#}"), "connection ended with error");
                        }
                    });
                }
            }
        }

        self.registry.close_all();
        info!("chat server stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .context("websocket handshake failed")?;
        let (mut writer, mut reader) = ws_stream.split();

        let session_id = Uuid::new_v4().to_string();
        let Some(_admission) = self.registry.admit(&session_id, cancel.clone()) else {
            warn!(peer = %peer, limit = self.config.max_connections, "connection limit reached");
            let full = Envelope::new(ChatMessage::error(
                "The server is at capacity. Please try again later.",
                "server_full",
            ));
            writer.send(Message::Text(full.to_json()?)).await?;
            writer.send(Message::Close(None)).await?;
            return Ok(());
        };

        let span = info_span!("session", session_id = %session_id, peer = %peer);
        self.drive_session(session_id, writer, &mut reader, cancel)
            .instrument(span)
            .await;
        Ok(())
    }

    async fn drive_session(
        &self,
        session_id: String,
        mut writer: WsWriter,
        reader: &mut WsReader,
        cancel: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    debug!(error = %err, "outbound write failed");
                    return;
                }
            }
            let _ = writer.send(Message::Close(None)).await;
        });

        let mut session = Session::new(
            session_id,
            self.agent.clone(),
            self.config.session.clone(),
            tx,
        );
        session.on_connect();

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session cancelled by server");
                    break;
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > period * STALE_AFTER_INTERVALS {
                        info!(idle_secs = last_seen.elapsed().as_secs(), "closing stale session");
                        break;
                    }
                    session.send_ping();
                }
                frame = reader.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => {
                            debug!(error = %err, "websocket read failed");
                            break;
                        }
                        None => break,
                    };
                    last_seen = Instant::now();
                    match frame {
                        Message::Text(text) => session.on_message(&text),
                        Message::Binary(_) => session.on_binary(),
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        session.on_disconnect();
        drop(session);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task)
            .await
            .is_err()
        {
            debug!("outbound writer did not drain in time");
        }
    }
}
