//! Wire plumbing for MCP backends. Stdio and websocket links are
//! multiplexed: a reader task routes each response to the waiter registered
//! under its JSON-RPC id, so abandoning a request never desynchronises the
//! stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::{Connection, StdioFraming};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Waiters = HashMap<u64, oneshot::Sender<Value>>;

const SESSION_HEADER: &str = "mcp-session-id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest `Content-Length` body accepted from a stdio backend.
pub(crate) const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response within {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("connection failed: {0:#}")]
    Connection(anyhow::Error),
    #[error("undecodable response: {0}")]
    Decode(String),
}

pub(crate) enum Transport {
    Http(HttpTransport),
    Websocket(WebSocketTransport),
    Stdio(StdioTransport),
}

impl Transport {
    pub(crate) fn new(label: &str, connection: &Connection) -> anyhow::Result<Self> {
        let transport = match connection {
            Connection::Http { endpoint, headers } => {
                let client = Client::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build()
                    .context("building HTTP client for backend")?;
                Transport::Http(HttpTransport {
                    label: label.to_string(),
                    client,
                    endpoint: endpoint.clone(),
                    headers: headers.clone(),
                    session: StdMutex::new(None),
                    epoch: AtomicU64::new(1),
                })
            }
            Connection::Websocket { endpoint, headers } => {
                Transport::Websocket(WebSocketTransport {
                    label: label.to_string(),
                    endpoint: endpoint.clone(),
                    headers: headers.clone(),
                    link: Mutex::new(None),
                    list_changed: Arc::new(AtomicBool::new(false)),
                    epoch: AtomicU64::new(0),
                })
            }
            Connection::Stdio {
                command,
                args,
                env,
                framing,
            } => Transport::Stdio(StdioTransport {
                label: label.to_string(),
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                framing: *framing,
                link: Mutex::new(None),
                list_changed: Arc::new(AtomicBool::new(false)),
                epoch: AtomicU64::new(0),
            }),
        };
        Ok(transport)
    }

    /// Sends a JSON-RPC request and waits for the response carrying `id`.
    pub(crate) async fn request(
        &self,
        id: u64,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        match self {
            Transport::Http(http) => http.request(id, body, timeout).await,
            Transport::Websocket(ws) => {
                let rx = ws.send_request(id, body).await?;
                rx.wait(timeout).await
            }
            Transport::Stdio(stdio) => {
                let rx = stdio.send_request(id, body).await?;
                rx.wait(timeout).await
            }
        }
    }

    /// Fire-and-forget message. Never opens a new connection for it.
    pub(crate) async fn notify(&self, body: &Value) -> anyhow::Result<()> {
        match self {
            Transport::Http(http) => http.notify(body).await,
            Transport::Websocket(ws) => ws.notify(body).await,
            Transport::Stdio(stdio) => stdio.notify(body).await,
        }
    }

    /// Identifies the current underlying connection. Changes whenever a
    /// stateful link is re-established and needs a fresh handshake.
    pub(crate) async fn session_epoch(&self) -> Option<u64> {
        match self {
            Transport::Http(http) => Some(http.epoch.load(Ordering::SeqCst)),
            Transport::Websocket(ws) => ws.live_epoch().await,
            Transport::Stdio(stdio) => stdio.live_epoch().await,
        }
    }

    pub(crate) fn take_list_changed(&self) -> bool {
        match self {
            Transport::Http(_) => false,
            Transport::Websocket(ws) => ws.list_changed.swap(false, Ordering::SeqCst),
            Transport::Stdio(stdio) => stdio.list_changed.swap(false, Ordering::SeqCst),
        }
    }

    pub(crate) async fn close(&self) {
        match self {
            Transport::Http(http) => http.forget_session(),
            Transport::Websocket(ws) => ws.close().await,
            Transport::Stdio(stdio) => stdio.close().await,
        }
    }
}

/// Response routing for one multiplexed connection.
#[derive(Clone)]
struct Inbox {
    label: Arc<str>,
    waiters: Arc<StdMutex<Waiters>>,
    alive: Arc<AtomicBool>,
    list_changed: Arc<AtomicBool>,
}

impl Inbox {
    fn new(label: &str, list_changed: Arc<AtomicBool>) -> Self {
        Self {
            label: Arc::from(label),
            waiters: Arc::new(StdMutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(true)),
            list_changed,
        }
    }

    fn waiters(&self) -> StdMutexGuard<'_, Waiters> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn register(&self, id: u64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id, tx);
        PendingResponse {
            inbox: self.clone(),
            id,
            rx: Some(rx),
        }
    }

    fn dispatch(&self, message: Value) {
        if message.get("method").is_none() {
            if let Some(id) = response_id(&message) {
                match self.waiters().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => debug!(
                        target: "tool_gateway",
                        backend = %self.label,
                        id,
                        "discarding response nobody is waiting for"
                    ),
                }
                return;
            }
        }

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            if is_list_changed(method) {
                self.list_changed.store(true, Ordering::SeqCst);
            } else {
                debug!(target: "tool_gateway", backend = %self.label, method, "ignoring server message");
            }
        }
    }

    /// Marks the link dead and wakes every waiter with a closed channel.
    fn shut(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.waiters().clear();
    }
}

/// A registered waiter. Dropping it unregisters the id.
struct PendingResponse {
    inbox: Inbox,
    id: u64,
    rx: Option<oneshot::Receiver<Value>>,
}

impl PendingResponse {
    async fn wait(mut self, timeout: Duration) -> Result<Value, TransportError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| TransportError::Connection(anyhow!("response already consumed")))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TransportError::Connection(anyhow!(
                "connection closed before a response arrived"
            ))),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.inbox.waiters().remove(&self.id);
    }
}

pub(crate) struct HttpTransport {
    label: String,
    client: Client,
    endpoint: String,
    headers: IndexMap<String, String>,
    session: StdMutex<Option<String>>,
    /// Bumped whenever the server-side session is lost, so the client
    /// repeats the handshake before its next request.
    epoch: AtomicU64,
}

impl HttpTransport {
    fn session(&self) -> StdMutexGuard<'_, Option<String>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn forget_session(&self) {
        self.session().take();
    }

    fn lose_session(&self) {
        let previous = self.session().take();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            target: "tool_gateway",
            backend = %self.label,
            epoch,
            had_session = previous.is_some(),
            "HTTP session dropped; next request re-initialises"
        );
    }

    async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let session = self.session().clone();
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to backend {} failed", self.label))?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session() = Some(session.to_string());
        }
        Ok(response)
    }

    async fn request(
        &self,
        id: u64,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let exchange = async {
            let response = self.post(body).await.map_err(TransportError::Connection)?;
            let status = response.status();
            let event_stream = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map_or(false, |value| value.starts_with("text/event-stream"));
            let text = response
                .text()
                .await
                .map_err(|err| TransportError::Connection(err.into()))?;

            if !status.is_success() {
                return Err(TransportError::Connection(anyhow!(
                    "backend {} returned HTTP {}: {}",
                    self.label,
                    status,
                    text.trim()
                )));
            }
            if event_stream {
                return response_from_event_stream(&text, id).ok_or_else(|| {
                    TransportError::Decode(format!("no response for id {id} in event stream"))
                });
            }
            serde_json::from_str(&text).map_err(|err| TransportError::Decode(err.to_string()))
        };

        let outcome = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?;
        // A restarted server answers 404 to the old session id; a refused
        // connection means any session it held is gone too.
        if matches!(outcome, Err(TransportError::Connection(_))) {
            self.lose_session();
        }
        outcome
    }

    async fn notify(&self, body: &Value) -> anyhow::Result<()> {
        let response = self.post(body).await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "backend {} rejected notification with HTTP {}",
                self.label,
                response.status()
            ));
        }
        Ok(())
    }
}

fn response_from_event_stream(text: &str, id: u64) -> Option<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|value| response_id(value) == Some(id))
}

struct WsLink {
    sink: SplitSink<WsStream, Message>,
    inbox: Inbox,
    epoch: u64,
}

pub(crate) struct WebSocketTransport {
    label: String,
    endpoint: String,
    headers: IndexMap<String, String>,
    link: Mutex<Option<WsLink>>,
    list_changed: Arc<AtomicBool>,
    epoch: AtomicU64,
}

impl WebSocketTransport {
    async fn connect(&self) -> anyhow::Result<WsLink> {
        let mut request = self
            .endpoint
            .clone()
            .into_client_request()
            .context("constructing websocket request")?;
        for (key, value) in &self.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("invalid websocket header name `{key}`"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid websocket header value for `{key}`"))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| anyhow!("timed out connecting to {}", self.endpoint))??;
        let (sink, source) = stream.split();
        let inbox = Inbox::new(&self.label, self.list_changed.clone());
        tokio::spawn(read_websocket(source, inbox.clone()));
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "tool_gateway", backend = %self.label, epoch, "websocket connected");
        Ok(WsLink { sink, inbox, epoch })
    }

    async fn send_request(&self, id: u64, body: &Value) -> Result<PendingResponse, TransportError> {
        let mut guard = self.link.lock().await;
        if guard.as_ref().map_or(true, |link| !link.inbox.is_alive()) {
            *guard = Some(self.connect().await.map_err(TransportError::Connection)?);
        }
        let link = guard
            .as_mut()
            .ok_or_else(|| TransportError::Connection(anyhow!("websocket link missing")))?;
        let pending = link.inbox.register(id);
        let text = serde_json::to_string(body).map_err(|err| TransportError::Decode(err.to_string()))?;
        if let Err(err) = link.sink.send(Message::Text(text)).await {
            link.inbox.shut();
            return Err(TransportError::Connection(anyhow!(
                "failed to send websocket request: {err}"
            )));
        }
        Ok(pending)
    }

    async fn notify(&self, body: &Value) -> anyhow::Result<()> {
        let mut guard = self.link.lock().await;
        match guard.as_mut() {
            Some(link) if link.inbox.is_alive() => {
                link.sink
                    .send(Message::Text(serde_json::to_string(body)?))
                    .await
                    .context("sending websocket notification")?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn live_epoch(&self) -> Option<u64> {
        let guard = self.link.lock().await;
        guard
            .as_ref()
            .filter(|link| link.inbox.is_alive())
            .map(|link| link.epoch)
    }

    async fn close(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            let _ = link.sink.close().await;
            link.inbox.shut();
        }
    }
}

async fn read_websocket(mut source: SplitStream<WsStream>, inbox: Inbox) {
    while let Some(next) = source.next().await {
        let parsed = match next {
            Ok(Message::Text(text)) => serde_json::from_str::<Value>(&text),
            Ok(Message::Binary(data)) => serde_json::from_slice::<Value>(&data),
            Ok(Message::Close(frame)) => {
                debug!(
                    target: "tool_gateway",
                    backend = %inbox.label,
                    reason = ?frame.map(|f| f.reason.into_owned()),
                    "websocket closed by backend"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(target: "tool_gateway", backend = %inbox.label, error = %err, "websocket read failed");
                break;
            }
        };
        match parsed {
            Ok(value) => inbox.dispatch(value),
            Err(err) => {
                warn!(target: "tool_gateway", backend = %inbox.label, error = %err, "undecodable websocket frame")
            }
        }
    }
    inbox.shut();
}

struct StdioLink {
    child: Child,
    stdin: ChildStdin,
    inbox: Inbox,
    epoch: u64,
}

pub(crate) struct StdioTransport {
    label: String,
    command: String,
    args: Vec<String>,
    env: IndexMap<String, String>,
    framing: StdioFraming,
    link: Mutex<Option<StdioLink>>,
    list_changed: Arc<AtomicBool>,
    epoch: AtomicU64,
}

impl StdioTransport {
    async fn spawn(&self) -> anyhow::Result<StdioLink> {
        let mut command = Command::new(&self.command);
        if !self.args.is_empty() {
            command.args(&self.args);
        }
        if !self.env.is_empty() {
            command.envs(self.env.clone());
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning backend program {}", self.command))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for backend {}", self.label))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for backend {}", self.label))?;

        let inbox = Inbox::new(&self.label, self.list_changed.clone());
        tokio::spawn(read_stdio(BufReader::new(stdout), inbox.clone()));
        if let Some(stderr) = child.stderr.take() {
            let label = self.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "tool_gateway", backend = %label, "stderr: {line}");
                }
            });
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "tool_gateway", backend = %self.label, epoch, "backend process started");
        Ok(StdioLink {
            child,
            stdin,
            inbox,
            epoch,
        })
    }

    async fn send_request(&self, id: u64, body: &Value) -> Result<PendingResponse, TransportError> {
        let mut guard = self.link.lock().await;
        if guard.as_ref().map_or(true, |link| !link.inbox.is_alive()) {
            if let Some(mut dead) = guard.take() {
                let _ = dead.child.start_kill();
            }
            *guard = Some(self.spawn().await.map_err(TransportError::Connection)?);
        }
        let link = guard
            .as_mut()
            .ok_or_else(|| TransportError::Connection(anyhow!("stdio link missing")))?;
        let pending = link.inbox.register(id);
        if let Err(err) = write_frame(&mut link.stdin, self.framing, body).await {
            link.inbox.shut();
            return Err(TransportError::Connection(err));
        }
        Ok(pending)
    }

    async fn notify(&self, body: &Value) -> anyhow::Result<()> {
        let mut guard = self.link.lock().await;
        match guard.as_mut() {
            Some(link) if link.inbox.is_alive() => {
                write_frame(&mut link.stdin, self.framing, body).await
            }
            _ => Ok(()),
        }
    }

    async fn live_epoch(&self) -> Option<u64> {
        let guard = self.link.lock().await;
        guard
            .as_ref()
            .filter(|link| link.inbox.is_alive())
            .map(|link| link.epoch)
    }

    async fn close(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            link.inbox.shut();
            let _ = link.child.start_kill();
        }
    }
}

async fn write_frame(stdin: &mut ChildStdin, framing: StdioFraming, body: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(body)?;
    match framing {
        StdioFraming::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            stdin
                .write_all(header.as_bytes())
                .await
                .context("writing Content-Length header")?;
            stdin.write_all(&payload).await.context("writing payload")?;
        }
        StdioFraming::Newline => {
            stdin.write_all(&payload).await.context("writing payload")?;
            stdin.write_all(b"\n").await.context("writing frame delimiter")?;
        }
    }
    stdin.flush().await.context("flushing backend stdin")?;
    Ok(())
}

async fn read_stdio(mut stdout: BufReader<ChildStdout>, inbox: Inbox) {
    loop {
        match read_frame(&mut stdout).await {
            Ok(Some(value)) => inbox.dispatch(value),
            Ok(None) => {
                debug!(target: "tool_gateway", backend = %inbox.label, "backend closed stdout");
                break;
            }
            Err(err) => {
                warn!(target: "tool_gateway", backend = %inbox.label, error = %err, "backend stdout failed");
                break;
            }
        }
    }
    inbox.shut();
}

/// Reads one JSON-RPC message in either newline-delimited or
/// `Content-Length` framing. Stray non-JSON lines are skipped.
pub(crate) async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            let length = value
                .trim()
                .parse::<usize>()
                .context("invalid Content-Length header")?;
            if length > MAX_FRAME_BYTES {
                return Err(anyhow!(
                    "frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
                ));
            }
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(None);
                }
                if line.trim().is_empty() {
                    break;
                }
            }
            let mut buffer = vec![0u8; length];
            reader.read_exact(&mut buffer).await?;
            match serde_json::from_slice::<Value>(&buffer) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => {
                    warn!(target: "tool_gateway", error = %err, "skipping undecodable frame");
                    continue;
                }
            }
        }

        if trimmed.starts_with('{') {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => debug!(target: "tool_gateway", error = %err, "skipping malformed line"),
            }
        } else {
            debug!(target: "tool_gateway", line = trimmed, "skipping non-protocol output");
        }
    }
}

pub(crate) fn response_id(payload: &Value) -> Option<u64> {
    match payload.get("id") {
        Some(Value::Number(num)) => num.as_u64(),
        Some(Value::String(text)) => text.parse::<u64>().ok(),
        _ => None,
    }
}

fn is_list_changed(method: &str) -> bool {
    method.eq_ignore_ascii_case("notifications/tools/list_changed")
        || method.eq_ignore_ascii_case("tools/listChanged")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_both_framings_and_skips_noise() {
        let input = b"starting server...\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\nContent-Length: 37\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}";
        let mut reader = BufReader::new(&input[..]);

        let first = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(response_id(&first), Some(1));
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(response_id(&second), Some(2));
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected() {
        let input = format!("Content-Length: {}\r\n\r\n{{}}", MAX_FRAME_BYTES + 1);
        let mut reader = BufReader::new(input.as_bytes());
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn inbox_routes_by_id_and_flags_list_changes() {
        let flag = Arc::new(AtomicBool::new(false));
        let inbox = Inbox::new("db", flag.clone());
        let late = inbox.register(7);
        let pending = inbox.register(8);

        inbox.dispatch(json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" }));
        inbox.dispatch(json!({ "jsonrpc": "2.0", "id": "8", "result": { "ok": true } }));
        assert!(flag.load(Ordering::SeqCst));

        let value = pending.wait(Duration::from_millis(50)).await.unwrap();
        assert_eq!(value["result"]["ok"], true);

        drop(late);
        assert!(inbox.waiters().is_empty());
        // A response for an abandoned id is dropped quietly.
        inbox.dispatch(json!({ "jsonrpc": "2.0", "id": 7, "result": {} }));
    }

    #[tokio::test]
    async fn waiting_times_out_and_shut_wakes_waiters() {
        let inbox = Inbox::new("db", Arc::new(AtomicBool::new(false)));
        let slow = inbox.register(1);
        assert!(matches!(
            slow.wait(Duration::from_millis(10)).await,
            Err(TransportError::Timeout(_))
        ));

        let orphan = inbox.register(2);
        inbox.shut();
        assert!(!inbox.is_alive());
        assert!(matches!(
            orphan.wait(Duration::from_secs(1)).await,
            Err(TransportError::Connection(_))
        ));
    }

    #[test]
    fn event_stream_response_is_matched_by_id() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\nevent: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{\"tools\":[]}}\n\n";
        let value = response_from_event_stream(body, 4).unwrap();
        assert!(value["result"]["tools"].is_array());
        assert!(response_from_event_stream(body, 5).is_none());
    }
}
