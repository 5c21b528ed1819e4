use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tool_gateway::{BackendCallError, BackendConfig, McpBackend, ToolBackend};

const WAIT: Duration = Duration::from_secs(5);

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// MCP server over websocket that answers from a fixed script:
/// `slow` never answers until cancelled, `crash` drops the connection,
/// and `lookup` with `announce: true` first reports a tool list change.
struct ScriptedServer {
    initializes: AtomicUsize,
    listings: AtomicUsize,
    /// (id of the abandoned call, requestId named by the cancellation)
    cancellations: UnboundedSender<(u64, u64)>,
}

async fn start_server() -> (String, Arc<ScriptedServer>, UnboundedReceiver<(u64, u64)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = unbounded_channel();
    let server = Arc::new(ScriptedServer {
        initializes: AtomicUsize::new(0),
        listings: AtomicUsize::new(0),
        cancellations: tx,
    });
    let shared = server.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, shared.clone()));
        }
    });
    (url, server, rx)
}

async fn send(sink: &mut ServerSink, message: Value) {
    sink.send(Message::Text(message.to_string())).await.unwrap();
}

async fn reply(sink: &mut ServerSink, id: Option<u64>, result: Value) {
    send(sink, json!({ "jsonrpc": "2.0", "id": id, "result": result })).await;
}

fn text_content(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }] })
}

async fn serve_connection(stream: TcpStream, server: Arc<ScriptedServer>) {
    let Ok(socket) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();
    let mut unanswered: Option<u64> = None;

    while let Some(Ok(frame)) = source.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let message: Value = serde_json::from_str(&text).unwrap();
        let id = message.get("id").and_then(Value::as_u64);
        match message["method"].as_str().unwrap_or_default() {
            "initialize" => {
                server.initializes.fetch_add(1, Ordering::SeqCst);
                reply(
                    &mut sink,
                    id,
                    json!({ "protocolVersion": "2025-03-26", "capabilities": { "tools": { "listChanged": true } } }),
                )
                .await;
            }
            "tools/list" => {
                let listing = server.listings.fetch_add(1, Ordering::SeqCst) + 1;
                let mut tools = vec!["lookup", "slow", "crash"];
                if listing > 1 {
                    tools.push("fresh");
                }
                let tools: Vec<Value> = tools
                    .into_iter()
                    .map(|name| json!({ "name": name, "description": "", "inputSchema": { "type": "object" } }))
                    .collect();
                reply(&mut sink, id, json!({ "tools": tools })).await;
            }
            "tools/call" => match message["params"]["name"].as_str() {
                Some("slow") => unanswered = id,
                Some("crash") => {
                    let _ = sink.close().await;
                    return;
                }
                _ => {
                    if message["params"]["arguments"]["announce"] == true {
                        send(
                            &mut sink,
                            json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" }),
                        )
                        .await;
                    }
                    reply(&mut sink, id, text_content("lookup ok")).await;
                }
            },
            "notifications/cancelled" => {
                let named = message["params"]["requestId"].as_u64().unwrap();
                if let Some(abandoned) = unanswered.take() {
                    // Answer anyway; the client must drop it.
                    reply(&mut sink, Some(abandoned), text_content("too late")).await;
                    server.cancellations.send((abandoned, named)).unwrap();
                }
            }
            _ => {}
        }
    }
}

fn backend(url: &str) -> McpBackend {
    let resolved = BackendConfig::remote("lookup-tools", url).resolve().unwrap();
    McpBackend::new(&resolved, WAIT).unwrap()
}

fn names(operations: &[ai_agent::OperationInfo]) -> Vec<&str> {
    operations.iter().map(|op| op.name.as_str()).collect()
}

#[tokio::test]
async fn timed_out_call_is_cancelled_and_its_late_answer_dropped() {
    let (url, server, mut cancellations) = start_server().await;
    let backend = backend(&url);
    backend.discover().await.unwrap();

    let err = backend
        .call("slow", &Map::new(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendCallError::Timeout(_)));

    let (abandoned, named) = tokio::time::timeout(WAIT, cancellations.recv())
        .await
        .expect("no cancellation arrived")
        .unwrap();
    assert_eq!(abandoned, named);

    let result = backend.call("lookup", &Map::new(), WAIT).await.unwrap();
    assert_eq!(result["content"][0]["text"], "lookup ok");
    assert_eq!(server.initializes.load(Ordering::SeqCst), 1);
    backend.shutdown().await;
}

#[tokio::test]
async fn tool_list_is_cached_until_the_server_reports_a_change() {
    let (url, server, _cancellations) = start_server().await;
    let backend = backend(&url);

    let first = backend.discover().await.unwrap();
    assert_eq!(names(&first), vec!["lookup", "slow", "crash"]);
    backend.discover().await.unwrap();
    assert_eq!(server.listings.load(Ordering::SeqCst), 1);

    let mut announce = Map::new();
    announce.insert("announce".into(), json!(true));
    backend.call("lookup", &announce, WAIT).await.unwrap();

    let refreshed = backend.discover().await.unwrap();
    assert_eq!(names(&refreshed), vec!["lookup", "slow", "crash", "fresh"]);
    assert_eq!(server.listings.load(Ordering::SeqCst), 2);
    backend.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_is_reopened_with_a_new_handshake() {
    let (url, server, _cancellations) = start_server().await;
    let backend = backend(&url);
    backend.discover().await.unwrap();

    let err = backend.call("crash", &Map::new(), WAIT).await.unwrap_err();
    assert!(matches!(err, BackendCallError::Unavailable(_)));

    let operations = backend.discover().await.unwrap();
    assert!(names(&operations).contains(&"lookup"));
    assert_eq!(server.initializes.load(Ordering::SeqCst), 2);
    assert_eq!(server.listings.load(Ordering::SeqCst), 2);

    let result = backend.call("lookup", &Map::new(), WAIT).await.unwrap();
    assert_eq!(result["content"][0]["text"], "lookup ok");
    backend.shutdown().await;
}
