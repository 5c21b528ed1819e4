mod support;

use std::net::SocketAddr;
use std::time::Duration;

use chat_protocol::{Envelope, Message as ChatMessage};
use chat_server::{ChatServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use support::*;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(server: ChatServer) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move { server.serve(listener, token).await });
    (addr, cancel)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    client
}

/// Next chat message, or `None` once the server closes the socket.
async fn receive(client: &mut Client) -> Option<ChatMessage> {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(Message::Text(text)) => return Some(Envelope::decode(&text).unwrap().message),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

#[tokio::test]
async fn query_over_a_socket_gets_a_response() {
    let gateway = analytics_gateway(true).await;
    let strategy = ScriptedStrategy::new(vec![
        call("database", "execute_sql", serde_json::json!({ "sql": "SELECT 1" })),
        finish("Acme leads with 300."),
    ]);
    let server = ChatServer::new(agent(strategy, gateway.clone()), gateway, ServerConfig::default());
    let (addr, cancel) = start(server).await;

    let mut client = connect(addr).await;
    let connected = receive(&mut client).await.unwrap();
    assert_eq!(status_phase(&connected), Some("connected"));

    client
        .send(Message::Text(query_frame("Who leads?")))
        .await
        .unwrap();
    let response = loop {
        match receive(&mut client).await.expect("socket closed early") {
            ChatMessage::Response(response) => break response,
            ChatMessage::Error(error) => panic!("unexpected error: {error:?}"),
            _ => continue,
        }
    };
    assert_eq!(response.answer_text, "Acme leads with 300.");
    assert_eq!(response.data.unwrap().len(), 3);

    client
        .send(Message::Text(r#"{"type":"Ping","payload":{}}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(receive(&mut client).await, Some(ChatMessage::Pong));

    cancel.cancel();
    assert!(receive(&mut client).await.is_none());
}

#[tokio::test]
async fn connections_beyond_the_limit_are_turned_away() {
    let gateway = analytics_gateway(true).await;
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let server = ChatServer::new(
        agent(ScriptedStrategy::new(vec![]), gateway.clone()),
        gateway,
        config,
    );
    let registry = server.registry();
    let (addr, cancel) = start(server).await;

    let mut first = connect(addr).await;
    receive(&mut first).await.unwrap();
    assert_eq!(registry.active_sessions(), 1);

    let mut second = connect(addr).await;
    match receive(&mut second).await {
        Some(ChatMessage::Error(error)) => assert_eq!(error.code.as_deref(), Some("server_full")),
        other => panic!("expected server_full, got {other:?}"),
    }
    assert!(receive(&mut second).await.is_none());
    assert_eq!(registry.active_sessions(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn silent_clients_are_pinged_then_closed() {
    let gateway = analytics_gateway(true).await;
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let server = ChatServer::new(
        agent(ScriptedStrategy::new(vec![]), gateway.clone()),
        gateway,
        config,
    );
    let registry = server.registry();
    let (addr, cancel) = start(server).await;

    let mut client = connect(addr).await;
    receive(&mut client).await.unwrap();

    let mut pings = 0;
    while let Some(message) = receive(&mut client).await {
        if message == ChatMessage::Ping {
            pings += 1;
        }
    }
    assert!(pings >= 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.active_sessions(), 0);
    cancel.cancel();
}
