//! Two servers sharing one relay bus, driven by real WebSocket clients

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use socket_relay::{AppError, Config, LocalBus, RelayBackend, RelayServer, ServerBuilder};

const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn token(user: &str) -> String {
    encode(
        &Header::default(),
        &json!({ "id": user }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn config() -> Config {
    Config {
        secret: Some(SECRET.to_string()),
        ..Config::default()
    }
}

/// Greets on connect and relays `m` envelopes
fn protocol(config: Config) -> ServerBuilder {
    RelayServer::builder(config)
        .on_connect(|server, conn| {
            let hello = server.codec().tagged("cs");
            server.send_json(conn, &hello);
        })
        .on("m", |server, _, envelope| {
            if let Some(relay) = envelope.relay() {
                server.deliver(relay).unwrap();
            }
        })
}

async fn start(bus: &LocalBus) -> (RelayServer, SocketAddr, JoinHandle<Result<(), AppError>>) {
    serve(bus, protocol(config())).await
}

async fn serve(
    bus: &LocalBus,
    builder: ServerBuilder,
) -> (RelayServer, SocketAddr, JoinHandle<Result<(), AppError>>) {
    let server = builder.build();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    let backend = RelayBackend::Local(bus.clone());
    let handle = tokio::spawn(async move {
        serving
            .serve(listener, backend, std::future::pending::<()>())
            .await
    });
    (server, addr, handle)
}

/// Next text frame, skipping heartbeat traffic
async fn next_text(client: &mut Client) -> String {
    loop {
        let frame = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match frame {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Connect as `user` and wait until the server has registered us
async fn join(addr: SocketAddr, user: &str) -> Client {
    let url = format!("ws://{}/?token={}", addr, token(user));
    let (mut client, _) = connect_async(url).await.unwrap();
    assert_eq!(next_text(&mut client).await, r#"{"t":"cs"}"#);
    client
}

/// Resolves once the server has closed the socket
async fn closed_by_server(client: &mut Client) {
    timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("server did not close the socket");
}

#[tokio::test]
async fn test_message_crosses_processes_unchanged() {
    let bus = LocalBus::default();
    let (server_a, addr_a, handle_a) = start(&bus).await;
    let (server_b, addr_b, handle_b) = start(&bus).await;

    let mut alice = join(addr_a, "alice").await;
    let mut bob = join(addr_b, "bob").await;

    alice
        .send(Message::Text(
            r#"{"t":"m","recipient":"bob","data":{"text": "hi",  "n": 1.50}}"#.into(),
        ))
        .await
        .unwrap();

    assert_eq!(next_text(&mut bob).await, r#"{"text": "hi",  "n": 1.50}"#);

    server_a.shutdown();
    server_b.shutdown();
    assert!(handle_a.await.unwrap().is_ok());
    assert!(handle_b.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_local_recipient_gets_one_copy() {
    let bus = LocalBus::default();
    let (server_a, addr_a, handle_a) = start(&bus).await;
    let (server_b, addr_b, handle_b) = start(&bus).await;

    let mut alice = join(addr_a, "alice").await;
    let mut carol = join(addr_a, "carol").await;
    let mut bob = join(addr_b, "bob").await;

    alice
        .send(Message::Text(
            r#"{"t":"m","recipient":["carol","bob"],"data":"x"}"#.into(),
        ))
        .await
        .unwrap();
    assert_eq!(next_text(&mut carol).await, r#""x""#);
    assert_eq!(next_text(&mut bob).await, r#""x""#);

    // A second message proves carol was not sent a duplicate of the first
    alice
        .send(Message::Text(r#"{"t":"m","recipient":"carol","data":"y"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut carol).await, r#""y""#);

    server_a.shutdown();
    server_b.shutdown();
    handle_a.await.unwrap().unwrap();
    handle_b.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_without_valid_token_is_refused() {
    let bus = LocalBus::default();
    let (server, addr, handle) = start(&bus).await;

    for url in [
        format!("ws://{}/", addr),
        format!("ws://{}/?token=not-a-jwt", addr),
    ] {
        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected refusal, got {:?}", other.map(|_| ())),
        }
    }
    assert!(server.registry().is_empty());

    server.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let bus = LocalBus::default();
    let (server, addr, handle) = start(&bus).await;

    let mut first = join(addr, "alice").await;
    let mut second = join(addr, "alice").await;

    // The stale socket is closed by the server
    closed_by_server(&mut first).await;
    assert_eq!(server.registry().len(), 1);

    // Messages for alice reach the new socket
    let mut bob = join(addr, "bob").await;
    bob.send(Message::Text(r#"{"t":"m","recipient":"alice","data":1}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut second).await, "1");

    server.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_close_unregisters_and_fires_hook_once() {
    let bus = LocalBus::default();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let seen = disconnects.clone();
    let builder = protocol(config()).on_disconnect(move |_, conn| {
        assert_eq!(conn.user().as_str(), "alice");
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let (server, addr, handle) = serve(&bus, builder).await;

    let mut alice = join(addr, "alice").await;
    assert_eq!(server.registry().len(), 1);

    alice.close(None).await.unwrap();
    closed_by_server(&mut alice).await;

    timeout(WAIT, async {
        while disconnects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(server.registry().is_empty());

    server.shutdown();
    handle.await.unwrap().unwrap();
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_silent_peer_is_closed_after_handshake_timeout() {
    let bus = LocalBus::default();
    let config = Config {
        handshake_timeout: Duration::from_millis(200),
        ..config()
    };
    let (server, addr, handle) = serve(&bus, protocol(config)).await;

    // Open TCP but never send the upgrade request
    let mut peer = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    let read = timeout(WAIT, peer.read(&mut buf))
        .await
        .expect("server kept the silent connection open");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(server.registry().is_empty());

    server.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_panicking_connect_hook_leaves_no_entry() {
    let bus = LocalBus::default();
    let builder = RelayServer::builder(config()).on_connect(|_, conn| {
        if conn.user().as_str() == "mallory" {
            panic!("connect hook failed");
        }
    });
    let (server, addr, handle) = serve(&bus, builder).await;

    let url = format!("ws://{}/?token={}", addr, token("mallory"));
    let (mut mallory, _) = connect_async(url).await.unwrap();
    closed_by_server(&mut mallory).await;
    assert!(server.registry().is_empty());

    // The server keeps accepting
    let url = format!("ws://{}/?token={}", addr, token("alice"));
    let (_alice, _) = connect_async(url).await.unwrap();
    timeout(WAIT, async {
        while server.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    server.shutdown();
    handle.await.unwrap().unwrap();
}
