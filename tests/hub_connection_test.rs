//! End-to-end tests against an in-process hub endpoint.
//!
//! One TCP listener serves both halves of the connection sequence: the
//! negotiate POST is answered with a canned JSON payload, and the
//! following connection is upgraded to a WebSocket session the test
//! scripts through a command channel. Incoming connections are sniffed
//! with `peek` and routed by the request verb.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hublink::{ConnectionState, HubConnection, HubError};

const RS: char = '\u{1e}';
const CONNECTION_ID: &str = "conn-1";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Commands the test script sends to the fake hub's WebSocket session.
enum ServerCommand {
    /// Send a raw text frame to the client.
    Send(String),
    /// Close the WebSocket.
    Close,
}

struct TestHub {
    url: String,
    /// Text frames received from the client, in order (handshake first).
    received: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl TestHub {
    async fn recv_frame(&mut self) -> String {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server session ended")
    }

    /// Receive one frame and parse its single message as JSON.
    async fn recv_message(&mut self) -> Value {
        let frame = self.recv_frame().await;
        let text = frame.trim_end_matches(RS);
        serde_json::from_str(text).expect("client frame was not JSON")
    }

    fn send_message(&self, message: &Value) {
        self.send_raw(format!("{message}{RS}"));
    }

    fn send_raw(&self, frame: String) {
        self.commands
            .send(ServerCommand::Send(frame))
            .expect("server session ended");
    }

    fn close_socket(&self) {
        self.commands
            .send(ServerCommand::Close)
            .expect("server session ended");
    }
}

async fn spawn_hub() -> TestHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    tokio::spawn(serve(listener, received_tx, commands_rx));

    TestHub {
        url: format!("http://{addr}/chat"),
        received,
        commands: commands_tx,
    }
}

async fn serve(
    listener: TcpListener,
    received_tx: mpsc::UnboundedSender<String>,
    commands_rx: mpsc::UnboundedReceiver<ServerCommand>,
) {
    let mut commands_rx = Some(commands_rx);
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut probe = [0u8; 1];
        let Ok(n) = stream.peek(&mut probe).await else {
            continue;
        };
        if n == 1 && probe[0] == b'P' {
            answer_negotiate(stream).await;
        } else if let Some(commands) = commands_rx.take() {
            tokio::spawn(run_ws_session(stream, received_tx.clone(), commands));
        }
    }
}

async fn answer_negotiate(mut stream: TcpStream) {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
    }

    let body = json!({
        "connectionId": CONNECTION_ID,
        "transferFormats": ["Text"],
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn run_ws_session(
    stream: TcpStream,
    received: mpsc::UnboundedSender<String>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = received.send(text.to_string());
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
            command = commands.recv() => {
                match command {
                    Some(ServerCommand::Send(frame)) => {
                        if write.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    Some(ServerCommand::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

#[tokio::test]
async fn test_handshake_is_first_outbound_frame() {
    init_logging();
    let mut hub = spawn_hub().await;

    let opened = Arc::new(Mutex::new(false));
    let open_flag = Arc::clone(&opened);
    let connection = HubConnection::builder()
        .on_open(move || *open_flag.lock().unwrap() = true)
        .build();

    connection.start(&hub.url, &[]).await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.connection_id().as_deref(), Some(CONNECTION_ID));
    assert!(*opened.lock().unwrap());

    let first = hub.recv_frame().await;
    assert_eq!(first, format!(r#"{{"protocol":"json","version":1}}{RS}"#));

    connection.close(None).await;
}

#[tokio::test]
async fn test_invoke_resolves_with_server_result() {
    init_logging();
    let mut hub = spawn_hub().await;
    let connection = HubConnection::builder().build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    // The server acks the handshake with a bare `{}` record; the client
    // skips it without dropping the connection.
    hub.send_raw(format!("{{}}{RS}"));

    let (result, ()) = tokio::join!(
        connection.invoke::<i64>("Add", vec![json!(2), json!(3)]),
        async {
            let invocation = hub.recv_message().await;
            assert_eq!(
                invocation,
                json!({"target": "Add", "arguments": [2, 3], "type": 1, "invocationId": "0"})
            );
            hub.send_message(&json!({"type": 3, "invocationId": "0", "result": 5}));
        }
    );

    assert_eq!(result.unwrap(), 5);
    connection.close(None).await;
}

#[tokio::test]
async fn test_invoke_rejects_on_error_completion() {
    init_logging();
    let mut hub = spawn_hub().await;
    let connection = HubConnection::builder().build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    let (result, ()) = tokio::join!(
        connection.invoke::<Value>("Explode", vec![]),
        async {
            let _invocation = hub.recv_message().await;
            hub.send_message(&json!({"type": 3, "invocationId": "0", "error": "boom"}));
        }
    );

    let err = result.unwrap_err();
    assert!(matches!(err, HubError::Server(ref message) if message == "boom"));
    connection.close(None).await;
}

#[tokio::test]
async fn test_invocation_ids_increment_per_call() {
    init_logging();
    let mut hub = spawn_hub().await;
    let connection = HubConnection::builder().build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    for expected_id in ["0", "1"] {
        let (result, ()) = tokio::join!(
            connection.invoke::<Value>("Echo", vec![]),
            async {
                let invocation = hub.recv_message().await;
                assert_eq!(invocation["invocationId"], json!(expected_id));
                hub.send_message(
                    &json!({"type": 3, "invocationId": expected_id, "result": null}),
                );
            }
        );
        result.unwrap();
    }

    connection.close(None).await;
}

#[tokio::test]
async fn test_send_is_fire_and_forget() {
    init_logging();
    let mut hub = spawn_hub().await;
    let connection = HubConnection::builder().build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    connection.send("Log", vec![json!("hello")]).await.unwrap();

    let invocation = hub.recv_message().await;
    assert_eq!(invocation["type"], json!(1));
    assert_eq!(invocation["target"], json!("Log"));
    assert!(invocation.get("invocationId").is_none());

    connection.close(None).await;
}

#[tokio::test]
async fn test_server_invocations_dispatch_case_insensitively_in_order() {
    init_logging();
    let mut hub = spawn_hub().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(&'static str, Value)>();

    let connection = HubConnection::builder().build();
    let tx = seen_tx.clone();
    connection.on("Notify", move |args| {
        let _ = tx.send(("upper", args[0].clone()));
    });
    let tx = seen_tx;
    connection.on("notify", move |args| {
        let _ = tx.send(("lower", args[0].clone()));
    });

    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    // Two invocations coalesced into one transport frame, prefixed with
    // the handshake-ack noise the transport strips.
    let first = json!({"type": 1, "target": "NOTIFY", "arguments": ["a"]});
    let second = json!({"type": 1, "target": "Notify", "arguments": ["b"]});
    hub.send_raw(format!("{{}}{RS}{first}{RS}{second}{RS}"));

    let mut seen = Vec::new();
    for _ in 0..4 {
        let entry = timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("timed out waiting for handler dispatch")
            .expect("handler channel closed");
        seen.push(entry);
    }

    // Both handlers run for each invocation, in registration order, and
    // the two invocations dispatch in wire order.
    assert_eq!(
        seen,
        vec![
            ("upper", json!("a")),
            ("lower", json!("a")),
            ("upper", json!("b")),
            ("lower", json!("b")),
        ]
    );

    assert_eq!(connection.state(), ConnectionState::Open);
    connection.close(None).await;
}

#[tokio::test]
async fn test_reply_requested_invocation_closes_connection() {
    init_logging();
    let mut hub = spawn_hub().await;
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<Option<String>>();

    let connection = HubConnection::builder()
        .on_close(move |reason| {
            let _ = closed_tx.send(reason.map(str::to_string));
        })
        .build();
    connection.on("notify", |_| {});
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    hub.send_message(&json!({
        "type": 1,
        "target": "Notify",
        "arguments": [],
        "invocationId": "9",
    }));

    let reason = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("timed out waiting for close")
        .expect("close channel ended")
        .expect("close reason missing");
    assert!(reason.contains("not supported"));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_server_close_message_uses_fixed_reason() {
    init_logging();
    let mut hub = spawn_hub().await;
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<Option<String>>();

    let connection = HubConnection::builder()
        .on_close(move |reason| {
            let _ = closed_tx.send(reason.map(str::to_string));
        })
        .build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    hub.send_message(&json!({"type": 7, "error": "server down"}));

    let reason = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("timed out waiting for close")
        .expect("close channel ended");
    assert_eq!(reason.as_deref(), Some("Server returned an error on close"));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_dangling_completion_leaves_connection_usable() {
    init_logging();
    let mut hub = spawn_hub().await;
    let connection = HubConnection::builder().build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    // Unsolicited completion: no pending invocation with this id.
    hub.send_message(&json!({"type": 3, "invocationId": "99", "result": 1}));

    let (result, ()) = tokio::join!(
        connection.invoke::<i64>("Add", vec![json!(1), json!(1)]),
        async {
            let invocation = hub.recv_message().await;
            assert_eq!(invocation["invocationId"], json!("0"));
            hub.send_message(&json!({"type": 3, "invocationId": "0", "result": 2}));
        }
    );

    assert_eq!(result.unwrap(), 2);
    connection.close(None).await;
}

#[tokio::test]
async fn test_pending_invocation_rejected_when_socket_closes() {
    init_logging();
    let mut hub = spawn_hub().await;
    let connection = HubConnection::builder().build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    let (result, ()) = tokio::join!(
        connection.invoke::<Value>("Slow", vec![]),
        async {
            let _invocation = hub.recv_message().await;
            hub.close_socket();
        }
    );

    assert!(matches!(result, Err(HubError::ConnectionClosed)));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_is_terminal() {
    init_logging();
    let mut hub = spawn_hub().await;
    let closes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&closes);

    let connection = HubConnection::builder()
        .on_close(move |reason| sink.lock().unwrap().push(reason.map(str::to_string)))
        .build();
    connection.start(&hub.url, &[]).await.unwrap();
    let _handshake = hub.recv_frame().await;

    connection.close(Some("bye".to_string())).await;
    connection.close(None).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(*closes.lock().unwrap(), vec![Some("bye".to_string())]);

    let result = connection.send("Log", vec![]).await;
    assert!(matches!(
        result,
        Err(HubError::InvalidState(ConnectionState::Closed))
    ));
    let restart = connection.start(&hub.url, &[]).await;
    assert!(matches!(restart, Err(HubError::InvalidState(_))));
}

#[tokio::test]
async fn test_negotiate_failure_aborts_start() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/negotiate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let connection = HubConnection::builder()
        .on_error(move |error| sink.lock().unwrap().push(error.to_string()))
        .build();

    let result = connection
        .start(&format!("{}/chat", server.uri()), &[])
        .await;

    assert!(matches!(result, Err(HubError::Negotiate(_))));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(errors.lock().unwrap().len(), 1);
}
