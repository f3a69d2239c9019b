//! Hub connection lifecycle and message dispatch.
//!
//! # Architecture
//!
//! ```text
//! HubConnection
//!     ├── negotiate (reqwest POST <url>/negotiate → connection id)
//!     ├── WebSocket transport (ws module, writer shared / reader owned)
//!     ├── InvocationRegistry (pending invoke calls, id allocation)
//!     ├── HandlerRegistry (server-invokable client methods)
//!     └── reader task (single dispatch context, tokio::select! loop)
//! ```
//!
//! One connection object owns one lifecycle: `Idle` → `Negotiating` →
//! `SocketConnecting` → `Open` → `Closed`. `Closed` is terminal — there
//! is no reconnection logic; callers construct a new object to connect
//! again, which starts a fresh invocation-id counter and registries.
//!
//! All inbound dispatch happens on the spawned reader task, in wire
//! order: messages split from one transport frame dispatch in split
//! order, frames dispatch in delivery order.
//!
//! # Usage
//!
//! ```ignore
//! let connection = HubConnection::builder()
//!     .on_close(|reason| log::info!("closed: {reason:?}"))
//!     .build();
//! connection.on("notify", |args| println!("notify: {args:?}"));
//! connection.start("https://example.com/chat", &[]).await?;
//!
//! let sum: i64 = connection.invoke("Add", vec![json!(2), json!(3)]).await?;
//! connection.send("Log", vec![json!("fire and forget")]).await?;
//! connection.close(None).await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::HubError;
use crate::framing;
use crate::handlers::HandlerRegistry;
use crate::invocations::InvocationRegistry;
use crate::negotiate::{self, NegotiateResponse};
use crate::protocol::{self, Classified, HubMessage};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// HTTP client request timeout for the negotiate round trip.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Diagnostic reason sent when the server requests a reply to a client
/// method invocation.
const REPLY_UNSUPPORTED_REASON: &str =
    "Server requested a response, which is not supported in this version of the client.";

/// Diagnostic reason sent when the server starts a stream invocation.
const STREAM_UNSUPPORTED_REASON: &str =
    "Server requested a stream, which is not supported in this version of the client.";

/// Close reason reported when the server sends a Close message.
const SERVER_CLOSE_REASON: &str = "Server returned an error on close";

/// Lifecycle states for one hub connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed; `start` has not been called.
    Idle,
    /// Negotiate request in flight.
    Negotiating,
    /// Transport connecting with the negotiated connection id.
    SocketConnecting,
    /// Handshake sent; sends are legal.
    Open,
    /// Terminal. Construct a new connection object to reconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::SocketConnecting => "socket-connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

type OnOpen = Box<dyn Fn() + Send + Sync>;
type OnClose = Box<dyn Fn(Option<&str>) + Send + Sync>;
type OnError = Box<dyn Fn(&HubError) + Send + Sync>;

/// Lifecycle notification hooks, set via the builder.
#[derive(Default)]
struct Hooks {
    on_open: Option<OnOpen>,
    on_close: Option<OnClose>,
    on_error: Option<OnError>,
}

/// State and registries shared between the connection handle and its
/// reader task. Owned exclusively by one connection object.
struct Shared {
    state: StdMutex<ConnectionState>,
    invocations: InvocationRegistry,
    handlers: HandlerRegistry,
    writer: Mutex<Option<WsWriter>>,
    negotiated: StdMutex<Option<NegotiateResponse>>,
    hooks: Hooks,
}

impl Shared {
    fn new(hooks: Hooks) -> Self {
        Self {
            state: StdMutex::new(ConnectionState::Idle),
            invocations: InvocationRegistry::new(),
            handlers: HandlerRegistry::new(),
            writer: Mutex::new(None),
            negotiated: StdMutex::new(None),
            hooks,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Transition `from` → `to`, failing if another transition won.
    fn transition_from(&self, from: ConnectionState, to: ConnectionState) -> Result<(), HubError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != from {
            return Err(HubError::InvalidState(*state));
        }
        *state = to;
        Ok(())
    }

    /// Force the terminal state: close the transport, reject outstanding
    /// invocations, fire hooks. Idempotent — later calls are no-ops.
    async fn shutdown(&self, reason: Option<&str>, error: Option<&HubError>) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close(reason.map(str::to_string)).await {
                log::debug!("Transport close failed: {e}");
            }
        }

        // Callers awaiting a result must not stall forever.
        self.invocations.reject_all();

        if let Some(error) = error {
            if let Some(hook) = &self.hooks.on_error {
                hook(error);
            }
        }
        if let Some(hook) = &self.hooks.on_close {
            hook(reason);
        }
    }

    /// Split a raw transport frame and dispatch each message in wire
    /// order. A malformed segment is skipped; its siblings still run.
    async fn process_frame(&self, raw: &str) {
        for text in framing::split(raw) {
            match protocol::parse(text) {
                Ok(Classified::Message(message)) => self.dispatch(message).await,
                Ok(Classified::Unknown(tag)) => log::warn!("Invalid message type: {tag}"),
                Err(e) => log::warn!("Skipping malformed message: {e}"),
            }
        }
    }

    /// Dispatch one parsed inbound message by tag.
    async fn dispatch(&self, message: HubMessage) {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let handled = self.handlers.dispatch(&target, &arguments);
                if !handled {
                    log::warn!("No client method with the name '{target}' found.");
                }
                if invocation_id.is_some() {
                    // Returning a value to the server is not implemented;
                    // closing avoids blocking the server on a reply.
                    log::error!("{REPLY_UNSUPPORTED_REASON}");
                    let error = HubError::Unsupported(REPLY_UNSUPPORTED_REASON.to_string());
                    self.shutdown(Some(REPLY_UNSUPPORTED_REASON), Some(&error))
                        .await;
                }
            }
            HubMessage::StreamItem { invocation_id, .. } => {
                // Streaming is unsupported: parsed, never delivered.
                log::debug!("Ignoring stream item for invocation '{invocation_id}'");
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                self.invocations.complete(&invocation_id, result, error);
            }
            HubMessage::StreamInvocation { target, .. } => {
                log::error!("Server requested a stream invocation of '{target}'");
                let error = HubError::Unsupported(STREAM_UNSUPPORTED_REASON.to_string());
                self.shutdown(Some(STREAM_UNSUPPORTED_REASON), Some(&error))
                    .await;
            }
            HubMessage::CancelInvocation { invocation_id } => {
                // This client never starts streams, so there is nothing
                // to cancel.
                log::warn!("Ignoring cancellation for invocation '{invocation_id}'");
            }
            HubMessage::Ping => {}
            HubMessage::Close { error } => {
                log::info!("Close message received from server.");
                if let Some(error) = error {
                    log::warn!("Server close carried error: {error}");
                }
                self.shutdown(Some(SERVER_CLOSE_REASON), None).await;
            }
        }
    }
}

/// Single dispatch context: reads transport messages until the stream
/// ends, the connection closes, or shutdown is signalled.
async fn run_reader(shared: Arc<Shared>, mut reader: WsReader, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            incoming = reader.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => shared.process_frame(&text).await,
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let mut writer = shared.writer.lock().await;
                        if let Some(writer) = writer.as_mut() {
                            if let Err(e) = writer.send_pong(payload).await {
                                log::warn!("Failed to answer transport ping: {e}");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Binary(_))) => {
                        log::warn!("Ignoring binary frame: only the JSON sub-protocol is supported");
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("WebSocket closed by server ({code}): {reason}");
                        shared.shutdown(None, None).await;
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error: {e}");
                        let error = HubError::Transport(e.to_string());
                        shared.shutdown(Some("transport error"), Some(&error)).await;
                        break;
                    }
                    None => {
                        shared.shutdown(None, None).await;
                        break;
                    }
                }
            }
            _ = &mut shutdown_rx => break,
        }

        // Dispatch may have forced the terminal state (unsupported
        // feature, server Close); stop reading once it has.
        if shared.state() == ConnectionState::Closed {
            break;
        }
    }
}

/// Derive the socket URL from the negotiate URL: strip the `/negotiate`
/// path suffix, append the connection id, flip to the matching WS scheme.
fn socket_url(negotiate_url: &Url, connection_id: &str) -> String {
    let mut url = negotiate_url.clone();
    let path = url
        .path()
        .strip_suffix("/negotiate")
        .unwrap_or(url.path())
        .to_string();
    url.set_path(&path);
    url.query_pairs_mut().append_pair("id", connection_id);
    ws::http_to_ws_scheme(url.as_str())
}

/// Builder for [`HubConnection`].
///
/// Lifecycle hooks are optional; the HTTP client defaults to one with a
/// request timeout and can be overridden for tests.
#[derive(Default)]
pub struct HubConnectionBuilder {
    http: Option<reqwest::Client>,
    hooks: Hooks,
}

impl HubConnectionBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pre-configured HTTP client for the negotiate round trip.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Run `hook` once the handshake has been sent and sends are legal.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_open = Some(Box::new(hook));
        self
    }

    /// Run `hook` when the connection reaches the terminal state, with
    /// the close reason when one exists.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        self.hooks.on_close = Some(Box::new(hook));
        self
    }

    /// Run `hook` when a connection-fatal error occurs.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&HubError) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Box::new(hook));
        self
    }

    /// Build the connection object.
    #[must_use]
    pub fn build(self) -> HubConnection {
        let http = self.http.unwrap_or_else(|| {
            reqwest::Client::builder()
                .timeout(HTTP_REQUEST_TIMEOUT)
                .build()
                .expect("HTTP client construction failed")
        });

        HubConnection {
            shared: Arc::new(Shared::new(self.hooks)),
            http,
            shutdown_tx: StdMutex::new(None),
        }
    }
}

impl fmt::Debug for HubConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnectionBuilder")
            .field("http", &self.http.is_some())
            .finish_non_exhaustive()
    }
}

/// A client connection to one hub endpoint.
///
/// Construct via [`HubConnection::builder`], register client methods with
/// [`HubConnection::on`], then [`HubConnection::start`]. The object is
/// single-use: once closed it stays closed.
pub struct HubConnection {
    shared: Arc<Shared>,
    http: reqwest::Client,
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl HubConnection {
    /// Create a new connection builder.
    #[must_use]
    pub fn builder() -> HubConnectionBuilder {
        HubConnectionBuilder::new()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Negotiated connection id, once negotiation has completed.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.shared
            .negotiated
            .lock()
            .expect("negotiated lock poisoned")
            .as_ref()
            .map(|n| n.connection_id.clone())
    }

    /// Register `handler` for server invocations of `method`.
    ///
    /// Matching is case-insensitive; every handler registered for a name
    /// runs, in registration order, on each matching invocation.
    pub fn on(&self, method: &str, handler: impl Fn(&[Value]) + Send + Sync + 'static) {
        self.shared.handlers.on(method, handler);
    }

    /// Negotiate, open the transport, send the handshake, and start the
    /// reader task.
    ///
    /// `query` pairs are percent-encoded into the negotiate URL and carry
    /// over to the socket URL along with the negotiated connection id.
    ///
    /// # Errors
    ///
    /// Returns `HubError::InvalidState` unless the object is `Idle`,
    /// `HubError::Negotiate` when the negotiate round trip fails, and
    /// `HubError::Transport`/`HubError::SendFailed` when the socket or
    /// handshake fails. Failures are terminal for this object.
    pub async fn start(&self, url: &str, query: &[(String, String)]) -> Result<(), HubError> {
        self.shared
            .transition_from(ConnectionState::Idle, ConnectionState::Negotiating)?;

        let negotiate_url = match negotiate::negotiate_url(url, query) {
            Ok(url) => url,
            Err(e) => return Err(self.abort_start(e).await),
        };
        let negotiated = match negotiate::negotiate(&self.http, negotiate_url.clone()).await {
            Ok(negotiated) => negotiated,
            Err(e) => return Err(self.abort_start(e).await),
        };

        self.shared.transition_from(
            ConnectionState::Negotiating,
            ConnectionState::SocketConnecting,
        )?;
        let socket = socket_url(&negotiate_url, &negotiated.connection_id);
        *self
            .shared
            .negotiated
            .lock()
            .expect("negotiated lock poisoned") = Some(negotiated);

        let (mut writer, reader) = match ws::connect(&socket).await {
            Ok(halves) => halves,
            Err(e) => {
                return Err(self.abort_start(HubError::Transport(e.to_string())).await);
            }
        };
        log::info!("WebSocket connected to {socket}");

        // First outbound frame: the sub-protocol handshake.
        let handshake = framing::encode(&protocol::handshake());
        if let Err(e) = writer.send_text(&handshake).await {
            return Err(self
                .abort_start(HubError::SendFailed(format!("handshake send failed: {e}")))
                .await);
        }

        *self.shared.writer.lock().await = Some(writer);
        self.shared
            .transition_from(ConnectionState::SocketConnecting, ConnectionState::Open)?;
        if let Some(hook) = &self.shared.hooks.on_open {
            hook();
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned") = Some(shutdown_tx);
        tokio::spawn(run_reader(Arc::clone(&self.shared), reader, shutdown_rx));

        Ok(())
    }

    async fn abort_start(&self, error: HubError) -> HubError {
        log::error!("{error}");
        self.shared.shutdown(None, Some(&error)).await;
        error
    }

    /// Fire-and-forget invocation: no invocation id is attached, no
    /// completion is expected or processed.
    ///
    /// # Errors
    ///
    /// Returns `HubError::InvalidState` unless the connection is open,
    /// or `HubError::SendFailed` if transmission fails.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        self.ensure_open()?;
        let frame = framing::encode(&protocol::invocation(target, &arguments, None));
        self.send_frame(&frame).await
    }

    /// Correlated invocation: resolves with the deserialized server
    /// result, or rejects with the error the completion carried.
    ///
    /// The pending entry is registered before the frame is transmitted,
    /// so a fast completion cannot race the registration. If transmission
    /// itself fails the entry is discarded and the send error returned.
    ///
    /// # Errors
    ///
    /// `HubError::Server` when the server completes with an error,
    /// `HubError::ConnectionClosed` when the connection closes before a
    /// completion arrives, `HubError::Decode` when the result does not
    /// deserialize into `T`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<T, HubError> {
        self.ensure_open()?;

        let id = self.shared.invocations.next_id();
        let receiver = self.shared.invocations.register(&id);
        let frame = framing::encode(&protocol::invocation(target, &arguments, Some(&id)));

        if let Err(e) = self.send_frame(&frame).await {
            self.shared.invocations.abandon(&id);
            return Err(e);
        }

        let result = receiver
            .await
            .map_err(|_| HubError::ConnectionClosed)??;
        serde_json::from_value(result).map_err(|e| HubError::Decode(e.to_string()))
    }

    /// Close the connection, optionally carrying a reason payload.
    ///
    /// Terminal: the object cannot be restarted. Outstanding invocations
    /// are rejected with [`HubError::ConnectionClosed`].
    pub async fn close(&self, reason: Option<String>) {
        self.shared.shutdown(reason.as_deref(), None).await;
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        let state = self.shared.state();
        if state == ConnectionState::Open {
            Ok(())
        } else {
            Err(HubError::InvalidState(state))
        }
    }

    async fn send_frame(&self, frame: &str) -> Result<(), HubError> {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(HubError::ConnectionClosed)?;
        writer
            .send_text(frame)
            .await
            .map_err(|e| HubError::SendFailed(e.to_string()))
    }
}

impl fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnection")
            .field("state", &self.shared.state())
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }
}
