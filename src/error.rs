//! Error taxonomy for the hub protocol engine.
//!
//! One crate-wide error enum covers the failure classes of the engine.
//! Locally-absorbed conditions (a malformed inbound message, a completion
//! for an unknown invocation id) never surface here; they are logged at
//! the dispatch site and the connection stays open.

use crate::connection::ConnectionState;

/// Errors surfaced by hub connection operations.
#[derive(Debug)]
pub enum HubError {
    /// Negotiation request failed or returned an unusable payload.
    Negotiate(String),
    /// The underlying WebSocket transport failed.
    Transport(String),
    /// A frame could not be transmitted.
    SendFailed(String),
    /// An inbound message failed JSON decode or shape validation.
    Parse(String),
    /// The server requested a feature this client does not implement.
    Unsupported(String),
    /// The server completed an invocation with an error.
    Server(String),
    /// The connection closed before a result could arrive.
    ConnectionClosed,
    /// The operation is not legal in the connection's current state.
    InvalidState(ConnectionState),
    /// An invocation result did not deserialize into the requested type.
    Decode(String),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negotiate(msg) => write!(f, "Negotiation failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Parse(msg) => write!(f, "Protocol parse error: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported feature: {msg}"),
            Self::Server(msg) => write!(f, "{msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::InvalidState(state) => write!(f, "Operation not allowed while {state}"),
            Self::Decode(msg) => write!(f, "Result decode error: {msg}"),
        }
    }
}

impl std::error::Error for HubError {}
