//! Hublink - lightweight SignalR hub protocol client.
//!
//! This crate implements the client side of the SignalR persistent-
//! connection RPC protocol, JSON sub-protocol only: it negotiates a
//! connection over HTTP, opens a duplex WebSocket channel, frames
//! record-separated JSON messages, and exposes fire-and-forget (`send`)
//! and promise-style (`invoke`) calling conventions plus server-to-client
//! method dispatch (`on`).
//!
//! # Architecture
//!
//! ```text
//! HubConnection (connection)
//!     ├── negotiate  - HTTP round trip for the connection id
//!     ├── ws         - WebSocket transport (tokio-tungstenite wrapper)
//!     ├── framing    - 0x1E record-separated frame codec
//!     ├── protocol   - type-tagged message model
//!     ├── invocations- pending-call registry (invoke correlation)
//!     └── handlers   - server-invokable client method registry
//! ```
//!
//! Streaming invocations and binary wire formats are not supported: a
//! server-initiated stream terminates the connection, and binary frames
//! are ignored with a warning. There is no reconnection logic; construct
//! a new [`HubConnection`] to connect again.
//!
//! # Modules
//!
//! - [`connection`] - Connection lifecycle, state machine, dispatch
//! - [`protocol`] - Message shapes and two-phase parsing
//! - [`framing`] - Record-separator framing
//! - [`invocations`] - Invocation-id allocation and completion matching
//! - [`handlers`] - Case-insensitive method handler registry
//! - [`negotiate`] - HTTP negotiation collaborator
//! - [`ws`] - WebSocket transport collaborator
//! - [`error`] - Crate-wide error taxonomy

// Library modules
pub mod connection;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod invocations;
pub mod negotiate;
pub mod protocol;
pub mod ws;

// Re-export commonly used types
pub use connection::{ConnectionState, HubConnection, HubConnectionBuilder};
pub use error::HubError;
pub use negotiate::NegotiateResponse;
pub use protocol::{Classified, HubMessage};
