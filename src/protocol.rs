//! Hub protocol message model.
//!
//! Wire messages are JSON objects discriminated by an integer `type`
//! field. Parsing is two-phase: a generic JSON decode, then shape
//! validation for the declared tag. An unrecognized tag classifies as
//! [`Classified::Unknown`] rather than erroring, so the dispatcher can
//! log it and keep processing sibling messages from the same frame.
//!
//! Outbound traffic is limited to the handshake object and invocation
//! messages; the builders at the bottom of this module produce those
//! wire shapes. The engine never constructs stream-invocation or
//! cancellation messages.

use serde::Deserialize;
use serde_json::Value;

use crate::error::HubError;

/// Wire codes for the `type` discriminator.
pub mod message_type {
    /// Remote call request.
    pub const INVOCATION: u64 = 1;
    /// Item produced by an active stream invocation.
    pub const STREAM_ITEM: u64 = 2;
    /// Terminal reply to an invocation.
    pub const COMPLETION: u64 = 3;
    /// Stream invocation request.
    pub const STREAM_INVOCATION: u64 = 4;
    /// Stream cancellation request.
    pub const CANCEL_INVOCATION: u64 = 5;
    /// Keep-alive.
    pub const PING: u64 = 6;
    /// Forced termination.
    pub const CLOSE: u64 = 7;
}

/// A shape-validated protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A remote call request, in either direction.
    Invocation {
        /// Correlation id; absent for fire-and-forget invocations.
        invocation_id: Option<String>,
        /// Method name, matched case-insensitively by the receiver.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// An item for an active stream invocation. Streaming is unsupported;
    /// the message parses but produces no effect.
    StreamItem {
        /// Correlation id of the stream invocation.
        invocation_id: String,
        /// The streamed item.
        item: Value,
    },
    /// The terminal reply to an invocation.
    Completion {
        /// Correlation id of the invocation being completed.
        invocation_id: String,
        /// Result value; may be absent even on success.
        result: Option<Value>,
        /// Error text; mutually exclusive with `result`.
        error: Option<String>,
    },
    /// A stream invocation request. Recognized but unsupported: receipt
    /// forces connection closure.
    StreamInvocation {
        /// Correlation id for the requested stream.
        invocation_id: String,
        /// Method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// A stream cancellation. Recognized, never emitted by this engine.
    CancelInvocation {
        /// Correlation id of the stream to cancel.
        invocation_id: String,
    },
    /// Keep-alive; received and ignored.
    Ping,
    /// Forced termination, optionally carrying a server error.
    Close {
        /// Server-supplied error text, if any.
        error: Option<String>,
    },
}

/// Outcome of classifying one decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// A message with a recognized, shape-valid tag.
    Message(HubMessage),
    /// Structurally valid JSON carrying an unrecognized `type` value.
    Unknown(u64),
}

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    tag: u64,
}

#[derive(Deserialize)]
struct InvocationFields {
    #[serde(rename = "invocationId")]
    invocation_id: Option<String>,
    target: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Deserialize)]
struct StreamItemFields {
    #[serde(rename = "invocationId")]
    invocation_id: String,
    item: Value,
}

#[derive(Deserialize)]
struct CompletionFields {
    #[serde(rename = "invocationId")]
    invocation_id: String,
    result: Option<Value>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamInvocationFields {
    #[serde(rename = "invocationId")]
    invocation_id: String,
    target: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Deserialize)]
struct CancelInvocationFields {
    #[serde(rename = "invocationId")]
    invocation_id: String,
}

#[derive(Deserialize)]
struct CloseFields {
    error: Option<String>,
}

fn shape<'a, T: Deserialize<'a>>(text: &'a str, tag: u64) -> Result<T, HubError> {
    serde_json::from_str(text)
        .map_err(|e| HubError::Parse(format!("bad shape for message type {tag}: {e}")))
}

/// Parse one message text into a classified protocol message.
///
/// Errors cover invalid JSON and shape violations for a recognized tag;
/// an unrecognized tag is [`Classified::Unknown`], not an error. Callers
/// skip the offending segment and continue with its siblings.
pub fn parse(text: &str) -> Result<Classified, HubError> {
    let probe: TypeProbe = serde_json::from_str(text)
        .map_err(|e| HubError::Parse(format!("invalid message JSON: {e}")))?;

    let message = match probe.tag {
        message_type::INVOCATION => {
            let fields: InvocationFields = shape(text, probe.tag)?;
            HubMessage::Invocation {
                invocation_id: fields.invocation_id,
                target: fields.target,
                arguments: fields.arguments,
            }
        }
        message_type::STREAM_ITEM => {
            let fields: StreamItemFields = shape(text, probe.tag)?;
            HubMessage::StreamItem {
                invocation_id: fields.invocation_id,
                item: fields.item,
            }
        }
        message_type::COMPLETION => {
            let fields: CompletionFields = shape(text, probe.tag)?;
            if fields.result.is_some() && fields.error.is_some() {
                return Err(HubError::Parse(
                    "completion carries both result and error".to_string(),
                ));
            }
            HubMessage::Completion {
                invocation_id: fields.invocation_id,
                result: fields.result,
                error: fields.error,
            }
        }
        message_type::STREAM_INVOCATION => {
            let fields: StreamInvocationFields = shape(text, probe.tag)?;
            HubMessage::StreamInvocation {
                invocation_id: fields.invocation_id,
                target: fields.target,
                arguments: fields.arguments,
            }
        }
        message_type::CANCEL_INVOCATION => {
            let fields: CancelInvocationFields = shape(text, probe.tag)?;
            HubMessage::CancelInvocation {
                invocation_id: fields.invocation_id,
            }
        }
        message_type::PING => HubMessage::Ping,
        message_type::CLOSE => {
            let fields: CloseFields = shape(text, probe.tag)?;
            HubMessage::Close {
                error: fields.error,
            }
        }
        other => return Ok(Classified::Unknown(other)),
    };

    Ok(Classified::Message(message))
}

/// Build the wire object for an outbound invocation.
///
/// `invocation_id` of `None` produces the fire-and-forget shape: the
/// server will not reply with a completion.
pub fn invocation(target: &str, arguments: &[Value], invocation_id: Option<&str>) -> Value {
    let mut message = serde_json::json!({
        "target": target,
        "arguments": arguments,
        "type": message_type::INVOCATION,
    });
    if let Some(id) = invocation_id {
        message["invocationId"] = Value::String(id.to_string());
    }
    message
}

/// Build the handshake negotiation object, the first message sent after
/// transport open.
pub fn handshake() -> Value {
    serde_json::json!({"protocol": "json", "version": 1})
}
