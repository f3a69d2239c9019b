//! Record-separated framing for the hub wire protocol.
//!
//! Every protocol message is self-contained JSON text followed by exactly
//! one ASCII record separator (0x1E). A single transport frame may carry
//! zero, one, or several terminated messages back to back:
//!
//! ```text
//! {"type":6}␞{"type":3,"invocationId":"0","result":5}␞
//! ```
//!
//! The codec only splits and joins; whether a segment parses as a protocol
//! message is the message model's concern (see [`crate::protocol`]).

/// ASCII record separator terminating each protocol message.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Serialize `message` and append the record separator.
pub fn encode(message: &serde_json::Value) -> String {
    let mut frame = message.to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Split a raw transport frame into individual message texts.
///
/// Empty segments are discarded: the artifact of the trailing separator,
/// and anything emptied by transport-level noise stripping (see
/// [`crate::ws::normalize_inbound`]). Segments are returned in wire order.
pub fn split(raw: &str) -> Vec<&str> {
    raw.split(RECORD_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect()
}
