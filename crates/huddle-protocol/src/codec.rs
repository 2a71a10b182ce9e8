//! Text codec for Huddle messages.
//!
//! Chat lines and the room-not-found notice are raw text; room events are JSON.

use thiserror::Error;

use crate::events::{Outbound, RoomEvent, ROOM_NOT_FOUND};

/// Default upper bound for a single inbound text frame (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Separator between the sender's display name and the text of a chat line.
pub const CHAT_SEPARATOR: &str = ": ";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Text that matches none of the known message shapes.
    #[error("Unrecognized message: {0}")]
    Decode(String),
}

/// Format a chat line.
fn chat_line(sender: &str, text: &str) -> String {
    let mut line = String::with_capacity(sender.len() + CHAT_SEPARATOR.len() + text.len());
    line.push_str(sender);
    line.push_str(CHAT_SEPARATOR);
    line.push_str(text);
    line
}

/// Encode a message to the text written on the wire.
///
/// # Errors
///
/// Returns an error if a structured event fails to serialize.
pub fn encode(message: &Outbound) -> Result<String, ProtocolError> {
    match message {
        Outbound::Chat { sender, text } => Ok(chat_line(sender, text)),
        Outbound::Event(event) => Ok(serde_json::to_string(event)?),
        Outbound::RoomNotFound => Ok(ROOM_NOT_FOUND.to_string()),
    }
}

/// Classify a text frame received from a Huddle server.
///
/// JSON room events are tried first, then the room-not-found literal, and
/// anything else is read as a chat line split at the first separator. Display
/// names are free-form, so a name containing `": "` splits early.
///
/// # Errors
///
/// Returns an error if the text has none of the known shapes.
pub fn decode(text: &str) -> Result<Outbound, ProtocolError> {
    if text.starts_with('{') {
        if let Ok(event) = serde_json::from_str::<RoomEvent>(text) {
            return Ok(Outbound::Event(event));
        }
    }

    if text == ROOM_NOT_FOUND {
        return Ok(Outbound::RoomNotFound);
    }

    text.split_once(CHAT_SEPARATOR)
        .map(|(sender, body)| Outbound::chat(sender, body))
        .ok_or_else(|| ProtocolError::Decode(text.to_string()))
}
