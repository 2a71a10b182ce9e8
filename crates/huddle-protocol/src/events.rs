//! Message types for the Huddle protocol.

use serde::{Deserialize, Serialize};

/// Text sent to a client that asked to join a room the directory does not know.
pub const ROOM_NOT_FOUND: &str = "NO ROOM EXISTS";

/// Structured room events, serialized as JSON text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// The number of connected members in the room changed.
    MembersUpdate {
        /// Members connected after the change.
        count: usize,
    },
}

/// A message written by the server to a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A chat line relayed from a room member.
    Chat {
        /// Display name of the member who sent the text.
        sender: String,
        /// The text as received.
        text: String,
    },
    /// A structured room event.
    Event(RoomEvent),
    /// The requested room code has no directory entry.
    RoomNotFound,
}

impl Outbound {
    /// Create a chat message.
    #[must_use]
    pub fn chat(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Outbound::Chat {
            sender: sender.into(),
            text: text.into(),
        }
    }

    /// Create a member count update.
    #[must_use]
    pub fn members_update(count: usize) -> Self {
        Outbound::Event(RoomEvent::MembersUpdate { count })
    }
}
