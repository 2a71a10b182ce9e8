//! # huddle-protocol
//!
//! Wire messages for the Huddle room relay.
//!
//! The protocol is deliberately plain: every message the server writes is a
//! single WebSocket text frame in one of three shapes.
//!
//! - **Chat** - `"<display name>: <text>"`, raw text
//! - **Event** - `{"type": "members_update", "count": N}`, JSON text
//! - **Room not found** - the literal `"NO ROOM EXISTS"`, followed by close
//!
//! Clients send raw text only; each inbound text frame is one chat message.
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Outbound};
//!
//! let line = codec::encode(&Outbound::members_update(3)).unwrap();
//! assert_eq!(line, r#"{"type":"members_update","count":3}"#);
//!
//! let decoded = codec::decode("alice: hi").unwrap();
//! assert_eq!(decoded, Outbound::chat("alice", "hi"));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use events::{Outbound, RoomEvent, ROOM_NOT_FOUND};
