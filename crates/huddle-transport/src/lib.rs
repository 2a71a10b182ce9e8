//! # huddle-transport
//!
//! Connection abstraction for the Huddle room relay.
//!
//! Sessions talk to clients through the [`Connection`] trait, which carries
//! text frames in both directions:
//!
//! - **WebSocket** - an upgraded axum socket (feature `websocket`, on by default)
//! - **Memory** - an in-process pair used by tests and tools
//!
//! ```rust,ignore
//! use huddle_transport::Connection;
//!
//! async fn echo(conn: &mut dyn Connection) {
//!     while let Ok(Some(text)) = conn.recv().await {
//!         if conn.send(text).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
