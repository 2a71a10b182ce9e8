//! Transport abstraction traits for Huddle.
//!
//! These traits define the interface every connection implementation must
//! provide, so sessions never depend on a concrete socket type.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Counter backing [`ConnectionId::generate`].
static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A live bidirectional text channel to one client.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next text message.
    ///
    /// Returns `Ok(None)` once the peer has closed the channel. Must be
    /// cancel-safe: sessions poll it inside `tokio::select!`.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send a text message.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn_"));
    }
}
