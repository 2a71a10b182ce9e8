//! In-memory connections.
//!
//! [`pair`] returns the server side of a connection plus a [`MemoryClient`]
//! that plays the remote peer. Sessions can then be exercised without sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{Connection, ConnectionId, TransportError};

/// What the client side pushes towards the server.
#[derive(Debug)]
enum Inbound {
    Text(String),
    Error(String),
}

/// Create a connected pair.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryClient) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: in_rx,
        outbound: Some(out_tx),
        is_open: true,
    };
    let client = MemoryClient {
        inbound: Some(in_tx),
        outbound: Some(out_rx),
    };

    (conn, client)
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    is_open: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }

        match self.inbound.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(text)),
            Some(Inbound::Error(reason)) => {
                self.is_open = false;
                Err(TransportError::ReceiveFailed(reason))
            }
            None => {
                debug!(connection = %self.id, "Memory peer disconnected");
                self.is_open = false;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;

        outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed("peer stopped reading".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.outbound = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: Option<mpsc::UnboundedReceiver<String>>,
}

impl MemoryClient {
    /// Send a text message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the client already disconnected or the server
    /// side was dropped.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.push(Inbound::Text(text.into()))
    }

    /// Make the server's next `recv` fail with the given reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the client already disconnected.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.push(Inbound::Error(reason.into()))
    }

    /// Close the client's sending half; the server sees end of stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Stop reading; further server sends fail.
    pub fn stop_reading(&mut self) {
        self.outbound = None;
    }

    /// Wait for the next message from the server.
    ///
    /// Returns `None` once the server closed the connection and every
    /// queued message was read.
    pub async fn recv(&mut self) -> Option<String> {
        match self.outbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn push(&self, item: Inbound) -> Result<(), TransportError> {
        self.inbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(item)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_flows_both_ways() {
        let (mut conn, mut client) = pair();

        client.send("hello").unwrap();
        assert_eq!(conn.recv().await.unwrap().as_deref(), Some("hello"));

        conn.send("world".into()).await.unwrap();
        assert_eq!(client.recv().await.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_disconnect_is_end_of_stream() {
        let (mut conn, mut client) = pair();

        client.disconnect();
        assert!(conn.recv().await.unwrap().is_none());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_injected_receive_error() {
        let (mut conn, client) = pair();

        client.fail("reset by peer").unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(TransportError::ReceiveFailed(reason)) if reason == "reset by peer"
        ));
    }

    #[tokio::test]
    async fn test_send_after_peer_stops_reading() {
        let (mut conn, mut client) = pair();

        client.stop_reading();
        assert!(matches!(
            conn.send("lost".into()).await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (mut conn, mut client) = pair();

        conn.send("last".into()).await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(client.recv().await.as_deref(), Some("last"));
        assert!(client.recv().await.is_none());
        assert!(matches!(
            conn.send("late".into()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
