//! Per-connection session lifecycle.
//!
//! A session walks `Connecting -> Validating -> Active -> Closed`:
//!
//! 1. **Validating** asks the directory whether the room exists. Unknown rooms
//!    get `"NO ROOM EXISTS"` and the connection is closed without ever
//!    touching the registry.
//! 2. **Active** joins the room and relays until the peer goes away, the
//!    socket fails, or the registry evicts the member.
//! 3. **Closed** is terminal. Leaving the room is tied to a drop guard, so
//!    it also happens when the session's task is cancelled.

use crate::directory::{Directory, DirectoryError};
use crate::member::{Member, Payload, DEFAULT_OUTBOUND_CAPACITY};
use crate::registry::{Registry, RoomCode};
use huddle_protocol::{codec, Outbound};
use huddle_transport::{Connection, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Channel accepted, nothing checked yet.
    Connecting,
    /// Waiting for the directory.
    Validating,
    /// Member of the room.
    Active,
    /// Terminal.
    Closed,
}

/// Reasons a session never became active.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The room code has no directory entry.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomCode),

    /// The directory could not be consulted.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Why an active session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the channel.
    PeerClosed,
    /// Reading from the channel failed.
    ReceiveError(String),
    /// Writing to the channel failed.
    SendFailure(String),
    /// The registry dropped the member after a refused delivery.
    Evicted,
}

impl CloseReason {
    /// Short label used for logging and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReceiveError(_) => "receive_error",
            CloseReason::SendFailure(_) => "send_failure",
            CloseReason::Evicted => "evicted",
        }
    }
}

/// Traffic counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Text messages read from the client.
    pub received: u64,
    /// Bytes read from the client.
    pub bytes_received: u64,
    /// Text messages written to the client.
    pub sent: u64,
    /// Bytes written to the client.
    pub bytes_sent: u64,
}

/// How a session finished.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Closed during validation; the registry was never touched.
    Rejected(SessionError),
    /// Closed after being active.
    Ended {
        /// Why it ended.
        reason: CloseReason,
        /// Traffic while active.
        stats: SessionStats,
    },
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the member's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// One step of the active loop.
enum Event {
    Outbound(Option<Payload>),
    Inbound(Result<Option<String>, TransportError>),
}

/// A client session scoped to one room and one display name.
pub struct Session {
    room_code: RoomCode,
    display_name: String,
    registry: Arc<Registry>,
    directory: Arc<dyn Directory>,
    config: SessionConfig,
    state: SessionState,
}

impl Session {
    /// Create a session in the `Connecting` state.
    #[must_use]
    pub fn new(
        room_code: impl Into<RoomCode>,
        display_name: impl Into<String>,
        registry: Arc<Registry>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            room_code: room_code.into(),
            display_name: display_name.into(),
            registry,
            directory,
            config: SessionConfig::default(),
            state: SessionState::Connecting,
        }
    }

    /// Use a custom configuration.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the room code.
    #[must_use]
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// Drive the session to completion over `conn`.
    pub async fn run<C>(mut self, conn: &mut C) -> SessionOutcome
    where
        C: Connection + ?Sized,
    {
        self.transition(conn, SessionState::Validating);

        match self.directory.exists(&self.room_code).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection = %conn.id(), room = %self.room_code, "Room not found");
                match codec::encode(&Outbound::RoomNotFound) {
                    Ok(notice) => {
                        if let Err(e) = conn.send(notice).await {
                            debug!(
                                connection = %conn.id(),
                                error = %e,
                                "Failed to send room-not-found notice"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to encode room-not-found notice"),
                }
                self.close(conn).await;
                return SessionOutcome::Rejected(SessionError::RoomNotFound(self.room_code));
            }
            Err(e) => {
                error!(
                    connection = %conn.id(),
                    room = %self.room_code,
                    error = %e,
                    "Directory lookup failed"
                );
                self.close(conn).await;
                return SessionOutcome::Rejected(e.into());
            }
        }

        let (member, mut outbox) =
            Member::new(self.display_name.clone(), self.config.outbound_capacity);
        let membership = self.registry.join_guarded(&self.room_code, member);
        self.transition(conn, SessionState::Active);
        debug!(
            connection = %conn.id(),
            room = %self.room_code,
            member = %membership.member(),
            name = %self.display_name,
            "Joined room"
        );

        let member_id = membership.member();
        let mut stats = SessionStats::default();
        let reason = loop {
            let event = tokio::select! {
                biased;

                payload = outbox.recv() => Event::Outbound(payload),
                inbound = conn.recv() => Event::Inbound(inbound),
            };

            match event {
                Event::Outbound(Some(payload)) => {
                    let len = payload.len() as u64;
                    if let Err(e) = conn.send(payload.to_string()).await {
                        warn!(connection = %conn.id(), error = %e, "Send failed");
                        break CloseReason::SendFailure(e.to_string());
                    }
                    stats.sent += 1;
                    stats.bytes_sent += len;
                }
                Event::Outbound(None) => {
                    debug!(connection = %conn.id(), "Evicted from room");
                    break CloseReason::Evicted;
                }
                Event::Inbound(Ok(Some(text))) => {
                    stats.received += 1;
                    stats.bytes_received += text.len() as u64;
                    let recipients =
                        self.registry.broadcast_message(&self.room_code, member_id, &text);
                    if recipients == 0 {
                        // The sender always receives its own line while it is a member.
                        debug!(connection = %conn.id(), "No longer a member of the room");
                        break CloseReason::Evicted;
                    }
                    trace!(connection = %conn.id(), recipients, "Relayed inbound message");
                }
                Event::Inbound(Ok(None)) => break CloseReason::PeerClosed,
                Event::Inbound(Err(e)) => {
                    debug!(connection = %conn.id(), error = %e, "Receive failed");
                    break CloseReason::ReceiveError(e.to_string());
                }
            }
        };

        drop(membership);
        self.close(conn).await;
        debug!(
            connection = %conn.id(),
            room = %self.room_code,
            reason = reason.kind(),
            "Session ended"
        );

        SessionOutcome::Ended { reason, stats }
    }

    async fn close<C>(&mut self, conn: &mut C)
    where
        C: Connection + ?Sized,
    {
        if conn.is_open() {
            if let Err(e) = conn.close().await {
                trace!(connection = %conn.id(), error = %e, "Close failed");
            }
        }
        self.transition(conn, SessionState::Closed);
    }

    fn transition<C>(&mut self, conn: &C, next: SessionState)
    where
        C: Connection + ?Sized,
    {
        trace!(connection = %conn.id(), from = ?self.state, to = ?next, "Session transition");
        self.state = next;
    }
}
