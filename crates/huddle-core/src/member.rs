//! Room members.
//!
//! A [`Member`] is the registry's handle on one connected client: an identity,
//! a display name, and the sending half of a bounded outbound queue. The
//! session that owns the connection holds the matching [`Outbox`] and writes
//! whatever arrives there to the socket.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default capacity of a member's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// An encoded message shared by every recipient of a broadcast.
pub type Payload = Arc<str>;

/// Counter backing [`MemberId::next`].
static NEXT_MEMBER: AtomicU64 = AtomicU64::new(1);

/// Identity of a member. Two members with the same display name are still
/// different members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u64);

impl MemberId {
    /// Allocate a fresh, process-unique identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_MEMBER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member_{}", self.0)
    }
}

/// Why a payload could not be queued for a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The member's session is gone.
    #[error("outbound queue closed")]
    Closed,

    /// The member stopped draining its queue.
    #[error("outbound queue full")]
    Full,
}

/// A connected client as seen by the registry.
#[derive(Debug, Clone)]
pub struct Member {
    id: MemberId,
    name: String,
    joined_at: Instant,
    outbox: mpsc::Sender<Payload>,
}

impl Member {
    /// Create a member and the outbox its session drains.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let member = Self {
            id: MemberId::next(),
            name: name.into(),
            joined_at: Instant::now(),
            outbox: tx,
        };
        (member, Outbox { rx })
    }

    /// Get the member's identity.
    #[must_use]
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Get the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the member handle was created.
    #[must_use]
    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    /// Queue a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or its receiver was dropped.
    pub fn deliver(&self, payload: &Payload) -> Result<(), DeliveryError> {
        self.outbox
            .try_send(Arc::clone(payload))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }
}

/// Receiving half of a member's outbound queue.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Payload>,
}

impl Outbox {
    /// Wait for the next payload.
    ///
    /// Returns `None` once the registry dropped the member, which happens
    /// when it leaves or is evicted. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Take a payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Take every queued payload as owned text.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(payload) = self.try_recv() {
            out.push(payload.to_string());
        }
        out
    }
}
