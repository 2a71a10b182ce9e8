//! # huddle-core
//!
//! Room membership and message fan-out for the Huddle relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Which members are connected to which room, with fan-out
//! - **Member** - A connected client's identity and outbound queue
//! - **Directory** - The source of truth for which room codes exist
//! - **Session** - The per-connection lifecycle tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│   Session   │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        │            │  Directory  │     │   Outbox    │
//!        │            └─────────────┘     └─────────────┘
//!        └───────────────────────────────────────┘
//! ```

pub mod directory;
pub mod member;
pub mod registry;
pub mod session;

pub use directory::{Directory, DirectoryError, InMemoryDirectory, RoomCodeGenerator};
pub use member::{DeliveryError, Member, MemberId, Outbox, Payload};
pub use registry::{MemberInfo, MembershipGuard, Registry, RegistryStats, RoomCode};
pub use session::{
    CloseReason, Session, SessionConfig, SessionError, SessionOutcome, SessionState, SessionStats,
};
