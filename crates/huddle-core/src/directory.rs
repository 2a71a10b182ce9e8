//! Room directory.
//!
//! The directory is the source of truth for which room codes exist. Sessions
//! only ask it one question before joining: does this code exist?

use crate::registry::RoomCode;
use async_trait::async_trait;
use dashmap::DashSet;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Default number of digits in a generated room code.
pub const DEFAULT_CODE_LENGTH: usize = 5;

/// How many fresh codes `create` tries before giving up.
pub const MAX_CREATE_ATTEMPTS: usize = 32;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backing store failed.
    #[error("Directory storage error: {0}")]
    Storage(String),

    /// Every generated code collided with an existing room.
    #[error("No free room code after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
    },
}

/// A store of valid room codes.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Check whether a room code exists.
    async fn exists(&self, code: &str) -> Result<bool, DirectoryError>;

    /// Generate, persist, and return a new unique room code.
    async fn create(&self) -> Result<RoomCode, DirectoryError>;
}

/// Generates fixed-length numeric room codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomCodeGenerator {
    length: usize,
}

impl RoomCodeGenerator {
    /// Create a generator for codes of `length` digits (at least one).
    #[must_use]
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
        }
    }

    /// Number of digits per code.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Generate a code from the thread-local RNG.
    #[must_use]
    pub fn generate(&self) -> RoomCode {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Generate a code from the given RNG.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> RoomCode {
        (0..self.length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}

impl Default for RoomCodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH)
    }
}

/// A directory that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    codes: DashSet<RoomCode>,
    generator: RoomCodeGenerator,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty directory with a custom code generator.
    #[must_use]
    pub fn with_generator(generator: RoomCodeGenerator) -> Self {
        Self {
            codes: DashSet::new(),
            generator,
        }
    }

    /// Create a directory that already knows the given codes.
    #[must_use]
    pub fn with_rooms<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoomCode>,
    {
        let directory = Self::new();
        for code in codes {
            directory.codes.insert(code.into());
        }
        directory
    }

    /// Register a code directly. Returns `false` if it already existed.
    pub fn insert(&self, code: impl Into<RoomCode>) -> bool {
        self.codes.insert(code.into())
    }

    /// Number of known codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Check if no code is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn exists(&self, code: &str) -> Result<bool, DirectoryError> {
        Ok(self.codes.contains(code))
    }

    async fn create(&self) -> Result<RoomCode, DirectoryError> {
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let code = self.generator.generate();
            if self.codes.insert(code.clone()) {
                debug!(room = %code, "Created room");
                return Ok(code);
            }
        }

        Err(DirectoryError::Exhausted {
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }
}
