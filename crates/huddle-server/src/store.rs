//! SQLite-backed room directory.
//!
//! Room codes survive restarts. Membership never touches the database; only
//! `create_room` writes and every WebSocket handshake reads.

use async_trait::async_trait;
use huddle_core::directory::MAX_CREATE_ATTEMPTS;
use huddle_core::{Directory, DirectoryError, RoomCode, RoomCodeGenerator};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL UNIQUE
)";

fn storage(e: rusqlite::Error) -> DirectoryError {
    DirectoryError::Storage(e.to_string())
}

/// A directory stored in a SQLite database.
pub struct SqliteDirectory {
    connection: Mutex<Connection>,
    generator: RoomCodeGenerator,
}

impl SqliteDirectory {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// applied.
    pub fn open(
        path: impl AsRef<Path>,
        generator: RoomCodeGenerator,
    ) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let connection = Connection::open(path).map_err(storage)?;
        info!("Opened room directory at {}", path.display());
        Self::with_connection(connection, generator)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory(generator: RoomCodeGenerator) -> Result<Self, DirectoryError> {
        let connection = Connection::open_in_memory().map_err(storage)?;
        Self::with_connection(connection, generator)
    }

    fn with_connection(
        connection: Connection,
        generator: RoomCodeGenerator,
    ) -> Result<Self, DirectoryError> {
        connection.execute(SCHEMA, []).map_err(storage)?;
        Ok(Self {
            connection: Mutex::new(connection),
            generator,
        })
    }
}

fn insert_code(connection: &Connection, code: &str) -> Result<bool, DirectoryError> {
    let changed = connection
        .execute("INSERT OR IGNORE INTO rooms (code) VALUES (?1)", params![code])
        .map_err(storage)?;
    Ok(changed == 1)
}

#[async_trait]
impl Directory for SqliteDirectory {
    async fn exists(&self, code: &str) -> Result<bool, DirectoryError> {
        let connection = self.connection.lock().await;
        let found = connection
            .query_row("SELECT 1 FROM rooms WHERE code = ?1", params![code], |_| Ok(()))
            .optional()
            .map_err(storage)?;
        Ok(found.is_some())
    }

    async fn create(&self) -> Result<RoomCode, DirectoryError> {
        let connection = self.connection.lock().await;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let code = self.generator.generate();
            if insert_code(&connection, &code)? {
                debug!(room = %code, "Created room");
                return Ok(code);
            }
        }

        Err(DirectoryError::Exhausted {
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }
}

impl std::fmt::Debug for SqliteDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDirectory")
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[tokio::test]
    async fn test_create_then_exists() {
        let directory = SqliteDirectory::open_in_memory(RoomCodeGenerator::default()).unwrap();

        let code = directory.create().await.unwrap();
        assert_eq!(code.len(), 5);
        assert!(directory.exists(&code).await.unwrap());
        assert!(!directory.exists("00000x").await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let directory = SqliteDirectory::open_in_memory(RoomCodeGenerator::default()).unwrap();

        {
            let connection = directory.connection.lock().await;
            assert!(insert_code(&connection, "12345").unwrap());
            assert!(!insert_code(&connection, "12345").unwrap());
        }
        assert!(directory.exists("12345").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_exhausted() {
        let directory = SqliteDirectory::open_in_memory(RoomCodeGenerator::new(1)).unwrap();
        {
            let connection = directory.connection.lock().await;
            for digit in 0..10 {
                insert_code(&connection, &digit.to_string()).unwrap();
            }
        }

        assert!(matches!(
            directory.create().await,
            Err(DirectoryError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_rooms_survive_reopen() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let file = format!("huddle-{}-{}.db", std::process::id(), nanos);
        let path = std::env::temp_dir().join(file);

        let code = {
            let directory = SqliteDirectory::open(&path, RoomCodeGenerator::default()).unwrap();
            directory.create().await.unwrap()
        };

        let reopened = SqliteDirectory::open(&path, RoomCodeGenerator::default()).unwrap();
        assert!(reopened.exists(&code).await.unwrap());

        drop(reopened);
        std::fs::remove_file(&path).unwrap();
    }
}
