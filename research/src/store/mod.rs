//! Session & checkpoint persistence
//!
//! SQLite behind a `Mutex<Connection>`. Metadata lives in `sessions`, the
//! plan/progress/results blob in `session_state`, and the latest checkpoint
//! per session in `checkpoints`. Multi-table writes happen in a single
//! transaction so readers never see a half-written session.

mod checkpoints;
pub mod schema;
mod sessions;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::model::{Checkpoint, Phase, Session, SessionSummary};

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Prefix '{prefix}' matches {count} sessions")]
    AmbiguousPrefix { prefix: String, count: usize },

    #[error("Store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Store Trait
// ============================================================================

/// Durable session storage used by the orchestrator
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session
    async fn create(&self, session: &Session) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Option<Session>>;

    /// Replace a stored session wholesale
    async fn update(&self, session: &Session) -> StoreResult<()>;

    /// Snapshot `session`, atomically replacing any previous checkpoint
    async fn save_checkpoint(&self, session: &Session) -> StoreResult<Checkpoint>;

    async fn load_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>>;

    /// Most recently updated sessions first
    async fn list(&self, limit: usize) -> StoreResult<Vec<Session>>;

    /// Metadata of one session
    async fn status(&self, id: &str) -> StoreResult<Option<SessionSummary>>;

    /// Metadata of recent sessions, optionally in one phase
    async fn list_summaries(&self, limit: usize, phase: Option<Phase>) -> StoreResult<Vec<SessionSummary>>;

    /// Resolve a unique id prefix to a full id
    async fn find_by_prefix(&self, prefix: &str) -> StoreResult<Option<String>>;

    /// Remove a session with its state and checkpoint; false if absent
    async fn delete(&self, id: &str) -> StoreResult<bool>;
}

// ============================================================================
// SQLite Database
// ============================================================================

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at a specific path
    pub fn open_at(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let db = Self::with_connection(conn)?;
        tracing::info!("Database opened at {:?}", path);
        Ok(db)
    }

    /// A private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn schema_version(&self) -> StoreResult<i32> {
        Ok(schema::get_version(&self.conn.lock())?)
    }

    /// Run blocking database work off the async runtime
    async fn blocking<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        let session = session.clone();
        self.blocking(move |db| db.insert_session(&session)).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Session>> {
        let id = id.to_string();
        self.blocking(move |db| db.fetch_session(&id)).await
    }

    async fn update(&self, session: &Session) -> StoreResult<()> {
        let session = session.clone();
        self.blocking(move |db| db.replace_session(&session)).await
    }

    async fn save_checkpoint(&self, session: &Session) -> StoreResult<Checkpoint> {
        let checkpoint = session.to_checkpoint();
        self.blocking(move |db| {
            db.write_checkpoint(&checkpoint)?;
            Ok(checkpoint)
        })
        .await
    }

    async fn load_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>> {
        let id = id.to_string();
        self.blocking(move |db| db.read_checkpoint(&id)).await
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<Session>> {
        self.blocking(move |db| db.list_sessions(limit)).await
    }

    async fn status(&self, id: &str) -> StoreResult<Option<SessionSummary>> {
        let id = id.to_string();
        self.blocking(move |db| db.session_summary(&id)).await
    }

    async fn list_summaries(&self, limit: usize, phase: Option<Phase>) -> StoreResult<Vec<SessionSummary>> {
        self.blocking(move |db| db.summaries(limit, phase)).await
    }

    async fn find_by_prefix(&self, prefix: &str) -> StoreResult<Option<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |db| db.resolve_prefix(&prefix)).await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.blocking(move |db| db.delete_session(&id)).await
    }
}

// ============================================================================
// Column helpers
// ============================================================================

fn parse_time(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", value, e)))
}

fn parse_phase(value: &str) -> StoreResult<Phase> {
    value.parse().map_err(StoreError::Corrupt)
}
