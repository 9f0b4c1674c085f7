//! `SQLite`-backed persistence for the matrix engine.
//!
//! One database holds the four engine tables plus the user directory
//! and the standalone ledger tables:
//!
//! - `queue_entry`: durable entry queue (append-only, `processed` flag)
//! - `matrix_position`: the position trees, one row per slot, never
//!   deleted
//! - `matrix_level_state`: per-level `positions_filled` counters
//! - `cron_lock_state`: the singleton run lock (compare-and-swap)
//! - `users`: user directory with sponsor pointers
//! - `ledger_transaction` / `ledger_balance`: the durable ledger
//!   stand-in (see [`crate::ledger`])
//!
//! All timestamps are stored as integer Unix milliseconds. The
//! connection is shared behind `Arc<Mutex<_>>`; WAL mode keeps readers
//! from blocking the single writer.

mod lock;
mod queue;
mod tree;

pub use queue::QueueFilter;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::info;

/// Engine schema. `CREATE IF NOT EXISTS` keeps startup idempotent; the
/// singleton lock row is seeded here so the CAS update always has a row
/// to guard.
const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        sponsor_id TEXT
    );

    CREATE TABLE IF NOT EXISTS queue_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        username TEXT NOT NULL,
        level INTEGER NOT NULL,
        enqueued_at INTEGER NOT NULL,
        entry_type TEXT NOT NULL,
        sponsor_hint TEXT,
        processed INTEGER NOT NULL DEFAULT 0,
        processed_at INTEGER,
        failure_reason TEXT,
        placed_position_id TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queue_pending
        ON queue_entry(processed, enqueued_at, id);

    CREATE TABLE IF NOT EXISTS matrix_position (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        username TEXT NOT NULL,
        level INTEGER NOT NULL,
        parent_position_id TEXT,
        slot_index INTEGER NOT NULL,
        position_path TEXT NOT NULL,
        sponsor_id TEXT,
        status TEXT NOT NULL,
        total_earned INTEGER NOT NULL DEFAULT 0,
        cycle_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        UNIQUE (parent_position_id, slot_index)
    );

    CREATE INDEX IF NOT EXISTS idx_position_parent
        ON matrix_position(parent_position_id);
    CREATE INDEX IF NOT EXISTS idx_position_user_level
        ON matrix_position(user_id, level, created_at);
    CREATE INDEX IF NOT EXISTS idx_position_level_roots
        ON matrix_position(level, created_at)
        WHERE parent_position_id IS NULL;

    CREATE TABLE IF NOT EXISTS matrix_level_state (
        level INTEGER PRIMARY KEY,
        positions_filled INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS cron_lock_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        active INTEGER NOT NULL DEFAULT 0,
        stuck INTEGER NOT NULL DEFAULT 0,
        last_run INTEGER,
        last_processed_entry_id INTEGER
    );
    INSERT OR IGNORE INTO cron_lock_state (id, active, stuck) VALUES (1, 0, 0);

    CREATE TABLE IF NOT EXISTS ledger_transaction (
        reference_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        user_id TEXT NOT NULL,
        amount INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (reference_id, kind)
    );

    CREATE TABLE IF NOT EXISTS ledger_balance (
        user_id TEXT PRIMARY KEY,
        balance INTEGER NOT NULL DEFAULT 0
    );
";

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// The shared connection mutex was poisoned by a panicking thread.
    #[error("connection lock poisoned")]
    Poisoned,

    /// A persisted row failed to decode (bad status string, bad
    /// timestamp). Treated as a structural error by the engine.
    #[error("corrupt row: {detail}")]
    Corrupt {
        /// Description of the offending row and field.
        detail: String,
    },

    /// A username referenced by the admin surface does not exist.
    #[error("unknown user: {username}")]
    UnknownUser {
        /// The unresolved username.
        username: String,
    },
}

/// Shared handle to the engine database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies
    /// the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if the file cannot be opened or the
    /// schema fails to apply.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "opened engine database");
        Ok(store)
    }

    /// Opens an in-memory database. Test and tooling use only; the
    /// engine's durability guarantees obviously do not hold.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if schema setup fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection handle, for collaborators living in the same
    /// database (the standalone ledger).
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ---- user directory -------------------------------------------------

    /// Inserts or updates a directory user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn upsert_user(
        &self,
        user_id: &str,
        username: &str,
        sponsor_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, username, sponsor_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET username = ?2, sponsor_id = ?3",
            params![user_id, username, sponsor_id],
        )?;
        Ok(())
    }

    /// Looks up `(username, sponsor_id)` for a user id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn find_user(&self, user_id: &str) -> Result<Option<(String, Option<String>)>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT username, sponsor_id FROM users WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Resolves a username to a user id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn find_user_by_username(&self, username: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT user_id FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Ordered ancestor chain for a user (direct sponsor first),
    /// bounded by `max_depth`. A sponsor loop in the directory
    /// terminates at the bound rather than spinning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn sponsor_chain(&self, user_id: &str, max_depth: u32) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut chain = Vec::new();
        let mut current = user_id.to_string();
        for _ in 0..max_depth {
            let sponsor: Option<Option<String>> = conn
                .query_row(
                    "SELECT sponsor_id FROM users WHERE user_id = ?1",
                    params![current],
                    |row| row.get(0),
                )
                .optional()?;
            match sponsor.flatten() {
                Some(sponsor_id) => {
                    if sponsor_id == user_id || chain.contains(&sponsor_id) {
                        break;
                    }
                    chain.push(sponsor_id.clone());
                    current = sponsor_id;
                },
                None => break,
            }
        }
        Ok(chain)
    }
}

/// Decodes a stored millisecond timestamp.
pub(crate) fn decode_ms(ms: i64, context: &str) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt {
            detail: format!("{context}: bad timestamp {ms}"),
        })
}
