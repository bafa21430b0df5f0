//! SQLite persistence for Telecast: the Schedule Store, the Outcome Ledger,
//! and the advisory-lock table behind the single-flight guard.
//!
//! The ledger's UNIQUE(message_id, destination_id, scheduled_local)
//! constraint is the one place in the system that needs atomicity: claiming
//! a triple is an INSERT that either lands or conflicts. Everything else is
//! read optimistically and overwritten with whatever is current.

mod ledger;
mod locks;
mod store;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use telecast_core::error::{Result, TelecastError};

pub use ledger::AttemptTally;

/// Shared handle to the Telecast database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TelecastError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TelecastError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TelecastError::Store(format!("DB lock poisoned: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            -- Scheduled messages with destination list and target instants
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                destinations TEXT NOT NULL,      -- JSON array of destination ids
                text TEXT NOT NULL,
                media TEXT NOT NULL DEFAULT '[]', -- JSON array of {kind, locator}
                timezone TEXT NOT NULL,
                local_times TEXT NOT NULL,       -- JSON array, author-local, canonical
                utc_times TEXT NOT NULL,         -- JSON array, index-aligned, null = stale
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Destination channels; metadata refreshed by external collaborators
            CREATE TABLE IF NOT EXISTS destinations (
                id TEXT PRIMARY KEY,
                channel_handle TEXT NOT NULL,
                title TEXT,
                member_count INTEGER,
                refreshed_at TEXT
            );

            -- Outcome Ledger: one row per delivery obligation.
            -- The UNIQUE constraint is the claim serialization point.
            CREATE TABLE IF NOT EXISTS delivery_attempts (
                message_id TEXT NOT NULL,
                destination_id TEXT NOT NULL,
                scheduled_local TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sending',  -- sending, sent, failed
                external_ref TEXT,
                error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 1,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                UNIQUE (message_id, destination_id, scheduled_local)
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_message
                ON delivery_attempts (message_id);
            CREATE INDEX IF NOT EXISTS idx_attempts_status
                ON delivery_attempts (status);

            -- Advisory locks for the single-flight guard
            CREATE TABLE IF NOT EXISTS advisory_locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| TelecastError::Store(format!("Migration: {e}")))?;
        Ok(())
    }
}
