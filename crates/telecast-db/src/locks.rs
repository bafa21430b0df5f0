//! Advisory locks backing the single-flight guard.
//!
//! One UPSERT does the whole acquire: a fresh row wins, an expired row is
//! taken over, a live row leaves `changes() == 0`. No read-then-write race.

use chrono::{Duration, Utc};
use telecast_core::error::{Result, TelecastError};

use crate::Database;

fn store_err(e: rusqlite::Error) -> TelecastError {
    TelecastError::Lock(e.to_string())
}

impl Database {
    /// Try to take the named lock for `ttl_secs`. Returns false when another
    /// holder has it and it has not expired.
    pub fn acquire_lock(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_secs);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO advisory_locks (name, holder, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE
                 SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE advisory_locks.expires_at <= ?4",
                rusqlite::params![
                    name,
                    holder,
                    expires_at.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    /// Release the named lock if this holder still owns it. Releasing a lock
    /// someone else took over (after our TTL lapsed) is a no-op.
    pub fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM advisory_locks WHERE name = ?1 AND holder = ?2",
            rusqlite::params![name, holder],
        )
        .map_err(store_err)?;
        Ok(())
    }
}
