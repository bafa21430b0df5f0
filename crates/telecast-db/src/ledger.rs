//! Outcome Ledger: the claim-before-send deduplication mechanism.
//!
//! [`Database::try_claim`] inserts a `sending` row under the table's UNIQUE
//! key; a constraint conflict means another worker owns the triple. This is
//! the sole correctness-critical dedup — the single-flight guard only cuts
//! down on wasted scans. `finalize_*` can only move a row out of `sending`,
//! so no code path (including the reconciliation sweep) can produce a second
//! `sent` row for the same key.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use telecast_core::error::{Result, TelecastError};
use telecast_core::types::{AttemptStatus, DeliveryAttempt, DeliveryKey};

use crate::store::{fmt_local, parse_local, parse_utc};
use crate::Database;

fn store_err(e: rusqlite::Error) -> TelecastError {
    TelecastError::Store(e.to_string())
}

/// Per-status row counts for one message, consumed by the status updater.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptTally {
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<RawAttempt> {
    Ok(RawAttempt {
        message_id: row.get(0)?,
        destination_id: row.get(1)?,
        scheduled_local: row.get(2)?,
        status: row.get(3)?,
        external_ref: row.get(4)?,
        error: row.get(5)?,
        attempt_count: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
        duration_ms: row.get(9)?,
    })
}

struct RawAttempt {
    message_id: String,
    destination_id: String,
    scheduled_local: String,
    status: String,
    external_ref: Option<String>,
    error: Option<String>,
    attempt_count: i64,
    started_at: String,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
}

impl RawAttempt {
    fn decode(self) -> Result<DeliveryAttempt> {
        Ok(DeliveryAttempt {
            key: DeliveryKey {
                message_id: self.message_id,
                destination_id: self.destination_id,
                scheduled_local: parse_local(&self.scheduled_local)?,
            },
            status: AttemptStatus::parse(&self.status)?,
            external_ref: self.external_ref,
            error: self.error,
            attempt_count: self.attempt_count as u32,
            started_at: parse_utc(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_utc).transpose()?,
            duration_ms: self.duration_ms,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "message_id, destination_id, scheduled_local, status, \
     external_ref, error, attempt_count, started_at, finished_at, duration_ms";

impl Database {
    /// Atomically claim a triple for processing.
    ///
    /// Returns `Ok(false)` when the key already has a row — another worker
    /// owns it, or it was already handled. Contention is expected and never
    /// an error.
    pub fn try_claim(&self, key: &DeliveryKey) -> Result<bool> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO delivery_attempts
             (message_id, destination_id, scheduled_local, status, attempt_count, started_at)
             VALUES (?1, ?2, ?3, 'sending', 1, ?4)",
            rusqlite::params![
                key.message_id,
                key.destination_id,
                fmt_local(&key.scheduled_local),
                Utc::now().to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// Record a successful delivery. Only transitions a `sending` row;
    /// returns whether a row actually changed.
    pub fn finalize_sent(&self, key: &DeliveryKey, external_ref: &str) -> Result<bool> {
        self.finalize(key, AttemptStatus::Sent, Some(external_ref), None)
    }

    /// Record a failed delivery. Only transitions a `sending` row.
    pub fn finalize_failed(&self, key: &DeliveryKey, error: &str) -> Result<bool> {
        self.finalize(key, AttemptStatus::Failed, None, Some(error))
    }

    fn finalize(
        &self,
        key: &DeliveryKey,
        status: AttemptStatus,
        external_ref: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status != AttemptStatus::Sending);
        let now = Utc::now();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE delivery_attempts
                 SET status = ?1, external_ref = ?2, error = ?3, finished_at = ?4,
                     duration_ms = CAST((julianday(?4) - julianday(started_at)) * 86400000 AS INTEGER)
                 WHERE message_id = ?5 AND destination_id = ?6 AND scheduled_local = ?7
                   AND status = 'sending'",
                rusqlite::params![
                    status.as_str(),
                    external_ref,
                    error,
                    now.to_rfc3339(),
                    key.message_id,
                    key.destination_id,
                    fmt_local(&key.scheduled_local),
                ],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    /// True when the key already has a row, whatever its status — the
    /// scanner must not re-emit it. A `failed` row still conflicts the claim
    /// INSERT, so re-emitting it could only burn a work-item slot on a claim
    /// the worker is guaranteed to lose.
    pub fn has_blocking_attempt(&self, key: &DeliveryKey) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM delivery_attempts
                 WHERE message_id = ?1 AND destination_id = ?2 AND scheduled_local = ?3",
                rusqlite::params![
                    key.message_id,
                    key.destination_id,
                    fmt_local(&key.scheduled_local)
                ],
                |r| r.get(0),
            )
            .map_err(store_err)?;
        Ok(count > 0)
    }

    /// Bump the attempt counter on an in-flight claim (one per retry).
    pub fn bump_attempt_count(&self, key: &DeliveryKey) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE delivery_attempts SET attempt_count = attempt_count + 1
             WHERE message_id = ?1 AND destination_id = ?2 AND scheduled_local = ?3
               AND status = 'sending'",
            rusqlite::params![
                key.message_id,
                key.destination_id,
                fmt_local(&key.scheduled_local)
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn get_attempt(&self, key: &DeliveryKey) -> Result<Option<DeliveryAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                 WHERE message_id = ?1 AND destination_id = ?2 AND scheduled_local = ?3"
            ))
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map(
                rusqlite::params![
                    key.message_id,
                    key.destination_id,
                    fmt_local(&key.scheduled_local)
                ],
                attempt_from_row,
            )
            .map_err(store_err)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw.map_err(store_err)?.decode()?)),
            None => Ok(None),
        }
    }

    /// All ledger rows of one message — the author's per-triple view.
    pub fn attempts_for_message(&self, message_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                 WHERE message_id = ?1 ORDER BY scheduled_local, destination_id"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map([message_id], attempt_from_row)
            .map_err(store_err)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.map_err(store_err)?.decode()?);
        }
        Ok(out)
    }

    /// Per-status tallies for the aggregate status recompute.
    pub fn attempt_tally(&self, message_id: &str) -> Result<AttemptTally> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM delivery_attempts
                 WHERE message_id = ?1 GROUP BY status",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([message_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(store_err)?;
        let mut tally = AttemptTally::default();
        for row in rows {
            let (status, count) = row.map_err(store_err)?;
            match status.as_str() {
                "sending" => tally.sending = count,
                "sent" => tally.sent = count,
                "failed" => tally.failed = count,
                _ => {}
            }
        }
        Ok(tally)
    }

    /// Claims stuck at `sending` since before the cutoff — crashed workers.
    pub fn stuck_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<DeliveryKey>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT message_id, destination_id, scheduled_local FROM delivery_attempts
                 WHERE status = 'sending' AND started_at < ?1
                 ORDER BY started_at",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([older_than.to_rfc3339()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (message_id, destination_id, local) = row.map_err(store_err)?;
            out.push(DeliveryKey {
                message_id,
                destination_id,
                scheduled_local: parse_local(&local)?,
            });
        }
        Ok(out)
    }

    /// (sent, failed) counts finalized since the cutoff — monitor feed.
    pub fn recent_outcomes(&self, since: DateTime<Utc>) -> Result<(i64, i64)> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT
                COUNT(CASE WHEN status = 'sent' THEN 1 END),
                COUNT(CASE WHEN status = 'failed' THEN 1 END)
             FROM delivery_attempts WHERE finished_at >= ?1",
            [since.to_rfc3339()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(store_err)
    }
}
