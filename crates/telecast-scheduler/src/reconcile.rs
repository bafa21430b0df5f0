//! Reconciliation sweep for claims abandoned by crashed workers.
//!
//! A worker dying between claim and finalize leaves a row at `sending`.
//! Baseline correctness holds without this sweep (finalize is the only path
//! to `sent`), but the row would otherwise block its triple forever. The
//! sweep finalizes stale claims as failed and recomputes the affected
//! aggregate statuses. It cannot mint a second `sent` row: finalize refuses
//! to touch anything that already left `sending`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use telecast_core::error::Result;
use telecast_db::Database;

use crate::status;

pub struct Reconciler {
    db: Arc<Database>,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, stale_claim_secs: i64) -> Self {
        Self {
            db,
            stale_after: Duration::seconds(stale_claim_secs),
        }
    }

    /// Finalize every claim stuck past the stale threshold. Returns how many
    /// rows were re-finalized.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.stale_after;
        let stuck = self.db.stuck_claims(cutoff)?;
        if stuck.is_empty() {
            return Ok(0);
        }

        let mut touched_messages = HashSet::new();
        let mut swept = 0;
        for key in stuck {
            // A worker may have finalized between the query and now; the
            // guarded UPDATE makes the race harmless.
            if self.db.finalize_failed(&key, "stale claim")? {
                tracing::warn!("Reconciled stale claim {key}");
                touched_messages.insert(key.message_id.clone());
                swept += 1;
            }
        }
        for message_id in touched_messages {
            if let Err(e) = status::recompute(&self.db, &message_id) {
                tracing::warn!("Status recompute after sweep failed for {message_id}: {e}");
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use telecast_core::types::{
        AttemptStatus, DeliveryKey, MessageContent, MessageStatus, ScheduledMessage,
    };

    fn key(dest: &str) -> DeliveryKey {
        DeliveryKey::new(
            "m1",
            dest,
            NaiveDate::from_ymd_opt(2026, 6, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        )
    }

    fn setup() -> Arc<Database> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut msg = ScheduledMessage::new(
            "acct-1",
            vec!["d1".into(), "d2".into()],
            MessageContent {
                text: "post".into(),
                media: vec![],
            },
            "UTC",
            vec![NaiveDate::from_ymd_opt(2026, 6, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()],
        )
        .unwrap();
        msg.id = "m1".into();
        db.save_message(&msg).unwrap();
        db
    }

    #[test]
    fn stale_claims_are_finalized_failed() {
        let db = setup();
        db.try_claim(&key("d1")).unwrap();

        let reconciler = Reconciler::new(db.clone(), 900);
        // Not yet stale.
        assert_eq!(reconciler.sweep_at(Utc::now()).unwrap(), 0);

        // Pretend 20 minutes pass with the worker dead.
        let later = Utc::now() + Duration::minutes(20);
        assert_eq!(reconciler.sweep_at(later).unwrap(), 1);

        let attempt = db.get_attempt(&key("d1")).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.error.as_deref(), Some("stale claim"));
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[test]
    fn sweep_never_downgrades_a_sent_row() {
        let db = setup();
        db.try_claim(&key("d1")).unwrap();
        db.finalize_sent(&key("d1"), "tg-1").unwrap();
        db.try_claim(&key("d2")).unwrap();

        let reconciler = Reconciler::new(db.clone(), 900);
        let later = Utc::now() + Duration::minutes(20);
        assert_eq!(reconciler.sweep_at(later).unwrap(), 1);

        // d1 keeps its sent outcome; only the stuck d2 claim was swept.
        let d1 = db.get_attempt(&key("d1")).unwrap().unwrap();
        assert_eq!(d1.status, AttemptStatus::Sent);
        assert_eq!(d1.external_ref.as_deref(), Some("tg-1"));
        let d2 = db.get_attempt(&key("d2")).unwrap().unwrap();
        assert_eq!(d2.status, AttemptStatus::Failed);

        // Second sweep finds nothing.
        assert_eq!(reconciler.sweep_at(later).unwrap(), 0);
    }
}
