//! Aggregate Status Updater: derives a message's overall state from its
//! ledger rows. Idempotent, side-effect-free beyond the single status write,
//! never mutates ledger rows.

use telecast_core::error::Result;
use telecast_core::types::{MessageStatus, ScheduledMessage};
use telecast_db::Database;

/// Total delivery obligations of a message.
pub fn expected_triples(msg: &ScheduledMessage) -> usize {
    msg.destinations.len() * msg.local_times.len()
}

/// Recompute and persist the aggregate status of one message. Returns the
/// status that is now stored. Cancelled messages are left untouched.
pub fn recompute(db: &Database, message_id: &str) -> Result<MessageStatus> {
    let Some(msg) = db.get_message(message_id)? else {
        return Err(telecast_core::error::TelecastError::NotFound(format!(
            "message {message_id}"
        )));
    };
    if msg.status == MessageStatus::Cancelled {
        return Ok(MessageStatus::Cancelled);
    }

    let expected = expected_triples(&msg) as i64;
    let tally = db.attempt_tally(message_id)?;

    let new_status = if expected > 0 && tally.sent >= expected {
        MessageStatus::Completed
    } else if tally.sent > 0 {
        MessageStatus::PartiallySent
    } else if tally.failed > 0 {
        // Failure is evaluated per recompute, not sticky: remaining future
        // triples can still move the message toward partially_sent/completed.
        MessageStatus::Failed
    } else {
        MessageStatus::Pending
    };

    if new_status != msg.status {
        db.set_message_status(message_id, new_status)?;
        tracing::debug!(
            "Message {message_id} status {} -> {}",
            msg.status.as_str(),
            new_status.as_str()
        );
    }
    Ok(new_status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use telecast_core::types::{DeliveryKey, MessageContent};

    fn setup() -> (Arc<Database>, ScheduledMessage) {
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
        (db, msg)
    }

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

    #[test]
    fn progresses_monotonically_to_completed() {
        let (db, _msg) = setup();
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Pending);

        db.try_claim(&key("d1")).unwrap();
        // An in-flight claim alone is not progress.
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Pending);

        db.finalize_sent(&key("d1"), "tg-1").unwrap();
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::PartiallySent);

        db.try_claim(&key("d2")).unwrap();
        db.finalize_sent(&key("d2"), "tg-2").unwrap();
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Completed);

        // Idempotent: recomputing again changes nothing.
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Completed);
    }

    #[test]
    fn failed_only_when_nothing_sent() {
        let (db, _msg) = setup();
        db.try_claim(&key("d1")).unwrap();
        db.finalize_failed(&key("d1"), "blocked").unwrap();
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Failed);

        // One success lifts the message out of failed.
        db.try_claim(&key("d2")).unwrap();
        db.finalize_sent(&key("d2"), "tg-1").unwrap();
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::PartiallySent);
    }

    #[test]
    fn cancelled_is_never_overwritten() {
        let (db, _msg) = setup();
        db.try_claim(&key("d1")).unwrap();
        db.finalize_sent(&key("d1"), "tg-1").unwrap();
        db.cancel_message("m1").unwrap();

        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Cancelled);
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Cancelled
        );
    }

    #[test]
    fn new_instants_reopen_a_completed_message() {
        let (db, mut msg) = setup();
        for dest in ["d1", "d2"] {
            db.try_claim(&key(dest)).unwrap();
            db.finalize_sent(&key(dest), "tg").unwrap();
        }
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::Completed);

        // An edit adds a second instant: expected triples double.
        msg.local_times.push(
            NaiveDate::from_ymd_opt(2026, 6, 2)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        );
        msg.repair_utc_times().unwrap();
        db.save_message(&msg).unwrap();
        assert_eq!(recompute(&db, "m1").unwrap(), MessageStatus::PartiallySent);
    }
}
