//! Schedule Store: scheduled messages and destination channels.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use telecast_core::error::{Result, TelecastError};
use telecast_core::types::{Destination, MessageContent, MessageStatus, ScheduledMessage};

use crate::Database;

pub(crate) fn fmt_local(t: &NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub(crate) fn parse_local(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| TelecastError::Store(format!("Bad local time '{s}': {e}")))
}

pub(crate) fn parse_utc(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TelecastError::Store(format!("Bad timestamp '{s}': {e}")))
}

fn store_err(e: rusqlite::Error) -> TelecastError {
    TelecastError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> TelecastError {
    TelecastError::Store(format!("JSON column: {e}"))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        destinations: row.get(2)?,
        text: row.get(3)?,
        media: row.get(4)?,
        timezone: row.get(5)?,
        local_times: row.get(6)?,
        utc_times: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Column images before JSON decoding.
struct RawMessage {
    id: String,
    account_id: String,
    destinations: String,
    text: String,
    media: String,
    timezone: String,
    local_times: String,
    utc_times: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl RawMessage {
    fn decode(self) -> Result<ScheduledMessage> {
        Ok(ScheduledMessage {
            id: self.id,
            account_id: self.account_id,
            destinations: serde_json::from_str(&self.destinations).map_err(json_err)?,
            content: MessageContent {
                text: self.text,
                media: serde_json::from_str(&self.media).map_err(json_err)?,
            },
            timezone: self.timezone,
            local_times: serde_json::from_str(&self.local_times).map_err(json_err)?,
            utc_times: serde_json::from_str(&self.utc_times).map_err(json_err)?,
            status: MessageStatus::parse(&self.status)?,
            created_at: parse_utc(&self.created_at)?,
            updated_at: parse_utc(&self.updated_at)?,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, account_id, destinations, text, media, timezone, \
     local_times, utc_times, status, created_at, updated_at";

impl Database {
    /// Insert or overwrite a scheduled message. Content is validated at this
    /// boundary; edits (content, destinations, instants) come through here
    /// too and may revive a completed message.
    pub fn save_message(&self, msg: &ScheduledMessage) -> Result<()> {
        msg.content.validate()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO messages
             (id, account_id, destinations, text, media, timezone,
              local_times, utc_times, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                msg.id,
                msg.account_id,
                serde_json::to_string(&msg.destinations).map_err(json_err)?,
                msg.content.text,
                serde_json::to_string(&msg.content.media).map_err(json_err)?,
                msg.timezone,
                serde_json::to_string(&msg.local_times).map_err(json_err)?,
                serde_json::to_string(&msg.utc_times).map_err(json_err)?,
                msg.status.as_str(),
                msg.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
            ))
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([id], message_from_row)
            .map_err(store_err)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw.map_err(store_err)?.decode()?)),
            None => Ok(None),
        }
    }

    /// Batched, id-ordered walk over all messages. Pass the last id of the
    /// previous batch to resume; an empty result ends the scan.
    pub fn list_messages_after(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE id > ?1 ORDER BY id LIMIT ?2"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![after_id.unwrap_or(""), limit as i64],
                message_from_row,
            )
            .map_err(store_err)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.map_err(store_err)?.decode()?);
        }
        Ok(out)
    }

    pub fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Persist a repaired UTC list without touching anything else.
    pub fn update_utc_times(&self, id: &str, utc_times: &[Option<DateTime<Utc>>]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET utc_times = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![
                serde_json::to_string(utc_times).map_err(json_err)?,
                Utc::now().to_rfc3339(),
                id
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Mark a message cancelled. The scanner stops emitting for it; workers
    /// already holding a claim observe the status at step (c) and finalize
    /// the claim as superseded.
    pub fn cancel_message(&self, id: &str) -> Result<()> {
        self.set_message_status(id, MessageStatus::Cancelled)
    }

    /// Delete a message together with its ledger rows. Refuses while any
    /// claim is still in flight.
    pub fn delete_message(&self, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        let in_flight: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM delivery_attempts
                 WHERE message_id = ?1 AND status = 'sending'",
                [id],
                |r| r.get(0),
            )
            .map_err(store_err)?;
        if in_flight > 0 {
            return Err(TelecastError::Store(format!(
                "message {id} has {in_flight} delivery attempts in flight"
            )));
        }
        tx.execute("DELETE FROM delivery_attempts WHERE message_id = ?1", [id])
            .map_err(store_err)?;
        tx.execute("DELETE FROM messages WHERE id = ?1", [id])
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn pending_message_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status IN ('pending', 'partially_sent')",
            [],
            |r| r.get(0),
        )
        .map_err(store_err)
    }

    pub fn upsert_destination(&self, dest: &Destination) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO destinations
             (id, channel_handle, title, member_count, refreshed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                dest.id,
                dest.channel_handle,
                dest.title,
                dest.member_count,
                dest.refreshed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn get_destination(&self, id: &str) -> Result<Option<Destination>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, channel_handle, title, member_count, refreshed_at
                 FROM destinations WHERE id = ?1",
            )
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(store_err)?;
        match rows.next() {
            Some(raw) => {
                let (id, channel_handle, title, member_count, refreshed_at) =
                    raw.map_err(store_err)?;
                Ok(Some(Destination {
                    id,
                    channel_handle,
                    title,
                    member_count,
                    refreshed_at: refreshed_at.as_deref().map(parse_utc).transpose()?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telecast_core::types::{MediaItem, MediaKind};

    fn sample_message(id_hint: &str) -> ScheduledMessage {
        let mut msg = ScheduledMessage::new(
            "acct-1",
            vec!["dest-a".into(), "dest-b".into()],
            MessageContent {
                text: "release notes".into(),
                media: vec![MediaItem {
                    kind: MediaKind::Photo,
                    locator: "photo-1".into(),
                }],
            },
            "UTC",
            vec![chrono::NaiveDate::from_ymd_opt(2026, 6, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()],
        )
        .unwrap();
        msg.id = id_hint.to_string();
        msg
    }

    #[test]
    fn message_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let msg = sample_message("m1");
        db.save_message(&msg).unwrap();

        let loaded = db.get_message("m1").unwrap().unwrap();
        assert_eq!(loaded.account_id, "acct-1");
        assert_eq!(loaded.destinations, msg.destinations);
        assert_eq!(loaded.content, msg.content);
        assert_eq!(loaded.local_times, msg.local_times);
        assert_eq!(loaded.utc_times, msg.utc_times);
        assert_eq!(loaded.status, MessageStatus::Pending);
    }

    #[test]
    fn list_is_cursor_resumable() {
        let db = Database::open_in_memory().unwrap();
        for id in ["m1", "m2", "m3"] {
            db.save_message(&sample_message(id)).unwrap();
        }

        let first = db.list_messages_after(None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = db
            .list_messages_after(Some(&first.last().unwrap().id), 2)
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "m3");
        assert!(db.list_messages_after(Some("m3"), 2).unwrap().is_empty());
    }

    #[test]
    fn status_and_cancel() {
        let db = Database::open_in_memory().unwrap();
        db.save_message(&sample_message("m1")).unwrap();
        db.set_message_status("m1", MessageStatus::PartiallySent)
            .unwrap();
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::PartiallySent
        );
        db.cancel_message("m1").unwrap();
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Cancelled
        );
    }

    #[test]
    fn invalid_content_rejected_at_boundary() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = sample_message("m1");
        msg.content.text = String::new();
        msg.content.media.clear();
        assert!(db.save_message(&msg).is_err());
    }

    #[test]
    fn destination_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let dest = Destination {
            id: "dest-a".into(),
            channel_handle: "-1001234".into(),
            title: Some("Announcements".into()),
            member_count: Some(412),
            refreshed_at: Some(Utc::now()),
        };
        db.upsert_destination(&dest).unwrap();
        let loaded = db.get_destination("dest-a").unwrap().unwrap();
        assert_eq!(loaded.channel_handle, "-1001234");
        assert_eq!(loaded.member_count, Some(412));
        assert!(db.get_destination("nope").unwrap().is_none());
    }
}
