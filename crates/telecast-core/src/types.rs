//! Schedule and ledger data model.
//!
//! A [`ScheduledMessage`] carries its target instants twice: once in the
//! author's local time (the canonical form — ledger keys are derived from it)
//! and once pre-computed in UTC for window arithmetic. The UTC list can go
//! stale after edits; [`ScheduledMessage::repair_utc_times`] regenerates it
//! from the local list plus the stored IANA timezone.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelecastError};

/// Aggregate message status derived from its triples' ledger outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    PartiallySent,
    Completed,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::PartiallySent => "partially_sent",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "partially_sent" => Ok(MessageStatus::PartiallySent),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "cancelled" => Ok(MessageStatus::Cancelled),
            other => Err(TelecastError::InvalidData(format!(
                "unknown message status: {other}"
            ))),
        }
    }
}

/// Media attachment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

/// One ordered media attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    /// Storage locator (URL or platform file id) — opaque to this engine.
    pub locator: String,
}

/// Message payload: text plus ordered media. Mutable up to send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl MessageContent {
    /// Validate at the store boundary: something to send, no empty locators.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() && self.media.is_empty() {
            return Err(TelecastError::InvalidData(
                "message content has neither text nor media".into(),
            ));
        }
        for item in &self.media {
            if item.locator.trim().is_empty() {
                return Err(TelecastError::InvalidData(
                    "media item has an empty locator".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A user-authored message with its destination list and target instants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    /// Owning account — authorization happens outside this engine.
    pub account_id: String,
    /// Destination ids. Unique, order-irrelevant.
    pub destinations: Vec<String>,
    pub content: MessageContent,
    /// IANA timezone the author scheduled in (e.g. "Europe/Berlin").
    pub timezone: String,
    /// Target instants in the author's local time. Canonical.
    pub local_times: Vec<NaiveDateTime>,
    /// Pre-computed UTC instants, index-aligned with `local_times`.
    /// `None` marks a stale entry awaiting repair.
    pub utc_times: Vec<Option<DateTime<Utc>>>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// Create a new pending message. UTC instants are computed up front.
    pub fn new(
        account_id: &str,
        destinations: Vec<String>,
        content: MessageContent,
        timezone: &str,
        local_times: Vec<NaiveDateTime>,
    ) -> Result<Self> {
        content.validate()?;
        let mut msg = Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            destinations,
            content,
            timezone: timezone.to_string(),
            local_times,
            utc_times: Vec::new(),
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        msg.dedup_destinations();
        msg.repair_utc_times()?;
        Ok(msg)
    }

    /// Destination lists are sets; keep first occurrence order.
    pub fn dedup_destinations(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.destinations.retain(|d| seen.insert(d.clone()));
    }

    /// True when the UTC list can no longer be trusted: diverged length or
    /// missing entries.
    pub fn needs_utc_repair(&self) -> bool {
        self.utc_times.len() != self.local_times.len()
            || self.utc_times.iter().any(|t| t.is_none())
    }

    /// Regenerate the UTC list from `local_times` plus the stored timezone.
    ///
    /// A local time that does not exist in the timezone (DST gap) stays
    /// `None`; the scanner skips such entries and logs them. Ambiguous times
    /// resolve to the earlier offset.
    pub fn repair_utc_times(&mut self) -> Result<()> {
        let tz: Tz = self.timezone.parse().map_err(|_| {
            TelecastError::InvalidData(format!("unknown timezone: {}", self.timezone))
        })?;
        self.utc_times = self
            .local_times
            .iter()
            .map(|local| {
                tz.from_local_datetime(local)
                    .earliest()
                    .map(|t| t.with_timezone(&Utc))
            })
            .collect();
        Ok(())
    }
}

/// A destination channel. Metadata is refreshed by external collaborators;
/// this engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    /// Platform handle the gateway delivers to (e.g. a Telegram chat id).
    pub channel_handle: String,
    pub title: Option<String>,
    pub member_count: Option<i64>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Natural key of one delivery obligation.
///
/// The author-local instant is the canonical component so the key stays
/// stable across UTC recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub message_id: String,
    pub destination_id: String,
    pub scheduled_local: NaiveDateTime,
}

impl DeliveryKey {
    pub fn new(message_id: &str, destination_id: &str, scheduled_local: NaiveDateTime) -> Self {
        Self {
            message_id: message_id.to_string(),
            destination_id: destination_id.to_string(),
            scheduled_local,
        }
    }
}

impl std::fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.message_id,
            self.destination_id,
            self.scheduled_local.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

/// Ledger row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Sending,
    Sent,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Sending => "sending",
            AttemptStatus::Sent => "sent",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sending" => Ok(AttemptStatus::Sending),
            "sent" => Ok(AttemptStatus::Sent),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(TelecastError::InvalidData(format!(
                "unknown attempt status: {other}"
            ))),
        }
    }
}

/// One Outcome Ledger entry. At most one row per [`DeliveryKey`], and at
/// most one row per key may ever reach [`AttemptStatus::Sent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub key: DeliveryKey,
    pub status: AttemptStatus,
    /// Platform message reference, set on success.
    pub external_ref: Option<String>,
    /// Error detail, set on failure.
    pub error: Option<String>,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Successful gateway send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Platform-assigned message reference.
    pub external_ref: String,
}

/// Whether a gateway failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Network errors, timeouts, rate limiting, server-side 5xx.
    Transient,
    /// Destination unreachable, bot blocked, payload rejected.
    Terminal,
}

/// Classified gateway failure — drives the worker's retry policy.
#[derive(Debug, Clone)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SendErrorKind::Transient
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SendErrorKind::Transient => write!(f, "transient: {}", self.message),
            SendErrorKind::Terminal => write!(f, "terminal: {}", self.message),
        }
    }
}

impl std::error::Error for SendError {}
