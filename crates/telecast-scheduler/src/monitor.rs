//! Read-only operational snapshot: queue depth, recent outcomes, stuck
//! claims. Useful for operators, not part of correctness.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use telecast_core::error::Result;
use telecast_db::Database;

use crate::lanes::{DeliveryLanes, LaneStats};

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub lanes: Vec<LaneStats>,
    pub queued_items: usize,
    pub sent_last_hour: i64,
    pub failed_last_hour: i64,
    pub stuck_claims: usize,
    pub pending_messages: i64,
}

pub struct Monitor {
    db: Arc<Database>,
    lanes: Arc<DeliveryLanes>,
    stale_claim_secs: i64,
}

impl Monitor {
    pub fn new(db: Arc<Database>, lanes: Arc<DeliveryLanes>, stale_claim_secs: i64) -> Self {
        Self {
            db,
            lanes,
            stale_claim_secs,
        }
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        let now = Utc::now();
        let (sent, failed) = self.db.recent_outcomes(now - Duration::hours(1))?;
        let stuck = self
            .db
            .stuck_claims(now - Duration::seconds(self.stale_claim_secs))?;
        Ok(MonitorSnapshot {
            lanes: self.lanes.stats().await,
            queued_items: self.lanes.total_pending().await,
            sent_last_hour: sent,
            failed_last_hour: failed,
            stuck_claims: stuck.len(),
            pending_messages: self.db.pending_message_count()?,
        })
    }
}
