//! Due-Time Scanner: turns stored schedules into dispatchable work items.
//!
//! Every invocation walks all messages in id-ordered batches (edits can
//! revive a completed message, so aggregate status filters nothing except
//! cancellation), evaluates the processing window per instant, and emits one
//! work item per unhandled (message, destination, instant) triple. Stale UTC
//! instants are repaired in place from the author-local time plus the stored
//! timezone before evaluation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use telecast_core::config::ScannerConfig;
use telecast_core::error::Result;
use telecast_core::types::{DeliveryKey, MessageStatus, ScheduledMessage};
use telecast_db::Database;

use crate::guard::SingleFlight;
use crate::lanes::{lane_for, DeliveryLanes, WorkItem};

/// Lock name guarding scan runs.
const SCAN_LOCK: &str = "scanner";

/// How a scan run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Walked the whole store.
    Completed,
    /// Stopped early at the work-item cap; the next run picks up the rest.
    Capped,
    /// Another instance held the single-flight lock.
    Skipped,
}

/// Result of one scan run.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub messages_scanned: usize,
    pub items_emitted: usize,
    /// Messages whose UTC list was regenerated and persisted.
    pub repaired: usize,
    /// Instants skipped as unrepairable (bad timezone, DST gap).
    pub skipped_entries: usize,
}

impl ScanReport {
    fn empty(outcome: ScanOutcome) -> Self {
        Self {
            outcome,
            messages_scanned: 0,
            items_emitted: 0,
            repaired: 0,
            skipped_entries: 0,
        }
    }
}

/// The due-time scanner. One logical instance runs at a time (single-flight
/// guarded); invocations repeat from an external trigger and overlap is
/// tolerated, not merely avoided.
pub struct Scanner {
    db: Arc<Database>,
    lanes: Arc<DeliveryLanes>,
    guard: SingleFlight,
    cfg: ScannerConfig,
}

impl Scanner {
    pub fn new(db: Arc<Database>, lanes: Arc<DeliveryLanes>, cfg: ScannerConfig) -> Self {
        let guard = SingleFlight::new(db.clone());
        Self {
            db,
            lanes,
            guard,
            cfg,
        }
    }

    /// Run one scan against the current clock.
    pub async fn run(&self) -> Result<ScanReport> {
        self.run_at(Utc::now()).await
    }

    /// Run one scan with an explicit "now" — window arithmetic is evaluated
    /// against this instant.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let Some(lease) = self.guard.acquire(SCAN_LOCK, self.cfg.lock_ttl_secs)? else {
            tracing::debug!("Scan skipped: another instance holds the lock");
            return Ok(ScanReport::empty(ScanOutcome::Skipped));
        };

        // The lease releases on drop, so an early error still frees the lock.
        let report = self.scan_all(now).await?;
        lease.release()?;

        tracing::info!(
            "Scan {:?}: {} messages, {} items emitted, {} repaired, {} skipped",
            report.outcome,
            report.messages_scanned,
            report.items_emitted,
            report.repaired,
            report.skipped_entries
        );
        Ok(report)
    }

    async fn scan_all(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let window_start = now - Duration::minutes(self.cfg.late_tolerance_mins);
        let window_end = now + Duration::minutes(self.cfg.early_tolerance_mins);
        let mut report = ScanReport::empty(ScanOutcome::Completed);
        let mut cursor: Option<String> = None;

        // Batched walk: work already emitted survives a crash mid-run, the
        // next invocation redoes at most the current batch.
        'batches: loop {
            let batch = self
                .db
                .list_messages_after(cursor.as_deref(), self.cfg.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id.clone());

            for mut msg in batch {
                report.messages_scanned += 1;
                if msg.status == MessageStatus::Cancelled {
                    continue;
                }
                self.repair_if_needed(&mut msg, &mut report)?;

                for (idx, local) in msg.local_times.iter().enumerate() {
                    let Some(utc) = msg.utc_times.get(idx).copied().flatten() else {
                        tracing::warn!(
                            "Message {} instant {local} has no UTC mapping, skipping",
                            msg.id
                        );
                        report.skipped_entries += 1;
                        continue;
                    };
                    // Window arithmetic is per-instant, never per-message.
                    if utc < window_start || utc > window_end {
                        continue;
                    }
                    for dest in &msg.destinations {
                        let key = DeliveryKey::new(&msg.id, dest, *local);
                        if self.db.has_blocking_attempt(&key)? {
                            continue;
                        }
                        self.emit(key, utc, now, report.items_emitted).await;
                        report.items_emitted += 1;
                        if report.items_emitted >= self.cfg.max_work_items {
                            tracing::info!(
                                "Scan capped at {} work items",
                                self.cfg.max_work_items
                            );
                            report.outcome = ScanOutcome::Capped;
                            break 'batches;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Manual trigger: emit work for every unhandled triple of one message,
    /// bypassing the time window. Claims still deduplicate.
    pub async fn force_message(&self, message_id: &str) -> Result<usize> {
        let now = Utc::now();
        let Some(mut msg) = self.db.get_message(message_id)? else {
            return Err(telecast_core::error::TelecastError::NotFound(format!(
                "message {message_id}"
            )));
        };
        if msg.status == MessageStatus::Cancelled {
            return Err(telecast_core::error::TelecastError::InvalidData(format!(
                "message {message_id} is cancelled"
            )));
        }
        let mut report = ScanReport::empty(ScanOutcome::Completed);
        self.repair_if_needed(&mut msg, &mut report)?;

        let mut emitted = 0;
        for (idx, local) in msg.local_times.iter().enumerate() {
            let Some(utc) = msg.utc_times.get(idx).copied().flatten() else {
                continue;
            };
            for dest in &msg.destinations {
                let key = DeliveryKey::new(&msg.id, dest, *local);
                if self.db.has_blocking_attempt(&key)? {
                    continue;
                }
                self.emit(key, utc, now, emitted).await;
                emitted += 1;
            }
        }
        tracing::info!("Force-processed message {message_id}: {emitted} items");
        Ok(emitted)
    }

    fn repair_if_needed(&self, msg: &mut ScheduledMessage, report: &mut ScanReport) -> Result<()> {
        if !msg.needs_utc_repair() {
            return Ok(());
        }
        match msg.repair_utc_times() {
            Ok(()) => {
                self.db.update_utc_times(&msg.id, &msg.utc_times)?;
                report.repaired += 1;
            }
            Err(e) => {
                // Input error: the message keeps its stale list and its
                // instants are skipped below. Never fatal to the scan.
                tracing::warn!("Message {} UTC repair failed: {e}", msg.id);
            }
        }
        Ok(())
    }

    async fn emit(&self, key: DeliveryKey, utc: DateTime<Utc>, now: DateTime<Utc>, index: usize) {
        let stagger = Duration::milliseconds((self.cfg.stagger_ms as i64) * index as i64);
        let item = WorkItem {
            lane: lane_for(&key, self.lanes.lane_count()),
            key,
            scheduled_utc: utc,
            not_before: now + stagger,
        };
        tracing::debug!("Emit {} (lane {})", item.key, item.lane);
        self.lanes.submit(item).await;
    }
}
