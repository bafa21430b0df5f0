//! Delivery Worker: consumes work items and performs the actual sends.
//!
//! The claim is taken before anything else touches the network; from that
//! point on, every code path must finalize the ledger row — transient
//! failures retry inside the claim, terminal ones finalize immediately, and
//! exhausted retries finalize as failed. Only an infrastructure crash leaves
//! a row at `sending`, which the reconciliation sweep picks up.

use std::sync::Arc;
use std::time::Duration;

use telecast_core::config::DeliveryConfig;
use telecast_core::error::Result;
use telecast_core::traits::MessagingGateway;
use telecast_core::types::{MessageStatus, SendError};
use telecast_db::Database;

use crate::governor::RateGovernor;
use crate::lanes::{DeliveryLanes, WorkItem};
use crate::status;

/// Sleep between polls when every lane is drained.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// What processing one work item amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Delivered and logged as sent.
    Sent,
    /// Finalized as failed (terminal error, exhausted retries, or missing
    /// collaborator data).
    Failed,
    /// Another worker owns the triple — nothing to do.
    AlreadyClaimed,
    /// The message was cancelled between scheduling and firing.
    Superseded,
}

/// Delay before retry `retry_index`, taken from the configured schedule.
pub(crate) fn backoff_delay(schedule: &[u64], retry_index: usize) -> Duration {
    let secs = schedule
        .get(retry_index)
        .copied()
        .or_else(|| schedule.last().copied())
        .unwrap_or(0);
    Duration::from_secs(secs)
}

/// A delivery worker. Many run concurrently; any worker may pick up any
/// item, and ordering is only guaranteed within one triple (the claim
/// serializes re-entry).
pub struct DeliveryWorker {
    db: Arc<Database>,
    lanes: Arc<DeliveryLanes>,
    governor: RateGovernor,
    gateway: Arc<dyn MessagingGateway>,
    cfg: DeliveryConfig,
}

impl DeliveryWorker {
    pub fn new(
        db: Arc<Database>,
        lanes: Arc<DeliveryLanes>,
        governor: RateGovernor,
        gateway: Arc<dyn MessagingGateway>,
        cfg: DeliveryConfig,
    ) -> Self {
        Self {
            db,
            lanes,
            governor,
            gateway,
            cfg,
        }
    }

    /// Spawn the worker loop as a background tokio task.
    pub fn spawn(self: &Arc<Self>, worker_id: usize) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run(worker_id).await })
    }

    async fn run(&self, worker_id: usize) {
        tracing::info!("Delivery worker {worker_id} started");
        loop {
            match self.lanes.next().await {
                Some(item) => {
                    let lane = item.lane;
                    match self.process_item(&item).await {
                        Ok(outcome) => {
                            tracing::debug!("Worker {worker_id}: {} -> {:?}", item.key, outcome)
                        }
                        Err(e) => {
                            // Infrastructure error: abort this item, the
                            // reconciliation sweep recovers any claim left
                            // behind.
                            tracing::error!("Worker {worker_id}: {} aborted: {e}", item.key);
                        }
                    }
                    self.lanes.complete(lane).await;
                }
                None => tokio::time::sleep(IDLE_POLL).await,
            }
        }
    }

    /// Block until the governor admits one external send.
    async fn admit(&self) {
        loop {
            let wait = self.governor.admit();
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Process one work item end to end.
    pub async fn process_item(&self, item: &WorkItem) -> Result<ItemOutcome> {
        // (a) Rate governor: backpressure, not rejection.
        self.admit().await;

        // (b) Claim the triple. Losing the race is the expected path for
        // duplicate emissions and overlapping scans — exit silently.
        if !self.db.try_claim(&item.key)? {
            tracing::debug!("{} already claimed", item.key);
            return Ok(ItemOutcome::AlreadyClaimed);
        }

        // (c) Re-read current state: author edits between scheduling and
        // firing are honored, cancellation is observed opportunistically.
        let Some(msg) = self.db.get_message(&item.key.message_id)? else {
            self.db
                .finalize_failed(&item.key, "message deleted before delivery")?;
            return Ok(ItemOutcome::Failed);
        };
        // Only cancellation supersedes: the scanner emits only unhandled
        // triples, so an item for a failed or revived-completed message is
        // still real work.
        if msg.status == MessageStatus::Cancelled {
            self.db.finalize_failed(&item.key, "superseded")?;
            status::recompute(&self.db, &item.key.message_id)?;
            return Ok(ItemOutcome::Superseded);
        }
        let Some(dest) = self.db.get_destination(&item.key.destination_id)? else {
            self.db
                .finalize_failed(&item.key, "destination not found")?;
            status::recompute(&self.db, &item.key.message_id)?;
            return Ok(ItemOutcome::Failed);
        };

        // (d)/(e) Send, retrying transient failures inside the claim.
        let timeout = Duration::from_secs(self.cfg.gateway_timeout_secs);
        let mut retries = 0usize;
        let outcome = loop {
            let result = tokio::time::timeout(
                timeout,
                self.gateway.send(&dest.channel_handle, &msg.content),
            )
            .await;

            let err = match result {
                Ok(Ok(receipt)) => {
                    self.db.finalize_sent(&item.key, &receipt.external_ref)?;
                    tracing::info!(
                        "Delivered {} via {} (ref {})",
                        item.key,
                        self.gateway.name(),
                        receipt.external_ref
                    );
                    break ItemOutcome::Sent;
                }
                Ok(Err(e)) => e,
                Err(_) => SendError::transient(format!(
                    "gateway timeout after {}s",
                    self.cfg.gateway_timeout_secs
                )),
            };

            if err.is_transient() && retries < self.cfg.retry_backoff_secs.len() {
                let delay = backoff_delay(&self.cfg.retry_backoff_secs, retries);
                tracing::warn!(
                    "Transient failure on {} (attempt {}): {} — retry in {:?}",
                    item.key,
                    retries + 1,
                    err,
                    delay
                );
                self.db.bump_attempt_count(&item.key)?;
                tokio::time::sleep(delay).await;
                // Every send passes the governor, retries included.
                self.admit().await;
                retries += 1;
                continue;
            }

            // Terminal, or retries exhausted: never leave the row `sending`.
            tracing::warn!("Delivery failed for {}: {err}", item.key);
            self.db.finalize_failed(&item.key, &err.to_string())?;
            break ItemOutcome::Failed;
        };

        // (f) Aggregate status follows the ledger.
        status::recompute(&self.db, &item.key.message_id)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use telecast_core::types::{
        AttemptStatus, DeliveryKey, Destination, MessageContent, MessageStatus, ScheduledMessage,
        SendReceipt,
    };

    /// Gateway double: scripted outcomes, recorded calls.
    struct MockGateway {
        script: Mutex<VecDeque<std::result::Result<SendReceipt, SendError>>>,
        sent_texts: Mutex<Vec<String>>,
    }

    impl MockGateway {
        fn scripted(
            outcomes: Vec<std::result::Result<SendReceipt, SendError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.into()),
                sent_texts: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.sent_texts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessagingGateway for MockGateway {
        fn name(&self) -> &str {
            "mock"
        }

        async fn send(
            &self,
            _handle: &str,
            content: &MessageContent,
        ) -> std::result::Result<SendReceipt, SendError> {
            self.sent_texts.lock().unwrap().push(content.text.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(SendReceipt {
                        external_ref: "tg-default".into(),
                    })
                })
        }
    }

    fn receipt(r: &str) -> std::result::Result<SendReceipt, SendError> {
        Ok(SendReceipt {
            external_ref: r.into(),
        })
    }

    fn instant() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn setup_store(destinations: &[&str]) -> Arc<Database> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut msg = ScheduledMessage::new(
            "acct-1",
            destinations.iter().map(|d| d.to_string()).collect(),
            MessageContent {
                text: "launch day".into(),
                media: vec![],
            },
            "UTC",
            vec![instant()],
        )
        .unwrap();
        msg.id = "m1".into();
        db.save_message(&msg).unwrap();
        for dest in destinations {
            db.upsert_destination(&Destination {
                id: dest.to_string(),
                channel_handle: format!("-100{dest}"),
                title: None,
                member_count: None,
                refreshed_at: None,
            })
            .unwrap();
        }
        db
    }

    fn test_cfg() -> DeliveryConfig {
        DeliveryConfig {
            retry_backoff_secs: vec![0, 0, 0],
            gateway_timeout_secs: 5,
            rate_limit_per_min: 10_000,
            ..DeliveryConfig::default()
        }
    }

    fn worker_with(db: Arc<Database>, gateway: Arc<MockGateway>) -> DeliveryWorker {
        let cfg = test_cfg();
        DeliveryWorker::new(
            db,
            Arc::new(DeliveryLanes::new(cfg.lane_count, cfg.per_lane_concurrency)),
            RateGovernor::new(cfg.rate_limit_per_min),
            gateway,
            cfg,
        )
    }

    fn item(dest: &str) -> WorkItem {
        WorkItem {
            key: DeliveryKey::new("m1", dest, instant()),
            scheduled_utc: Utc::now(),
            lane: 0,
            not_before: Utc::now(),
        }
    }

    #[tokio::test]
    async fn successful_delivery_is_logged_and_completes_the_message() {
        let db = setup_store(&["d1"]);
        let gateway = MockGateway::scripted(vec![receipt("tg-77")]);
        let worker = worker_with(db.clone(), gateway.clone());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Sent);

        let attempt = db.get_attempt(&item("d1").key).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Sent);
        assert_eq!(attempt.external_ref.as_deref(), Some("tg-77"));
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Completed
        );
    }

    #[tokio::test]
    async fn claim_conflict_exits_without_touching_the_gateway() {
        let db = setup_store(&["d1"]);
        let gateway = MockGateway::scripted(vec![]);
        let worker = worker_with(db.clone(), gateway.clone());

        // Another worker already owns the triple.
        assert!(db.try_claim(&item("d1").key).unwrap());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::AlreadyClaimed);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_message_is_superseded() {
        let db = setup_store(&["d1"]);
        db.cancel_message("m1").unwrap();
        let gateway = MockGateway::scripted(vec![]);
        let worker = worker_with(db.clone(), gateway.clone());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Superseded);
        assert_eq!(gateway.call_count(), 0);

        let attempt = db.get_attempt(&item("d1").key).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.error.as_deref(), Some("superseded"));
    }

    #[tokio::test]
    async fn failed_status_does_not_block_remaining_triples() {
        let db = setup_store(&["d1"]);
        // An earlier instant failed terminally and the recompute marked the
        // whole message failed. Failure is per recompute, not sticky: a
        // later due triple still delivers and lifts the message back out.
        db.set_message_status("m1", MessageStatus::Failed).unwrap();
        let gateway = MockGateway::scripted(vec![receipt("tg-5")]);
        let worker = worker_with(db.clone(), gateway.clone());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Sent);
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Completed
        );
    }

    #[tokio::test]
    async fn missing_destination_fails_terminally() {
        let db = setup_store(&["d1"]);
        let gateway = MockGateway::scripted(vec![]);
        let worker = worker_with(db.clone(), gateway.clone());

        let mut unknown = item("d1");
        unknown.key.destination_id = "ghost".into();
        // The message lists d1 only, but a stale item may still reference a
        // destination that was since removed.
        let outcome = worker.process_item(&unknown).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Failed);
        assert_eq!(gateway.call_count(), 0);
        let attempt = db.get_attempt(&unknown.key).unwrap().unwrap();
        assert_eq!(attempt.error.as_deref(), Some("destination not found"));
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let db = setup_store(&["d1"]);
        let gateway =
            MockGateway::scripted(vec![Err(SendError::terminal("Forbidden: bot was blocked"))]);
        let worker = worker_with(db.clone(), gateway.clone());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Failed);
        assert_eq!(gateway.call_count(), 1);

        let attempt = db.get_attempt(&item("d1").key).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.attempt_count, 1);
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let db = setup_store(&["d1"]);
        let gateway = MockGateway::scripted(vec![
            Err(SendError::transient("connection reset")),
            Err(SendError::transient("Too Many Requests")),
            receipt("tg-9"),
        ]);
        let worker = worker_with(db.clone(), gateway.clone());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Sent);
        assert_eq!(gateway.call_count(), 3);

        let attempt = db.get_attempt(&item("d1").key).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Sent);
        assert_eq!(attempt.attempt_count, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_finalize_as_failed() {
        let db = setup_store(&["d1"]);
        // Schedule allows 3 retries → 4 calls total, all transient.
        let gateway = MockGateway::scripted(vec![
            Err(SendError::transient("timeout")),
            Err(SendError::transient("timeout")),
            Err(SendError::transient("timeout")),
            Err(SendError::transient("timeout")),
        ]);
        let worker = worker_with(db.clone(), gateway.clone());

        let outcome = worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Failed);
        assert_eq!(gateway.call_count(), 4);

        // The row must not be left at `sending`.
        let attempt = db.get_attempt(&item("d1").key).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.attempt_count, 4);
    }

    #[tokio::test]
    async fn current_content_is_read_at_fire_time() {
        let db = setup_store(&["d1"]);
        let gateway = MockGateway::scripted(vec![receipt("tg-1")]);
        let worker = worker_with(db.clone(), gateway.clone());

        // Author edits the text after the item was scheduled.
        let mut msg = db.get_message("m1").unwrap().unwrap();
        msg.content.text = "launch day (updated)".into();
        db.save_message(&msg).unwrap();

        worker.process_item(&item("d1")).await.unwrap();
        assert_eq!(
            gateway.sent_texts.lock().unwrap().as_slice(),
            &["launch day (updated)".to_string()]
        );
    }

    #[test]
    fn backoff_schedule_is_non_decreasing_and_bounded() {
        let schedule = vec![30, 120, 300];
        let mut last = Duration::ZERO;
        for retry in 0..schedule.len() {
            let delay = backoff_delay(&schedule, retry);
            assert!(delay >= last);
            last = delay;
        }
        // Past the schedule, the last delay holds — never unbounded growth.
        assert_eq!(backoff_delay(&schedule, 10), Duration::from_secs(300));
        assert_eq!(backoff_delay(&[], 0), Duration::ZERO);
    }
}
