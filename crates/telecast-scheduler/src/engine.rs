//! Engine wiring: the scan interval loop, the worker pool, and the periodic
//! reconciliation sweep, all sharing one lane set and one rate governor.

use std::sync::Arc;

use telecast_core::config::TelecastConfig;
use telecast_core::traits::MessagingGateway;
use telecast_db::Database;

use crate::governor::RateGovernor;
use crate::lanes::DeliveryLanes;
use crate::monitor::Monitor;
use crate::reconcile::Reconciler;
use crate::scanner::Scanner;
use crate::worker::DeliveryWorker;

/// Reconciliation runs once per this many scan ticks.
const RECONCILE_EVERY: u64 = 10;

/// The assembled scheduling-and-delivery engine.
pub struct Engine {
    db: Arc<Database>,
    config: TelecastConfig,
    gateway: Arc<dyn MessagingGateway>,
    lanes: Arc<DeliveryLanes>,
    governor: RateGovernor,
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        config: TelecastConfig,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        let lanes = Arc::new(DeliveryLanes::new(
            config.delivery.lane_count,
            config.delivery.per_lane_concurrency,
        ));
        let governor = RateGovernor::new(config.delivery.rate_limit_per_min);
        Self {
            db,
            config,
            gateway,
            lanes,
            governor,
        }
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(
            self.db.clone(),
            self.lanes.clone(),
            self.config.scanner.clone(),
        )
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.db.clone(),
            self.lanes.clone(),
            self.config.delivery.stale_claim_secs,
        )
    }

    fn worker(&self) -> Arc<DeliveryWorker> {
        Arc::new(DeliveryWorker::new(
            self.db.clone(),
            self.lanes.clone(),
            self.governor.clone(),
            self.gateway.clone(),
            self.config.delivery.clone(),
        ))
    }

    /// Process queued items until the lanes are empty — one-shot mode for
    /// the CLI's scan/send commands. Staggered items are waited out.
    pub async fn drain(&self) -> usize {
        let worker = self.worker();
        let mut processed = 0;
        loop {
            match self.lanes.next().await {
                Some(item) => {
                    let lane = item.lane;
                    if let Err(e) = worker.process_item(&item).await {
                        tracing::error!("{} aborted: {e}", item.key);
                    }
                    self.lanes.complete(lane).await;
                    processed += 1;
                }
                None => {
                    if self.lanes.total_pending().await == 0 {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        processed
    }

    /// Run forever: spawn the worker pool, then drive scan ticks and the
    /// periodic reconciliation sweep. An individual cycle failing (store or
    /// lock unavailable) is logged and the next tick retries.
    pub async fn run(&self) {
        let worker = self.worker();
        for id in 0..self.config.delivery.worker_count {
            worker.spawn(id);
        }

        let scanner = self.scanner();
        let reconciler = Reconciler::new(self.db.clone(), self.config.delivery.stale_claim_secs);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.scanner.interval_secs,
        ));
        tracing::info!(
            "Engine started: {} workers, {} lanes, scan every {}s",
            self.config.delivery.worker_count,
            self.config.delivery.lane_count,
            self.config.scanner.interval_secs
        );

        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            if let Err(e) = scanner.run().await {
                tracing::error!("Scan cycle aborted: {e}");
            }
            tick += 1;
            if tick % RECONCILE_EVERY == 0 {
                match reconciler.sweep() {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Reconciled {n} stale claims"),
                    Err(e) => tracing::error!("Reconciliation sweep failed: {e}"),
                }
            }
        }
    }
}
