//! Hash-partitioned queue lanes between the scanner and the workers.
//!
//! Lane assignment is a pure function of the delivery key — reproducible
//! across restarts, no process-local rotation state. Per-lane concurrency
//! caps bound effective throughput independently of the rate governor.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use telecast_core::types::DeliveryKey;

/// One dispatchable delivery obligation, as emitted by the scanner.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: DeliveryKey,
    /// UTC instant the triple is due at, post-repair.
    pub scheduled_utc: DateTime<Utc>,
    /// Lane this item is partitioned into.
    pub lane: usize,
    /// Emission stagger: workers hold the item until this instant.
    pub not_before: DateTime<Utc>,
}

/// Stateless lane assignment: `hash(key) % lane_count`.
pub fn lane_for(key: &DeliveryKey, lane_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lane_count.max(1) as u64) as usize
}

/// Per-lane state.
struct LaneState {
    queue: VecDeque<WorkItem>,
    active: usize,
    max_concurrent: usize,
    total_processed: u64,
}

impl LaneState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active: 0,
            max_concurrent,
            total_processed: 0,
        }
    }

    fn dequeue(&mut self, now: DateTime<Utc>) -> Option<WorkItem> {
        if self.active >= self.max_concurrent {
            return None;
        }
        // FIFO per lane; the front item gates the lane until its stagger
        // instant passes.
        if self.queue.front()?.not_before > now {
            return None;
        }
        let item = self.queue.pop_front()?;
        self.active += 1;
        Some(item)
    }

    fn complete(&mut self) {
        self.active = self.active.saturating_sub(1);
        self.total_processed += 1;
    }
}

/// The partitioned work queue shared by scanner and workers.
pub struct DeliveryLanes {
    lanes: Vec<Arc<Mutex<LaneState>>>,
    /// Rotating scan offset so concurrent workers don't all hammer lane 0.
    next_start: AtomicUsize,
}

impl DeliveryLanes {
    pub fn new(lane_count: usize, per_lane_concurrency: usize) -> Self {
        let lane_count = lane_count.max(1);
        Self {
            lanes: (0..lane_count)
                .map(|_| Arc::new(Mutex::new(LaneState::new(per_lane_concurrency.max(1)))))
                .collect(),
            next_start: AtomicUsize::new(0),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Queue an item on its assigned lane.
    pub async fn submit(&self, item: WorkItem) {
        let idx = item.lane % self.lanes.len();
        let mut lane = self.lanes[idx].lock().await;
        tracing::debug!(
            "Lane[{idx}] enqueue {} (queue: {}, active: {})",
            item.key,
            lane.queue.len(),
            lane.active
        );
        lane.queue.push_back(item);
    }

    /// Pop the next due item, scanning lanes fairly from a rotating start.
    /// Returns None when every lane is empty, gated, or at capacity.
    pub async fn next(&self) -> Option<WorkItem> {
        let now = Utc::now();
        let start = self.next_start.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.lanes.len() {
            let idx = (start + offset) % self.lanes.len();
            let mut lane = self.lanes[idx].lock().await;
            if let Some(item) = lane.dequeue(now) {
                return Some(item);
            }
        }
        None
    }

    /// Free a concurrency slot after an item finishes.
    pub async fn complete(&self, lane: usize) {
        let mut state = self.lanes[lane % self.lanes.len()].lock().await;
        state.complete();
    }

    pub async fn stats(&self) -> Vec<LaneStats> {
        let mut result = Vec::with_capacity(self.lanes.len());
        for (idx, lane) in self.lanes.iter().enumerate() {
            let state = lane.lock().await;
            result.push(LaneStats {
                lane: idx,
                queued: state.queue.len(),
                active: state.active,
                max_concurrent: state.max_concurrent,
                total_processed: state.total_processed,
            });
        }
        result
    }

    /// Queued plus in-flight items across all lanes.
    pub async fn total_pending(&self) -> usize {
        let mut total = 0;
        for lane in &self.lanes {
            let state = lane.lock().await;
            total += state.queue.len() + state.active;
        }
        total
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: usize,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub total_processed: u64,
}
