//! # Telecast Scheduler
//!
//! The scheduling-and-delivery engine: turns stored schedules into
//! dispatchable work and delivers it exactly once per triple.
//!
//! ## Architecture
//! ```text
//! Scanner (tokio interval, single-flight guarded)
//!   ├── window check per (message, destination, instant) triple
//!   ├── UTC repair from author-local time + stored timezone
//!   └── emits WorkItems → DeliveryLanes (hash-partitioned FIFO queues)
//!
//! DeliveryWorker × N (drain lanes)
//!   ├── RateGovernor.admit() — per-minute bucket, backpressure
//!   ├── Ledger.try_claim() — the at-most-once serialization point
//!   ├── Gateway.send() — classified transient/terminal, retried in-claim
//!   └── finalize + aggregate status recompute
//!
//! Reconciler (periodic) — finalizes claims abandoned by crashed workers
//! ```

pub mod engine;
pub mod governor;
pub mod guard;
pub mod lanes;
pub mod monitor;
pub mod reconcile;
pub mod scanner;
pub mod status;
pub mod worker;

pub use engine::Engine;
pub use governor::RateGovernor;
pub use guard::{LockLease, SingleFlight};
pub use lanes::{lane_for, DeliveryLanes, LaneStats, WorkItem};
pub use monitor::{Monitor, MonitorSnapshot};
pub use reconcile::Reconciler;
pub use scanner::{ScanOutcome, ScanReport, Scanner};
pub use worker::{DeliveryWorker, ItemOutcome};
