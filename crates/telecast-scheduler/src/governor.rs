//! Rate Governor — tumbling per-minute bucket throughput control.
//!
//! Protects the external messaging API's own rate limits. Over-ceiling
//! callers get a randomized short wait, never an error: backpressure, not
//! rejection. The handle is `Clone` over shared state so every worker —
//! and every engine instance wired to the same governor — sees one count;
//! there is deliberately no process-local static anywhere in this path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

/// Cloneable governor handle. All clones share one bucket.
#[derive(Clone)]
pub struct RateGovernor {
    inner: Arc<Mutex<Bucket>>,
    ceiling: u32,
}

struct Bucket {
    /// Minute epoch (unix seconds / 60) the current count belongs to.
    minute: i64,
    count: u32,
}

/// Bounds of the randomized backpressure wait.
const WAIT_MIN_MS: u64 = 1_000;
const WAIT_MAX_MS: u64 = 5_000;

impl RateGovernor {
    pub fn new(ceiling_per_min: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bucket { minute: 0, count: 0 })),
            ceiling: ceiling_per_min,
        }
    }

    /// Ask to perform one external send now.
    ///
    /// Zero means admitted (and counted). Nonzero is the suggested wait
    /// before asking again; the call was not counted.
    pub fn admit(&self) -> Duration {
        self.admit_at(chrono::Utc::now().timestamp())
    }

    fn admit_at(&self, unix_secs: i64) -> Duration {
        let minute = unix_secs / 60;
        let mut bucket = self.inner.lock().expect("governor lock poisoned");
        if bucket.minute != minute {
            bucket.minute = minute;
            bucket.count = 0;
        }
        if bucket.count < self.ceiling {
            bucket.count += 1;
            return Duration::ZERO;
        }
        drop(bucket);
        let wait_ms = rand::thread_rng().gen_range(WAIT_MIN_MS..=WAIT_MAX_MS);
        tracing::debug!("Rate ceiling reached, backing off {wait_ms}ms");
        Duration::from_millis(wait_ms)
    }

    /// Sends admitted in the current minute.
    pub fn current_count(&self) -> u32 {
        self.inner.lock().expect("governor lock poisoned").count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_ceiling() {
        let governor = RateGovernor::new(3);
        for _ in 0..3 {
            assert_eq!(governor.admit_at(600), Duration::ZERO);
        }
        let wait = governor.admit_at(600);
        assert!(wait >= Duration::from_millis(WAIT_MIN_MS));
        assert!(wait <= Duration::from_millis(WAIT_MAX_MS));
        // The rejected call was not counted.
        assert_eq!(governor.current_count(), 3);
    }

    #[test]
    fn bucket_resets_each_minute() {
        let governor = RateGovernor::new(1);
        assert_eq!(governor.admit_at(600), Duration::ZERO);
        assert!(!governor.admit_at(601).is_zero());
        // Next minute: fresh bucket.
        assert_eq!(governor.admit_at(660), Duration::ZERO);
    }

    #[test]
    fn clones_share_the_bucket() {
        let governor = RateGovernor::new(2);
        let other = governor.clone();
        assert_eq!(governor.admit_at(600), Duration::ZERO);
        assert_eq!(other.admit_at(600), Duration::ZERO);
        assert!(!governor.admit_at(600).is_zero());
        assert!(!other.admit_at(600).is_zero());
    }
}
