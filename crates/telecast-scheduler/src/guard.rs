//! Single-flight guard over the advisory-lock table.
//!
//! Keeps concurrent scanner invocations from doing duplicate work. Not a
//! correctness mechanism: a scan that outlives its TTL admits a rare second
//! scan, and the ledger claim deduplicates whatever both emit.

use std::sync::Arc;

use telecast_core::error::Result;
use telecast_db::Database;

/// Handle for acquiring named single-flight locks.
pub struct SingleFlight {
    db: Arc<Database>,
    holder: String,
}

impl SingleFlight {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            // One holder identity per process instance.
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Try to take `name` for `ttl_secs`. `None` means another instance holds
    /// it — callers exit quietly (skipped, not an error).
    pub fn acquire(&self, name: &str, ttl_secs: i64) -> Result<Option<LockLease>> {
        if self.db.acquire_lock(name, &self.holder, ttl_secs)? {
            Ok(Some(LockLease {
                db: self.db.clone(),
                name: name.to_string(),
                holder: self.holder.clone(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

/// A held lock. Released on drop, so the release runs on every exit path of
/// the guarded section, including early returns and panics.
pub struct LockLease {
    db: Arc<Database>,
    name: String,
    holder: String,
    released: bool,
}

impl LockLease {
    /// Release eagerly; reports errors instead of swallowing them like drop.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.release_lock(&self.name, &self.holder)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.db.release_lock(&self.name, &self.holder) {
                tracing::warn!("Failed to release lock '{}': {e}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_yields_none() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let a = SingleFlight::new(db.clone());
        let b = SingleFlight::new(db.clone());

        let lease = a.acquire("scan", 300).unwrap();
        assert!(lease.is_some());
        assert!(b.acquire("scan", 300).unwrap().is_none());

        lease.unwrap().release().unwrap();
        assert!(b.acquire("scan", 300).unwrap().is_some());
    }

    #[test]
    fn drop_releases() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let a = SingleFlight::new(db.clone());
        {
            let _lease = a.acquire("scan", 300).unwrap().unwrap();
            assert!(a.acquire("scan", 300).unwrap().is_none());
        }
        assert!(a.acquire("scan", 300).unwrap().is_some());
    }
}
