use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::candidate::{Candidate, CandidateId, CandidateState};
use crate::validator::ValidationResult;

/// Sort order for pool snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Descending quality score.
    Quality,
    /// Ascending latency; candidates without a latency sort last.
    Latency,
    /// No particular order.
    Unordered,
}

/// Thread-safe registry of candidates keyed by identity.
///
/// Every mutation is atomic; the lock is held only for in-memory work,
/// never across I/O or an await point. The handle is cheap to clone and
/// all clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    inner: Arc<Mutex<HashMap<CandidateId, Candidate>>>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an identity, returning true if it was new. A repeat
    /// observation leaves the existing entry and its metrics in place.
    pub fn upsert(&self, id: CandidateId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                let id = slot.key().clone();
                slot.insert(Candidate::new(id));
                true
            }
        }
    }

    /// Merges a batch of identities; returns how many were new.
    pub fn merge(&self, ids: impl IntoIterator<Item = CandidateId>) -> usize {
        ids.into_iter().filter(|id| self.upsert(id.clone())).count()
    }

    /// Claims a candidate for validation, remembering the state to restore
    /// if the cycle is cancelled.
    pub fn mark_validating(&self, id: &CandidateId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(candidate) = inner.get_mut(id) {
            if candidate.state != CandidateState::Validating {
                candidate.prior_state = candidate.state;
            }
            candidate.state = CandidateState::Validating;
        }
    }

    /// Applies an aggregated verdict to a candidate.
    pub fn record_result(&self, id: &CandidateId, result: &ValidationResult) {
        let mut inner = self.inner.lock().unwrap();
        let Some(candidate) = inner.get_mut(id) else {
            return;
        };
        candidate.last_checked = Some(Utc::now());
        candidate.update_success_rate(result.usable);
        if result.usable {
            candidate.state = CandidateState::Usable;
            candidate.latency = result.latency;
            candidate.anonymity = result.anonymity;
            candidate.consecutive_failures = 0;
        } else {
            candidate.state = CandidateState::Unusable;
            candidate.consecutive_failures += 1;
        }
        candidate.prior_state = candidate.state;
    }

    /// Rolls back candidates still marked Validating to their pre-cycle
    /// state. Called after a cancelled or timed-out cycle so cancellation
    /// never reads as failure. Returns how many were reverted.
    pub fn revert_in_flight(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut reverted = 0;
        for candidate in inner.values_mut() {
            if candidate.state == CandidateState::Validating {
                candidate.state = candidate.prior_state;
                reverted += 1;
            }
        }
        if reverted > 0 {
            debug!(reverted, "rolled back in-flight candidates");
        }
        reverted
    }

    /// Point-in-time copy of matching candidates in the requested order.
    /// Read-only; the pool is untouched.
    pub fn snapshot<F>(&self, filter: F, sort: SortKey) -> Vec<Candidate>
    where
        F: Fn(&Candidate) -> bool,
    {
        let mut entries: Vec<Candidate> = {
            let inner = self.inner.lock().unwrap();
            inner.values().filter(|c| filter(c)).cloned().collect()
        };
        match sort {
            SortKey::Quality => entries.sort_by(|a, b| {
                b.quality_score()
                    .partial_cmp(&a.quality_score())
                    .unwrap_or(Ordering::Equal)
            }),
            SortKey::Latency => entries.sort_by_key(|c| c.latency.unwrap_or(Duration::MAX)),
            SortKey::Unordered => {}
        }
        entries
    }

    /// All identities currently registered, for scheduling.
    pub fn identities(&self) -> Vec<CandidateId> {
        let inner = self.inner.lock().unwrap();
        inner.keys().cloned().collect()
    }

    /// Best usable candidates by quality score.
    pub fn top_usable(&self, n: usize) -> Vec<Candidate> {
        let mut usable = self.snapshot(Candidate::is_usable, SortKey::Quality);
        usable.truncate(n);
        usable
    }

    /// Drops candidates past the failure budget or too old without a
    /// successful validation. Returns the number removed.
    pub fn evict_stale(&self, max_age: Duration, max_failures: u32) -> usize {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|id, candidate| {
            if candidate.consecutive_failures >= max_failures {
                debug!(candidate = %id, failures = candidate.consecutive_failures, "evicting");
                return false;
            }
            let expired = !candidate.is_usable() && now - candidate.first_seen > max_age;
            if expired {
                debug!(candidate = %id, "evicting aged-out candidate");
            }
            !expired
        });
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn usable_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.values().filter(|c| c.is_usable()).count()
    }

    pub fn get(&self, id: &CandidateId) -> Option<Candidate> {
        self.inner.lock().unwrap().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Anonymity;
    use crate::validator::{FailureReason, ValidationResult};

    fn id(s: &str) -> CandidateId {
        s.parse().unwrap()
    }

    fn usable(ms: u64) -> ValidationResult {
        ValidationResult::usable(Duration::from_millis(ms), Anonymity::Elite)
    }

    #[test]
    fn upsert_is_idempotent() {
        let pool = CandidatePool::new();
        assert!(pool.upsert(id("1.2.3.4:8080")));
        assert!(!pool.upsert(id("1.2.3.4:8080")));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn repeat_upsert_keeps_metrics() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        pool.record_result(&a, &usable(50));
        pool.upsert(a.clone());
        let c = pool.get(&a).unwrap();
        assert!(c.is_usable());
        assert_eq!(c.latency, Some(Duration::from_millis(50)));
    }

    #[test]
    fn record_result_drives_state() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        pool.record_result(&a, &usable(50));
        assert_eq!(pool.get(&a).unwrap().state, CandidateState::Usable);

        pool.record_result(&a, &ValidationResult::unusable(FailureReason::Timeout));
        let c = pool.get(&a).unwrap();
        assert_eq!(c.state, CandidateState::Unusable);
        assert_eq!(c.consecutive_failures, 1);

        pool.record_result(&a, &usable(60));
        assert_eq!(pool.get(&a).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn revert_restores_pre_cycle_state() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        pool.record_result(&a, &usable(50));

        pool.mark_validating(&a);
        assert_eq!(pool.get(&a).unwrap().state, CandidateState::Validating);
        assert_eq!(pool.revert_in_flight(), 1);
        assert_eq!(pool.get(&a).unwrap().state, CandidateState::Usable);
    }

    #[test]
    fn revert_skips_settled_candidates() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        pool.mark_validating(&a);
        pool.record_result(&a, &usable(50));
        assert_eq!(pool.revert_in_flight(), 0);
        assert_eq!(pool.get(&a).unwrap().state, CandidateState::Usable);
    }

    #[test]
    fn evicts_after_max_failures() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        for _ in 0..3 {
            pool.record_result(&a, &ValidationResult::unusable(FailureReason::Timeout));
        }
        assert_eq!(pool.evict_stale(Duration::from_secs(3600), 3), 1);
        assert!(pool.get(&a).is_none());
    }

    #[test]
    fn keeps_candidates_under_failure_budget() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        pool.record_result(&a, &ValidationResult::unusable(FailureReason::Timeout));
        assert_eq!(pool.evict_stale(Duration::from_secs(3600), 3), 0);
        assert!(pool.get(&a).is_some());
    }

    #[test]
    fn evicts_aged_out_unvalidated_candidates() {
        let pool = CandidatePool::new();
        pool.upsert(id("1.2.3.4:8080"));
        assert_eq!(pool.evict_stale(Duration::ZERO, 100), 1);
    }

    #[test]
    fn usable_candidates_never_age_out() {
        let pool = CandidatePool::new();
        let a = id("1.2.3.4:8080");
        pool.upsert(a.clone());
        pool.record_result(&a, &usable(50));
        assert_eq!(pool.evict_stale(Duration::ZERO, 100), 0);
    }

    #[test]
    fn snapshot_sorts_by_quality() {
        let pool = CandidatePool::new();
        for (addr, ms) in [("1.1.1.1:80", 900), ("2.2.2.2:80", 100), ("3.3.3.3:80", 400)] {
            let c = id(addr);
            pool.upsert(c.clone());
            pool.record_result(&c, &usable(ms));
        }
        let snap = pool.snapshot(Candidate::is_usable, SortKey::Quality);
        let hosts: Vec<&str> = snap.iter().map(|c| c.id.host.as_str()).collect();
        assert_eq!(hosts, ["2.2.2.2", "3.3.3.3", "1.1.1.1"]);
    }

    #[test]
    fn top_usable_truncates() {
        let pool = CandidatePool::new();
        for (addr, ms) in [("1.1.1.1:80", 900), ("2.2.2.2:80", 100), ("3.3.3.3:80", 400)] {
            let c = id(addr);
            pool.upsert(c.clone());
            pool.record_result(&c, &usable(ms));
        }
        let top = pool.top_usable(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id.host, "2.2.2.2");
    }

    #[test]
    fn concurrent_upserts_never_duplicate() {
        let pool = CandidatePool::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        pool.upsert(id(&format!("10.0.0.{}:8080", i % 10)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.len(), 10);
    }
}
