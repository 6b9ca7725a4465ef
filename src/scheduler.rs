use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::candidate::CandidateId;
use crate::config::Config;
use crate::error::Error;
use crate::pool::CandidatePool;
use crate::validator::{aggregate, Probe, ValidationMode, ValidationResult};

/// Counters for one validation cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Candidates handed to the scheduler.
    pub scheduled: usize,
    /// Candidates with a recorded verdict this cycle.
    pub tested: usize,
    pub usable: usize,
    pub unusable: usize,
    /// Candidates cancelled or still waiting when the cycle ended; they
    /// keep their prior state and run again next cycle.
    pub deferred: usize,
    /// Candidates skipped over a contract error.
    pub skipped: usize,
    /// High-water mark of simultaneous in-flight probes.
    pub max_in_flight: usize,
}

enum TaskOutcome {
    Usable,
    Unusable,
    Cancelled,
    Skipped,
}

/// Drives concurrent validation of the pool.
///
/// At most `concurrency_limit` probes are in flight at once; the rest wait
/// on the semaphore. Each candidate runs `rounds` sequential probe rounds
/// and the aggregated verdict is written back to the pool. A cycle-wide
/// deadline aborts stragglers, and a shutdown signal cancels cooperatively;
/// either way interrupted candidates are reverted, never marked failed.
pub struct ValidationScheduler {
    probe: Arc<dyn Probe>,
    rounds: u32,
    mode: ValidationMode,
    limit: usize,
    cycle_timeout: Duration,
}

impl std::fmt::Debug for ValidationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationScheduler")
            .field("rounds", &self.rounds)
            .field("mode", &self.mode)
            .field("limit", &self.limit)
            .field("cycle_timeout", &self.cycle_timeout)
            .finish_non_exhaustive()
    }
}

impl ValidationScheduler {
    /// Rejects a config the scheduler cannot honour: zero rounds would
    /// leave aggregation with nothing to decide on, and a zero limit would
    /// park every candidate on the semaphore forever.
    pub fn new(probe: Arc<dyn Probe>, config: &Config) -> crate::Result<Self> {
        if config.validation_rounds == 0 {
            return Err(Error::Configuration(
                "validation_rounds must be at least 1".into(),
            ));
        }
        if config.concurrency_limit == 0 {
            return Err(Error::Configuration(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        Ok(Self {
            probe,
            rounds: config.validation_rounds,
            mode: config.validation_mode,
            limit: config.concurrency_limit,
            cycle_timeout: config.cycle_timeout(),
        })
    }

    /// Validates every candidate currently in the pool, once.
    pub async fn run_cycle(
        &self,
        pool: &CandidatePool,
        shutdown: watch::Receiver<bool>,
    ) -> CycleStats {
        let ids = pool.identities();
        let mut stats = CycleStats {
            scheduled: ids.len(),
            ..CycleStats::default()
        };
        if ids.is_empty() {
            return stats;
        }

        let semaphore = Arc::new(Semaphore::new(self.limit));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for id in ids {
            tasks.spawn(candidate_task(
                id,
                Arc::clone(&self.probe),
                pool.clone(),
                self.rounds,
                self.mode,
                Arc::clone(&semaphore),
                Arc::clone(&in_flight),
                Arc::clone(&max_in_flight),
                shutdown.clone(),
            ));
        }

        let deadline = tokio::time::Instant::now() + self.cycle_timeout;
        let mut timed_out = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => match outcome {
                        TaskOutcome::Usable => {
                            stats.tested += 1;
                            stats.usable += 1;
                        }
                        TaskOutcome::Unusable => {
                            stats.tested += 1;
                            stats.unusable += 1;
                        }
                        TaskOutcome::Cancelled => stats.deferred += 1,
                        TaskOutcome::Skipped => stats.skipped += 1,
                    },
                    // Aborted at the deadline; the candidate waits for the
                    // next cycle.
                    Some(Err(_)) => stats.deferred += 1,
                },
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    warn!("cycle deadline reached, aborting in-flight probes");
                    tasks.abort_all();
                    timed_out = true;
                }
            }
        }

        // Anything still marked Validating was interrupted mid-rounds.
        pool.revert_in_flight();
        stats.max_in_flight = max_in_flight.load(Ordering::Relaxed);
        info!(
            scheduled = stats.scheduled,
            usable = stats.usable,
            unusable = stats.unusable,
            deferred = stats.deferred,
            max_in_flight = stats.max_in_flight,
            "validation cycle finished"
        );
        stats
    }

    /// Runs cycles on a fixed interval until the shutdown signal fires.
    /// For callers that only want revalidation of an existing pool; the
    /// full fetch-validate-evict-export loop lives in `PoolManager::run`.
    pub async fn run_periodic(
        &self,
        pool: &CandidatePool,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            self.run_cycle(pool, shutdown.clone()).await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("scheduler shutting down");
                    return;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn candidate_task(
    id: CandidateId,
    probe: Arc<dyn Probe>,
    pool: CandidatePool,
    rounds: u32,
    mode: ValidationMode,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> TaskOutcome {
    // Wait for a worker slot, unless shutdown wins first.
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return TaskOutcome::Cancelled,
        },
        _ = shutdown.changed() => return TaskOutcome::Cancelled,
    };

    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    max_in_flight.fetch_max(current, Ordering::SeqCst);
    pool.mark_validating(&id);

    let mut results: Vec<ValidationResult> = Vec::with_capacity(rounds as usize);
    for _ in 0..rounds {
        let round = tokio::select! {
            round = probe.probe(&id) => round,
            _ = shutdown.changed() => {
                // Abandon cleanly: no partial verdict is ever recorded.
                in_flight.fetch_sub(1, Ordering::SeqCst);
                return TaskOutcome::Cancelled;
            }
        };
        match round {
            Ok(result) => results.push(result),
            Err(e) => {
                // Contract violation, not a network verdict. Leave the
                // candidate alone rather than invent a failure.
                error!(candidate = %id, error = %e, "probe contract error");
                in_flight.fetch_sub(1, Ordering::SeqCst);
                return TaskOutcome::Skipped;
            }
        }
    }
    in_flight.fetch_sub(1, Ordering::SeqCst);

    // All rounds completed; a partial set never reaches aggregation.
    let verdict = aggregate(mode, &results);
    let usable = verdict.usable;
    pool.record_result(&id, &verdict);
    if usable {
        TaskOutcome::Usable
    } else {
        TaskOutcome::Unusable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Anonymity, CandidateState};
    use crate::error::Error;
    use crate::validator::FailureReason;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn config(limit: usize, rounds: u32, mode: ValidationMode) -> Config {
        Config {
            concurrency_limit: limit,
            validation_rounds: rounds,
            validation_mode: mode,
            cycle_timeout_secs: 30,
            ..Config::default()
        }
    }

    fn seeded_pool(n: usize) -> CandidatePool {
        let pool = CandidatePool::new();
        for i in 0..n {
            pool.upsert(format!("10.0.{}.{}:8080", i / 256, i % 256).parse().unwrap());
        }
        pool
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn zero_rounds_is_rejected_at_construction() {
        let err = ValidationScheduler::new(
            Arc::new(StuckProbe),
            &config(4, 0, ValidationMode::Any),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = ValidationScheduler::new(
            Arc::new(StuckProbe),
            &config(0, 2, ValidationMode::Any),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    /// Probe that tracks its own concurrency and always succeeds.
    struct CountingProbe {
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn probe(&self, _id: &CandidateId) -> crate::Result<ValidationResult> {
            let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ValidationResult::usable(
                Duration::from_millis(20),
                Anonymity::Elite,
            ))
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn in_flight_probes_never_exceed_limit() {
        let probe = Arc::new(CountingProbe {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
        });
        let scheduler =
            ValidationScheduler::new(probe.clone(), &config(3, 1, ValidationMode::Any)).unwrap();
        let pool = seeded_pool(20);

        let (_tx, rx) = no_shutdown();
        let stats = scheduler.run_cycle(&pool, rx).await;

        assert_eq!(stats.tested, 20);
        assert_eq!(stats.usable, 20);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        assert!(stats.max_in_flight <= 3);
        assert_eq!(pool.usable_count(), 20);
    }

    /// Probe that counts how many times it was asked at all.
    struct TallyProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for TallyProbe {
        async fn probe(&self, _id: &CandidateId) -> crate::Result<ValidationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ValidationResult::usable(
                Duration::from_millis(5),
                Anonymity::Elite,
            ))
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn periodic_cycles_repeat_until_shutdown() {
        let probe = Arc::new(TallyProbe {
            calls: AtomicUsize::new(0),
        });
        let scheduler =
            ValidationScheduler::new(probe.clone(), &config(4, 1, ValidationMode::Any)).unwrap();
        let pool = seeded_pool(2);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let pool = pool.clone();
            async move {
                scheduler
                    .run_periodic(&pool, Duration::from_millis(20), rx)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Both candidates were probed on at least two separate cycles, and
        // the loop actually returned once signalled.
        assert!(probe.calls.load(Ordering::SeqCst) >= 4);
        assert_eq!(pool.usable_count(), 2);
    }

    /// Probe that replays a fixed script of outcomes per candidate.
    struct ScriptedProbe {
        script: Mutex<HashMap<CandidateId, Vec<ValidationResult>>>,
    }

    impl ScriptedProbe {
        fn new(entries: Vec<(CandidateId, Vec<ValidationResult>)>) -> Self {
            Self {
                script: Mutex::new(entries.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, id: &CandidateId) -> crate::Result<ValidationResult> {
            let mut script = self.script.lock().unwrap();
            let rounds = script.get_mut(id).expect("unscripted candidate");
            Ok(rounds.remove(0))
        }
    }

    fn ok(ms: u64) -> ValidationResult {
        ValidationResult::usable(Duration::from_millis(ms), Anonymity::Elite)
    }

    fn fail() -> ValidationResult {
        ValidationResult::unusable(FailureReason::Timeout)
    }

    #[tokio::test]
    async fn majority_verdict_is_applied_per_candidate() {
        let good: CandidateId = "1.1.1.1:80".parse().unwrap();
        let bad: CandidateId = "2.2.2.2:80".parse().unwrap();
        let probe = Arc::new(ScriptedProbe::new(vec![
            (good.clone(), vec![ok(100), fail(), ok(120)]),
            (bad.clone(), vec![fail(), fail(), ok(100)]),
        ]));
        let scheduler =
            ValidationScheduler::new(probe, &config(4, 3, ValidationMode::Majority)).unwrap();
        let pool = CandidatePool::new();
        pool.upsert(good.clone());
        pool.upsert(bad.clone());

        let (_tx, rx) = no_shutdown();
        let stats = scheduler.run_cycle(&pool, rx).await;

        assert_eq!(stats.usable, 1);
        assert_eq!(stats.unusable, 1);
        assert_eq!(pool.get(&good).unwrap().state, CandidateState::Usable);
        assert_eq!(pool.get(&bad).unwrap().state, CandidateState::Unusable);
    }

    /// Probe that never finishes within the test's patience.
    struct StuckProbe;

    #[async_trait]
    impl Probe for StuckProbe {
        async fn probe(&self, _id: &CandidateId) -> crate::Result<ValidationResult> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(ok(1))
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn shutdown_leaves_candidates_in_prior_state() {
        let scheduler =
            ValidationScheduler::new(Arc::new(StuckProbe), &config(4, 1, ValidationMode::Any))
                .unwrap();
        let pool = CandidatePool::new();
        let a: CandidateId = "1.1.1.1:80".parse().unwrap();
        pool.upsert(a.clone());
        pool.record_result(&a, &ok(50));
        pool.upsert("2.2.2.2:80".parse().unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let pool = pool.clone();
            async move {
                let s = scheduler;
                s.run_cycle(&pool, rx).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.tested, 0);
        assert_eq!(stats.deferred, 2);
        // The previously-usable candidate kept its verdict, the fresh one
        // stayed unknown; neither was marked failed by the cancellation.
        assert_eq!(pool.get(&a).unwrap().state, CandidateState::Usable);
        assert_eq!(
            pool.get(&"2.2.2.2:80".parse().unwrap()).unwrap().state,
            CandidateState::Unknown
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn cycle_deadline_aborts_and_reverts() {
        let mut cfg = config(4, 1, ValidationMode::Any);
        cfg.cycle_timeout_secs = 1;
        let scheduler = ValidationScheduler::new(Arc::new(StuckProbe), &cfg).unwrap();
        let pool = seeded_pool(3);

        let (_tx, rx) = no_shutdown();
        let stats = scheduler.run_cycle(&pool, rx).await;

        assert_eq!(stats.tested, 0);
        assert_eq!(stats.deferred, 3);
        for c in pool.snapshot(|_| true, crate::pool::SortKey::Unordered) {
            assert_eq!(c.state, CandidateState::Unknown);
        }
    }

    /// Probe that reports a contract violation.
    struct BrokenProbe;

    #[async_trait]
    impl Probe for BrokenProbe {
        async fn probe(&self, id: &CandidateId) -> crate::Result<ValidationResult> {
            Err(Error::ProbeSetup(id.to_string()))
        }
    }

    #[tokio::test]
    async fn contract_errors_skip_without_a_verdict() {
        let scheduler =
            ValidationScheduler::new(Arc::new(BrokenProbe), &config(2, 2, ValidationMode::Any))
                .unwrap();
        let pool = seeded_pool(2);

        let (_tx, rx) = no_shutdown();
        let stats = scheduler.run_cycle(&pool, rx).await;

        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.tested, 0);
        for c in pool.snapshot(|_| true, crate::pool::SortKey::Unordered) {
            assert_eq!(c.state, CandidateState::Unknown);
            assert_eq!(c.consecutive_failures, 0);
        }
    }
}
