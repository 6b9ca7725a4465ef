use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::candidate::Candidate;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{FetchOutcome, SourceDescriptor, SourceFetcher};
use crate::pool::CandidatePool;
use crate::scheduler::{CycleStats, ValidationScheduler};
use crate::validator::Validator;

/// Summary of one full refresh cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub fetch: FetchOutcome,
    pub validation: CycleStats,
    pub evicted: usize,
    /// Entries written to the export file, when exporting is configured.
    pub exported: Option<usize>,
}

/// Top-level orchestrator owning the pool and its collaborators.
///
/// One instance owns one pool; there is no process-wide state. Queries
/// ([`PoolManager::top_candidates`]) go straight to the pool and never wait
/// on an in-progress refresh beyond its short lock.
pub struct PoolManager {
    config: Config,
    pool: CandidatePool,
    fetcher: SourceFetcher,
    scheduler: ValidationScheduler,
    sources: Vec<SourceDescriptor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PoolManager {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = CandidatePool::new();
        let fetcher = SourceFetcher::new(&config)?;
        let validator = Arc::new(Validator::new(&config));
        let scheduler = ValidationScheduler::new(validator, &config)?;
        let sources = config.sources.iter().map(SourceDescriptor::from).collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            pool,
            fetcher,
            scheduler,
            sources,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Shared handle to the pool for other components in the process.
    pub fn pool(&self) -> CandidatePool {
        self.pool.clone()
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    /// Signals the running refresh loop to stop after the current step.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Best usable candidates right now, by descending quality score.
    pub fn top_candidates(&self, n: usize) -> Vec<Candidate> {
        self.pool.top_usable(n)
    }

    /// One full refresh: fetch → merge → validate → evict → export.
    /// Always completes and always leaves a best-effort snapshot, even if
    /// some sources or candidates failed along the way.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let fetch = self.fetcher.fetch_all(&mut self.sources).await;
        let new = self.pool.merge(fetch.candidates.iter().cloned());
        info!(
            discovered = fetch.candidates.len(),
            new,
            failed_sources = fetch.sources_failed(),
            "fetch complete"
        );

        let validation = self
            .scheduler
            .run_cycle(&self.pool, self.shutdown_rx.clone())
            .await;

        let evicted = self
            .pool
            .evict_stale(self.config.max_candidate_age(), self.config.max_failures);
        if evicted > 0 {
            info!(evicted, remaining = self.pool.len(), "evicted stale candidates");
        }

        let exported = match &self.config.export_path {
            Some(path) => Some(self.export(path.clone())?),
            None => None,
        };

        Ok(CycleReport {
            fetch,
            validation,
            evicted,
            exported,
        })
    }

    /// Runs refresh cycles on the configured interval until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let report = self.run_cycle().await?;
            debug!(
                usable = self.pool.usable_count(),
                total = self.pool.len(),
                deferred = report.validation.deferred,
                "cycle report"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval()) => {}
                _ = shutdown.changed() => {
                    info!("pool manager stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Writes the ranked `host:port` snapshot. The file is produced in a
    /// sibling temp file and renamed into place so concurrent readers
    /// never observe a partial snapshot.
    pub fn export<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let limit = self.config.export_top.unwrap_or(usize::MAX);
        let candidates = self.pool.top_usable(limit);
        write_snapshot(path.as_ref(), &candidates)?;
        info!(
            count = candidates.len(),
            path = %path.as_ref().display(),
            "snapshot exported"
        );
        Ok(candidates.len())
    }
}

fn write_snapshot(path: &Path, candidates: &[Candidate]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        for candidate in candidates {
            writeln!(file, "{}", candidate.id)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("renaming snapshot into {}: {e}", path.display()),
        ))
    })
}
