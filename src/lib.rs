//! rapidpool - concurrent proxy pool manager.
//!
//! Fetches candidate endpoints from remote source lists, validates them
//! concurrently under a bounded worker limit, classifies them by quality,
//! and keeps a continuously refreshed pool that consumers can query or
//! export as a ranked snapshot.
//!
//! ```no_run
//! use rapidpool::{Config, PoolManager, SourceConfig};
//!
//! # async fn demo() -> rapidpool::Result<()> {
//! let mut config = Config::default();
//! config.sources.push(SourceConfig::plain(
//!     "https://example.com/proxies.txt",
//! ));
//! let mut manager = PoolManager::new(config)?;
//! manager.run_cycle().await?;
//! let _best = manager.top_candidates(10);
//! # Ok(())
//! # }
//! ```

pub mod candidate;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod pool;
pub mod scheduler;
pub mod validator;

pub use candidate::{Anonymity, Candidate, CandidateId, CandidateState, Scheme};
pub use config::{Config, SourceConfig, SourceFormat};
pub use error::{Error, Result};
pub use fetcher::{FetchOutcome, FetchSummary, SourceDescriptor, SourceFetcher};
pub use manager::{CycleReport, PoolManager};
pub use pool::{CandidatePool, SortKey};
pub use scheduler::{CycleStats, ValidationScheduler};
pub use validator::{
    FailureReason, Probe, ValidationMode, ValidationResult, Validator,
};

/// Initialize the logger with default settings.
pub fn init_logger() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();
}
