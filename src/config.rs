use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::validator::ValidationMode;

/// A remote list of candidate endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub format: SourceFormat,
}

impl SourceConfig {
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: SourceFormat::Plain,
        }
    }
}

/// Wire format of a source list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Newline-delimited `host:port`, `#` comments ignored.
    Plain,
    /// JSON array of `host:port` strings.
    Json,
}

impl Default for SourceFormat {
    fn default() -> Self {
        Self::Plain
    }
}

/// Top-level configuration, loaded from a toml file or built in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Candidate list origins.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Maximum simultaneous in-flight probes.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Hard timeout for a single probe (milliseconds).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Probe rounds per candidate per cycle.
    #[serde(default = "default_validation_rounds")]
    pub validation_rounds: u32,
    /// How rounds aggregate into a verdict.
    #[serde(default)]
    pub validation_mode: ValidationMode,
    /// Seconds between refresh cycles when running periodically.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Candidates with no successful validation older than this are evicted.
    #[serde(default = "default_max_candidate_age_secs")]
    pub max_candidate_age_secs: u64,
    /// Consecutive failures before eviction.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Endpoint probes are sent through candidates. Must echo request
    /// headers as JSON for the anonymity check to classify.
    #[serde(default = "default_test_url")]
    pub test_url: String,
    #[serde(default)]
    pub check_anonymity: bool,
    /// Per-source fetch timeout (milliseconds).
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Attempts per source before giving up for the cycle.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    /// Base delay of the exponential fetch backoff (milliseconds).
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    /// Backoff ceiling (milliseconds).
    #[serde(default = "default_fetch_backoff_cap_ms")]
    pub fetch_backoff_cap_ms: u64,
    /// Overall deadline for one validation cycle (seconds).
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    /// Where to write the ranked snapshot; no export when unset.
    #[serde(default)]
    pub export_path: Option<String>,
    /// Cap on exported entries; unlimited when unset.
    #[serde(default)]
    pub export_top: Option<usize>,
}

fn default_concurrency_limit() -> usize {
    100
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_validation_rounds() -> u32 {
    2
}
fn default_refresh_interval_secs() -> u64 {
    30
}
fn default_max_candidate_age_secs() -> u64 {
    1800
}
fn default_max_failures() -> u32 {
    3
}
fn default_test_url() -> String {
    "http://httpbin.org/get".to_string()
}
fn default_fetch_timeout_ms() -> u64 {
    10_000
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_fetch_backoff_ms() -> u64 {
    500
}
fn default_fetch_backoff_cap_ms() -> u64 {
    8000
}
fn default_cycle_timeout_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        // Serde's field defaults are the single source of truth.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            Error::Configuration(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        info!(sources = config.sources.len(), "configuration loaded");
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Rejects configurations no cycle could honor. Contract errors, not
    /// runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(Error::Configuration("concurrency_limit must be >= 1".into()));
        }
        if self.validation_rounds == 0 {
            return Err(Error::Configuration("validation_rounds must be >= 1".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::Configuration("probe_timeout_ms must be >= 1".into()));
        }
        if self.cycle_timeout_secs == 0 {
            return Err(Error::Configuration("cycle_timeout_secs must be >= 1".into()));
        }
        if self.test_url.is_empty() {
            return Err(Error::Configuration("test_url must not be empty".into()));
        }
        if self.fetch_attempts == 0 {
            return Err(Error::Configuration("fetch_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn max_candidate_age(&self) -> Duration {
        Duration::from_secs(self.max_candidate_age_secs)
    }
}
