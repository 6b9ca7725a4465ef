use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::candidate::CandidateId;
use crate::config::{Config, SourceConfig, SourceFormat};
use crate::error::Result;

/// A remote list origin plus its last-fetch bookkeeping.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub url: String,
    pub format: SourceFormat,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&SourceConfig> for SourceDescriptor {
    fn from(config: &SourceConfig) -> Self {
        Self {
            url: config.url.clone(),
            format: config.format,
            last_fetch: None,
            last_error: None,
        }
    }
}

/// What one source contributed to a fetch batch.
#[derive(Debug, Clone)]
pub struct FetchSummary {
    pub url: String,
    pub fetched: usize,
    pub malformed: usize,
    pub error: Option<String>,
}

impl FetchSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Merged result of one fetch batch.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Deduplicated identities across all sources, discovery order.
    pub candidates: Vec<CandidateId>,
    pub summaries: Vec<FetchSummary>,
}

impl FetchOutcome {
    pub fn sources_failed(&self) -> usize {
        self.summaries.iter().filter(|s| !s.succeeded()).count()
    }
}

/// Retrieves candidate lists from remote sources.
///
/// Sources are fetched concurrently, each with its own timeout and a
/// capped exponential backoff between attempts. A failing source is
/// recorded and skipped; it can never abort the batch. The fetcher only
/// returns data, it does not touch the pool.
pub struct SourceFetcher {
    client: reqwest::Client,
    attempts: u32,
    backoff: Duration,
    backoff_cap: Duration,
}

impl SourceFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .build()?;
        Ok(Self {
            client,
            attempts: config.fetch_attempts,
            backoff: Duration::from_millis(config.fetch_backoff_ms),
            backoff_cap: Duration::from_millis(config.fetch_backoff_cap_ms),
        })
    }

    /// Fetches every source concurrently and merges the results,
    /// deduplicating across sources. Per-source outcomes are written back
    /// into the descriptors.
    pub async fn fetch_all(&self, sources: &mut [SourceDescriptor]) -> FetchOutcome {
        let fetches = sources
            .iter()
            .map(|source| self.fetch_source(source.url.clone(), source.format));
        let results = join_all(fetches).await;

        let mut seen = HashSet::new();
        let mut outcome = FetchOutcome::default();
        for (source, result) in sources.iter_mut().zip(results) {
            source.last_fetch = Some(Utc::now());
            match result {
                Ok(parsed) => {
                    source.last_error = None;
                    let mut new = 0;
                    for id in parsed.candidates {
                        if seen.insert(id.clone()) {
                            outcome.candidates.push(id);
                            new += 1;
                        }
                    }
                    info!(
                        url = %source.url,
                        fetched = parsed.fetched,
                        unique = new,
                        malformed = parsed.malformed,
                        "source fetched"
                    );
                    outcome.summaries.push(FetchSummary {
                        url: source.url.clone(),
                        fetched: parsed.fetched,
                        malformed: parsed.malformed,
                        error: None,
                    });
                }
                Err(message) => {
                    warn!(url = %source.url, error = %message, "source fetch failed");
                    source.last_error = Some(message.clone());
                    outcome.summaries.push(FetchSummary {
                        url: source.url.clone(),
                        fetched: 0,
                        malformed: 0,
                        error: Some(message),
                    });
                }
            }
        }
        outcome
    }

    /// One source with retry. Failures are data here, not `Error`: the
    /// summary carries the message and the batch moves on.
    async fn fetch_source(
        &self,
        url: String,
        format: SourceFormat,
    ) -> std::result::Result<ParsedList, String> {
        let mut delay = self.backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match self.fetch_once(&url, format).await {
                Ok(parsed) => return Ok(parsed),
                Err(message) => {
                    debug!(url = %url, attempt, error = %message, "fetch attempt failed");
                    last_error = message;
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.backoff_cap);
            }
        }
        Err(last_error)
    }

    async fn fetch_once(
        &self,
        url: &str,
        format: SourceFormat,
    ) -> std::result::Result<ParsedList, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        match format {
            SourceFormat::Plain => Ok(parse_plain(&body)),
            SourceFormat::Json => parse_json(&body),
        }
    }
}

struct ParsedList {
    candidates: Vec<CandidateId>,
    fetched: usize,
    malformed: usize,
}

/// Newline-delimited `host:port`. Blank lines and `#` comments are
/// ignored; malformed entries are skipped and counted, never fatal.
fn parse_plain(body: &str) -> ParsedList {
    let mut candidates = Vec::new();
    let mut malformed = 0;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<CandidateId>() {
            Ok(id) => candidates.push(id),
            Err(_) => {
                debug!(entry = %line, "skipping malformed entry");
                malformed += 1;
            }
        }
    }
    let fetched = candidates.len();
    ParsedList {
        candidates,
        fetched,
        malformed,
    }
}

/// JSON array of `host:port` strings.
fn parse_json(body: &str) -> std::result::Result<ParsedList, String> {
    let entries: Vec<String> =
        serde_json::from_str(body).map_err(|e| format!("invalid JSON list: {e}"))?;
    let mut candidates = Vec::new();
    let mut malformed = 0;
    for entry in &entries {
        match entry.parse::<CandidateId>() {
            Ok(id) => candidates.push(id),
            Err(_) => malformed += 1,
        }
    }
    let fetched = candidates.len();
    Ok(ParsedList {
        candidates,
        fetched,
        malformed,
    })
}
