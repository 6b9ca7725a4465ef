use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::candidate::{Anonymity, CandidateId};
use crate::config::Config;
use crate::error::{Error, Result};

/// How per-candidate probe rounds aggregate into one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// One successful round suffices.
    Any,
    /// More than half of the rounds must succeed.
    Majority,
    /// Every round must succeed.
    All,
}

impl Default for ValidationMode {
    fn default() -> Self {
        Self::Any
    }
}

/// Why a probe came back unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ConnectionRefused,
    ProtocolError,
    UnexpectedStatus,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ConnectionRefused => write!(f, "connection_refused"),
            FailureReason::ProtocolError => write!(f, "protocol_error"),
            FailureReason::UnexpectedStatus => write!(f, "unexpected_status"),
        }
    }
}

/// Outcome of one probe round, or of an aggregated cycle. Immutable once
/// produced; the pool consumes it to update a candidate.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub usable: bool,
    pub latency: Option<Duration>,
    pub anonymity: Anonymity,
    pub reason: Option<FailureReason>,
}

impl ValidationResult {
    pub fn usable(latency: Duration, anonymity: Anonymity) -> Self {
        Self {
            usable: true,
            latency: Some(latency),
            anonymity,
            reason: None,
        }
    }

    pub fn unusable(reason: FailureReason) -> Self {
        Self {
            usable: false,
            latency: None,
            anonymity: Anonymity::None,
            reason: Some(reason),
        }
    }
}

/// Collapses a complete set of rounds into the cycle verdict.
///
/// Callers must pass every round of the cycle; a partial set would let a
/// truncated cycle pass as a majority. On success the latency is the mean
/// over successful rounds and the anonymity the strongest tier observed; on
/// failure the first failure reason is carried.
pub fn aggregate(mode: ValidationMode, rounds: &[ValidationResult]) -> ValidationResult {
    assert!(!rounds.is_empty(), "aggregate requires at least one round");
    let successes: Vec<&ValidationResult> = rounds.iter().filter(|r| r.usable).collect();
    let passed = match mode {
        ValidationMode::Any => !successes.is_empty(),
        ValidationMode::Majority => successes.len() * 2 > rounds.len(),
        ValidationMode::All => successes.len() == rounds.len(),
    };
    if passed {
        let total: Duration = successes.iter().filter_map(|r| r.latency).sum();
        let latency = total / successes.len() as u32;
        let anonymity = successes
            .iter()
            .map(|r| r.anonymity)
            .max()
            .unwrap_or_default();
        ValidationResult::usable(latency, anonymity)
    } else {
        let reason = rounds
            .iter()
            .find_map(|r| r.reason)
            .unwrap_or(FailureReason::ProtocolError);
        ValidationResult::unusable(reason)
    }
}

/// Seam between the scheduler and the network. Production code uses
/// [`Validator`]; tests drive the scheduler with scripted probes.
#[async_trait]
pub trait Probe: Send + Sync {
    /// One bounded-duration probe round. Expected network failures come
    /// back as unusable results; `Err` means a contract violation.
    async fn probe(&self, id: &CandidateId) -> Result<ValidationResult>;
}

/// Echo-endpoint response body: the connecting IP plus the request headers
/// as the endpoint saw them (httpbin-style).
#[derive(Debug, Deserialize)]
struct EchoResponse {
    origin: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Probes one candidate against the configured test endpoint.
pub struct Validator {
    test_url: String,
    timeout: Duration,
    check_anonymity: bool,
    /// Egress IP discovered via a direct request, for transparency checks.
    own_ip: OnceCell<Option<String>>,
}

impl Validator {
    pub fn new(config: &Config) -> Self {
        Self {
            test_url: config.test_url.clone(),
            timeout: config.probe_timeout(),
            check_anonymity: config.check_anonymity,
            own_ip: OnceCell::new(),
        }
    }

    /// The requester's own egress IP, fetched once without a proxy. `None`
    /// when discovery fails; classification then falls back to header
    /// presence alone.
    async fn own_ip(&self) -> Option<String> {
        self.own_ip
            .get_or_init(|| async {
                let client = reqwest::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .ok()?;
                let resp = client.get(&self.test_url).send().await.ok()?;
                let echo: EchoResponse = resp.json().await.ok()?;
                debug!(ip = %echo.origin, "discovered egress IP");
                Some(echo.origin)
            })
            .await
            .clone()
    }

    fn classify_failure(err: &reqwest::Error) -> FailureReason {
        if err.is_timeout() {
            FailureReason::Timeout
        } else if err.is_connect() {
            FailureReason::ConnectionRefused
        } else {
            FailureReason::ProtocolError
        }
    }
}

#[async_trait]
impl Probe for Validator {
    async fn probe(&self, id: &CandidateId) -> Result<ValidationResult> {
        // Client construction failures are contract errors, not verdicts.
        let proxy = reqwest::Proxy::all(id.proxy_url())
            .map_err(|e| Error::ProbeSetup(format!("{id}: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::ProbeSetup(format!("{id}: {e}")))?;

        let own_ip = if self.check_anonymity {
            self.own_ip().await
        } else {
            None
        };

        let start = Instant::now();
        let resp = match client.get(&self.test_url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let reason = Self::classify_failure(&e);
                debug!(candidate = %id, %reason, "probe failed");
                return Ok(ValidationResult::unusable(reason));
            }
        };
        if !resp.status().is_success() {
            debug!(candidate = %id, status = %resp.status(), "unexpected status");
            return Ok(ValidationResult::unusable(FailureReason::UnexpectedStatus));
        }
        let echo: EchoResponse = match resp.json().await {
            Ok(echo) => echo,
            // The deadline can also expire while the body drains, so this
            // arm classifies too rather than blaming the protocol.
            Err(e) => {
                let reason = Self::classify_failure(&e);
                warn!(candidate = %id, error = %e, %reason, "echo response unreadable");
                return Ok(ValidationResult::unusable(reason));
            }
        };
        let latency = start.elapsed();

        let anonymity = if self.check_anonymity {
            classify_anonymity(&echo.origin, &echo.headers, own_ip.as_deref())
        } else {
            Anonymity::None
        };
        Ok(ValidationResult::usable(latency, anonymity))
    }
}

/// Headers a forwarding intermediary typically injects.
const FORWARDING_HEADERS: &[&str] = &[
    "via",
    "x-forwarded-for",
    "forwarded",
    "x-real-ip",
    "x-proxy-connection",
    "proxy-connection",
];

/// Infers the anonymity tier from what the echo endpoint saw.
///
/// The rule: an endpoint that reports our own IP as the connecting address
/// conceals nothing; one that leaks our IP through forwarding headers is
/// transparent; one that announces itself as a proxy without leaking the IP
/// is anonymous; one indistinguishable from a direct client is elite.
pub fn classify_anonymity(
    origin: &str,
    headers: &HashMap<String, String>,
    own_ip: Option<&str>,
) -> Anonymity {
    if let Some(ip) = own_ip {
        if origin == ip {
            return Anonymity::None;
        }
        if headers.values().any(|v| v.contains(ip)) {
            return Anonymity::Transparent;
        }
    }
    let has_forwarding = headers
        .keys()
        .any(|k| FORWARDING_HEADERS.contains(&k.to_ascii_lowercase().as_str()));
    if has_forwarding {
        Anonymity::Anonymous
    } else {
        Anonymity::Elite
    }
}
