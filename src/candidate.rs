use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport scheme a candidate speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Socks5,
}

impl Default for Scheme {
    fn default() -> Self {
        Self::Http
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
            Scheme::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "socks5" => Ok(Scheme::Socks5),
            other => Err(Error::InvalidCandidate(format!("unknown scheme: {other}"))),
        }
    }
}

/// Unique identity of a candidate endpoint within the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateId {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl CandidateId {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
        }
    }

    /// URL form understood by `reqwest::Proxy::all`.
    pub fn proxy_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for CandidateId {
    type Err = Error;

    /// Parses `host:port` or `scheme://host:port`. Bare entries default to
    /// http, which is what plain-text source lists carry.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidCandidate("empty entry".into()));
        }
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse()?, rest),
            None => (Scheme::Http, s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidCandidate(format!("missing port: {s}")))?;
        if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
            return Err(Error::InvalidCandidate(format!("bad host: {s}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidCandidate(format!("bad port: {s}")))?;
        if port == 0 {
            return Err(Error::InvalidCandidate(format!("bad port: {s}")));
        }
        Ok(Self::new(host, port, scheme))
    }
}

/// State of a candidate in the pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateState {
    Unknown,
    Validating,
    Usable,
    Unusable,
}

impl Default for CandidateState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateState::Unknown => write!(f, "unknown"),
            CandidateState::Validating => write!(f, "validating"),
            CandidateState::Usable => write!(f, "usable"),
            CandidateState::Unusable => write!(f, "unusable"),
        }
    }
}

/// How much of the requester's identity the endpoint conceals.
///
/// Ordered ascending so `max` picks the strongest tier observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
    /// The origin IP reaches the target unchanged.
    None,
    /// Forwarding headers expose the origin IP.
    Transparent,
    /// Proxy-identifying headers present, origin IP hidden.
    Anonymous,
    /// Indistinguishable from a direct client.
    Elite,
}

impl Default for Anonymity {
    fn default() -> Self {
        Self::None
    }
}

impl Anonymity {
    /// Ranking weight for the quality score.
    pub fn weight(self) -> f64 {
        match self {
            Anonymity::None => 0.4,
            Anonymity::Transparent => 0.6,
            Anonymity::Anonymous => 0.85,
            Anonymity::Elite => 1.0,
        }
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anonymity::None => write!(f, "none"),
            Anonymity::Transparent => write!(f, "transparent"),
            Anonymity::Anonymous => write!(f, "anonymous"),
            Anonymity::Elite => write!(f, "elite"),
        }
    }
}

/// Weight given to the newest probe outcome in the rolling success rate.
const SUCCESS_RATE_WEIGHT: f64 = 0.3;

/// A candidate endpoint together with its last-known state and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub state: CandidateState,
    /// State to restore if an in-flight validation is cancelled.
    pub(crate) prior_state: CandidateState,
    /// Latency of the most recent successful probe.
    pub latency: Option<Duration>,
    pub anonymity: Anonymity,
    pub consecutive_failures: u32,
    /// Decayed moving success rate over probe history, 0.0-1.0.
    pub success_rate: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
}

impl Candidate {
    pub fn new(id: CandidateId) -> Self {
        Self {
            id,
            state: CandidateState::Unknown,
            prior_state: CandidateState::Unknown,
            latency: None,
            anonymity: Anonymity::None,
            consecutive_failures: 0,
            success_rate: 0.0,
            last_checked: None,
            first_seen: Utc::now(),
        }
    }

    /// Folds one probe outcome into the decayed success rate.
    pub fn update_success_rate(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate =
            self.success_rate * (1.0 - SUCCESS_RATE_WEIGHT) + outcome * SUCCESS_RATE_WEIGHT;
    }

    /// Single ordering key combining success rate, latency and anonymity.
    /// Higher is better; unusable candidates score 0.
    pub fn quality_score(&self) -> f64 {
        if self.state != CandidateState::Usable {
            return 0.0;
        }
        let latency_factor = match self.latency {
            Some(lat) => 1.0 / (1.0 + lat.as_millis() as f64 / 1000.0),
            None => 0.0,
        };
        self.success_rate * latency_factor * self.anonymity.weight()
    }

    pub fn is_usable(&self) -> bool {
        self.state == CandidateState::Usable
    }
}
