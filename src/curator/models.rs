//! Endpoint data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported proxy URI schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Ss,
    Ssr,
    Trojan,
}

impl Protocol {
    /// Detect the protocol from a URI prefix
    pub fn from_uri(uri: &str) -> Option<Self> {
        let scheme = uri.split("://").next()?;
        match scheme {
            "vless" => Some(Protocol::Vless),
            "vmess" => Some(Protocol::Vmess),
            "ss" => Some(Protocol::Ss),
            "ssr" => Some(Protocol::Ssr),
            "trojan" => Some(Protocol::Trojan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Ss => "ss",
            Protocol::Ssr => "ssr",
            Protocol::Trojan => "trojan",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::from_uri(&format!("{}://", s))
            .ok_or_else(|| anyhow::anyhow!("unknown protocol: {}", s))
    }
}

/// Which phase of testing an orchestrator pass performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Latency,
    Speed,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Latency => write!(f, "latency"),
            TestKind::Speed => write!(f, "speed"),
        }
    }
}

/// Ranking strategy for the internal-proxy candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorMode {
    #[default]
    SpeedPassed,
    LatencyPassed,
}

/// One tester verdict for one URI. Transient: merged into the matching
/// endpoint record by the store, never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub uri: String,
    pub delay_ms: Option<i64>,
    pub download_mbps: Option<f64>,
    pub http_code: Option<i64>,
    pub location: Option<String>,
    pub passed: bool,
}

impl TestOutcome {
    /// Outcome for a URI the tester never got to report on (spawn failure,
    /// timeout, cancellation). Feeds the retry path.
    pub fn unreached(uri: String) -> Self {
        Self {
            uri,
            delay_ms: None,
            download_mbps: None,
            http_code: None,
            location: None,
            passed: false,
        }
    }

    /// 403 signals a likely spam-block: still reachable, but demoted in
    /// every ranking.
    pub fn is_spam_blocked(&self) -> bool {
        self.http_code == Some(403)
    }
}

/// Persisted endpoint row, one per normalized URI
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EndpointRecord {
    pub uri: String,
    pub protocol: String,
    pub location: Option<String>,
    pub delay_ms: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub latency_passed: bool,
    pub download_mbps: Option<f64>,
    pub last_speed_checked_at: Option<DateTime<Utc>>,
    pub speed_passed: bool,
    pub http_code: Option<i64>,
    pub retry_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub source_ref: Option<String>,
}

impl EndpointRecord {
    pub fn is_spam_blocked(&self) -> bool {
        self.http_code == Some(403)
    }

    /// Most recent successful check of either kind, used as a ranking
    /// tie-breaker.
    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_checked_at, self.last_speed_checked_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}
