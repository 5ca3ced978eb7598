//! Test orchestration over the external tester binary
//!
//! The tester is a black-box oracle: it takes a file of URIs and reports one
//! structured row per URI. The orchestrator chunks candidate lists, keeps at
//! most `concurrency` child processes in flight, and maps whatever comes back
//! (or does not) onto one `TestOutcome` per URI.

use crate::curator::models::{TestKind, TestOutcome};
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_CHUNK_SIZE: usize = 25;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Capability interface over the external tester. The curation logic is
/// tested against injected fakes; only `XrayKnifeTester` ever spawns a
/// process.
#[async_trait]
pub trait TestOracle: Send + Sync {
    /// Run one test phase over the given URIs. Returns at most one outcome
    /// per URI; URIs whose invocation was cancelled before starting are
    /// omitted rather than reported as failures.
    async fn run(&self, kind: TestKind, uris: &[String]) -> Result<Vec<TestOutcome>>;
}

/// Configuration for the external tester
#[derive(Debug, Clone)]
pub struct TesterConfig {
    /// Path to the tester binary
    pub binary: PathBuf,
    /// Extra arguments appended to every invocation
    pub extra_args: Vec<String>,
    /// Maximum child processes in flight
    pub concurrency: usize,
    /// URIs per invocation
    pub chunk_size: usize,
    /// Hard deadline per invocation
    pub timeout: Duration,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xray-knife"),
            extra_args: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl TesterConfig {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

/// One row of tester output
#[derive(Debug, Deserialize)]
struct ResultRow {
    link: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    delay: Option<i64>,
    #[serde(default)]
    download: Option<f64>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    location: Option<String>,
}

/// Drives the xray-knife binary as a subprocess
pub struct XrayKnifeTester {
    config: TesterConfig,
    cancel: CancellationToken,
}

impl XrayKnifeTester {
    pub fn new(config: TesterConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Run the tester over one chunk. Timeout, spawn failure and a non-zero
    /// exit all degrade to per-URI failed outcomes; cancellation yields no
    /// outcomes at all so no retry counter moves for work that never ran.
    async fn run_chunk(&self, kind: TestKind, uris: &[String]) -> Vec<TestOutcome> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        match self.invoke(kind, uris).await {
            Ok(rows) => align_outcomes(kind, uris, rows),
            Err(ChunkError::Cancelled) => Vec::new(),
            Err(ChunkError::Failed(e)) => {
                warn!(kind = %kind, uris = uris.len(), error = %e, "tester invocation failed");
                uris.iter()
                    .map(|uri| TestOutcome::unreached(uri.clone()))
                    .collect()
            }
        }
    }

    async fn invoke(&self, kind: TestKind, uris: &[String]) -> std::result::Result<Vec<ResultRow>, ChunkError> {
        let mut input = tempfile::NamedTempFile::new().map_err(fail)?;
        for uri in uris {
            writeln!(input, "{}", uri).map_err(fail)?;
        }
        input.flush().map_err(fail)?;
        let output = tempfile::NamedTempFile::new().map_err(fail)?;

        let mut command = Command::new(&self.config.binary);
        command
            .arg("http")
            .arg("-f")
            .arg(input.path())
            .arg("-o")
            .arg(output.path())
            .args(["-x", "json"])
            .args(&self.config.extra_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if kind == TestKind::Speed {
            command.arg("-p");
        }

        debug!(kind = %kind, uris = uris.len(), "spawning tester");
        let mut child = command.spawn().map_err(fail)?;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("cancellation requested, terminating tester process");
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                Err(ChunkError::Cancelled)
            }
            status = tokio::time::timeout(self.config.timeout, child.wait()) => {
                match status {
                    Ok(Ok(status)) if status.success() => {
                        let raw = std::fs::read_to_string(output.path()).map_err(fail)?;
                        let rows: Vec<ResultRow> =
                            serde_json::from_str(&raw).context("malformed tester output").map_err(ChunkError::Failed)?;
                        Ok(rows)
                    }
                    Ok(Ok(status)) => Err(ChunkError::Failed(anyhow::anyhow!(
                        "tester exited with {}",
                        status
                    ))),
                    Ok(Err(e)) => Err(fail(e)),
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                        Err(ChunkError::Failed(anyhow::anyhow!(
                            "tester timed out after {:?}",
                            self.config.timeout
                        )))
                    }
                }
            }
        }
    }
}

enum ChunkError {
    Cancelled,
    Failed(anyhow::Error),
}

fn fail<E: Into<anyhow::Error>>(e: E) -> ChunkError {
    ChunkError::Failed(e.into())
}

#[async_trait]
impl TestOracle for XrayKnifeTester {
    async fn run(&self, kind: TestKind, uris: &[String]) -> Result<Vec<TestOutcome>> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }
        info!(kind = %kind, total = uris.len(), "starting test phase");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let chunks: Vec<Vec<String>> = uris
            .chunks(self.config.chunk_size)
            .map(|c| c.to_vec())
            .collect();

        let outcomes: Vec<Vec<TestOutcome>> = stream::iter(chunks)
            .map(|chunk| {
                let sem = Arc::clone(&semaphore);
                async move {
                    // The permit, not buffer_unordered, is what bounds the
                    // number of live child processes
                    let _permit = sem.acquire().await.expect("semaphore closed unexpectedly");
                    self.run_chunk(kind, &chunk).await
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let outcomes: Vec<TestOutcome> = outcomes.into_iter().flatten().collect();
        let passed = outcomes.iter().filter(|o| o.passed).count();
        info!(kind = %kind, passed, failed = outcomes.len() - passed, "test phase done");
        Ok(outcomes)
    }
}

/// Map tester rows back onto the requested URIs: URIs the tester never
/// reported on become failed outcomes. A 403 from the latency phase is not a
/// failure by itself; the row's own status decides.
fn align_outcomes(kind: TestKind, uris: &[String], rows: Vec<ResultRow>) -> Vec<TestOutcome> {
    let mut by_uri: HashMap<String, ResultRow> =
        rows.into_iter().map(|r| (r.link.clone(), r)).collect();

    uris.iter()
        .map(|uri| match by_uri.remove(uri) {
            Some(row) => {
                let passed = row.status.as_deref() == Some("passed");
                TestOutcome {
                    uri: uri.clone(),
                    delay_ms: row.delay,
                    download_mbps: if kind == TestKind::Speed {
                        row.download
                    } else {
                        None
                    },
                    http_code: row.code,
                    location: row.location.filter(|l| !l.is_empty()),
                    passed,
                }
            }
            None => TestOutcome::unreached(uri.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(link: &str, status: &str, delay: Option<i64>, code: Option<i64>) -> ResultRow {
        ResultRow {
            link: link.to_string(),
            status: Some(status.to_string()),
            delay,
            download: None,
            code,
            location: Some("US".to_string()),
        }
    }

    #[test]
    fn test_align_reports_missing_uris_as_failed() {
        let uris = vec!["vless://a@h:443".to_string(), "vless://b@h:443".to_string()];
        let rows = vec![row("vless://a@h:443", "passed", Some(42), Some(200))];

        let outcomes = align_outcomes(TestKind::Latency, &uris, rows);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert_eq!(outcomes[0].delay_ms, Some(42));
        assert!(!outcomes[1].passed);
        assert!(outcomes[1].delay_ms.is_none());
    }

    #[test]
    fn test_align_403_can_still_pass_latency() {
        let uris = vec!["vless://a@h:443".to_string()];
        let rows = vec![row("vless://a@h:443", "passed", Some(80), Some(403))];

        let outcomes = align_outcomes(TestKind::Latency, &uris, rows);
        assert!(outcomes[0].passed);
        assert!(outcomes[0].is_spam_blocked());
    }

    #[test]
    fn test_align_speed_keeps_download() {
        let uris = vec!["vless://a@h:443".to_string()];
        let rows = vec![ResultRow {
            link: "vless://a@h:443".to_string(),
            status: Some("passed".to_string()),
            delay: Some(40),
            download: Some(33.5),
            code: Some(200),
            location: None,
        }];

        let outcomes = align_outcomes(TestKind::Speed, &uris, rows);
        assert_eq!(outcomes[0].download_mbps, Some(33.5));
    }

    #[test]
    fn test_align_latency_drops_download_column() {
        let uris = vec!["vless://a@h:443".to_string()];
        let rows = vec![ResultRow {
            link: "vless://a@h:443".to_string(),
            status: Some("passed".to_string()),
            delay: Some(40),
            download: Some(12.0),
            code: None,
            location: None,
        }];
        let outcomes = align_outcomes(TestKind::Latency, &uris, rows);
        assert!(outcomes[0].download_mbps.is_none());
    }

    #[test]
    fn test_result_rows_deserialize() {
        let raw = r#"[
            {"link": "vless://a@h:443", "status": "passed", "delay": 51, "code": 200, "location": "DE"},
            {"link": "trojan://b@h:443", "status": "failed"}
        ]"#;
        let rows: Vec<ResultRow> = serde_json::from_str(raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].delay, Some(51));
        assert!(rows[1].delay.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = TesterConfig::new(PathBuf::from("/usr/bin/xray-knife"))
            .with_concurrency(8)
            .with_chunk_size(10)
            .with_timeout(Duration::from_secs(60));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_floors_zero_values() {
        let config = TesterConfig::default().with_concurrency(0).with_chunk_size(0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.chunk_size, 1);
    }
}
