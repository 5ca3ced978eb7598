//! Internal proxy manager: routes harvesting traffic through a curated
//! endpoint
//!
//! Runs the tester binary in forwarding-proxy mode as a long-lived child
//! process. Failure to start is a degradation, not an abort; the coordinator
//! falls back to direct connectivity.

use crate::Result;
use anyhow::{bail, Context};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

const STOP_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle of the forwarding proxy process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Local SOCKS endpoint exposed by the running proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksEndpoint {
    pub host: String,
    pub port: u16,
}

impl SocksEndpoint {
    pub fn url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyManagerConfig {
    /// Tester binary, reused in forwarding-proxy mode
    pub binary: PathBuf,
    pub listen_host: String,
    pub listen_port: u16,
    pub extra_args: Vec<String>,
    /// How long the child must survive before we call the bind confirmed
    pub startup_wait: Duration,
}

impl Default for ProxyManagerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xray-knife"),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 2080,
            extra_args: Vec::new(),
            startup_wait: Duration::from_millis(500),
        }
    }
}

pub struct InternalProxyManager {
    config: ProxyManagerConfig,
    state: ProxyState,
    child: Option<Child>,
    // The child reads seeds from this file; keep it alive while running
    seeds_file: Option<tempfile::NamedTempFile>,
}

impl InternalProxyManager {
    pub fn new(config: ProxyManagerConfig) -> Self {
        Self {
            config,
            state: ProxyState::Idle,
            child: None,
            seeds_file: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Spawn the forwarding proxy seeded with the given URIs.
    ///
    /// On success the manager is `Running` and the returned endpoint can be
    /// handed to the harvester. On any failure the manager is `Failed` and
    /// the error describes why; the caller treats this as non-fatal.
    pub async fn start(&mut self, seeds: &[String]) -> Result<SocksEndpoint> {
        if seeds.is_empty() {
            bail!("no seed links for internal proxy");
        }
        if self.state == ProxyState::Running {
            bail!("internal proxy already running");
        }
        self.state = ProxyState::Starting;

        match self.spawn(seeds).await {
            Ok(endpoint) => {
                self.state = ProxyState::Running;
                info!(endpoint = %endpoint.url(), seeds = seeds.len(), "internal proxy running");
                Ok(endpoint)
            }
            Err(e) => {
                self.state = ProxyState::Failed;
                self.child = None;
                self.seeds_file = None;
                Err(e)
            }
        }
    }

    async fn spawn(&mut self, seeds: &[String]) -> Result<SocksEndpoint> {
        let mut seeds_file =
            tempfile::NamedTempFile::new().context("creating seeds file for internal proxy")?;
        for uri in seeds {
            writeln!(seeds_file, "{}", uri)?;
        }
        seeds_file.flush()?;

        let listen = format!(
            "socks://{}:{}",
            self.config.listen_host, self.config.listen_port
        );
        let mut child = Command::new(&self.config.binary)
            .arg("proxy")
            .arg("-f")
            .arg(seeds_file.path())
            .arg("-I")
            .arg(&listen)
            .args(&self.config.extra_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} in proxy mode", self.config.binary.display()))?;

        // An immediate exit means the bind failed
        tokio::time::sleep(self.config.startup_wait).await;
        if let Some(status) = child.try_wait()? {
            bail!("internal proxy exited during startup: {}", status);
        }

        self.seeds_file = Some(seeds_file);
        self.child = Some(child);
        Ok(SocksEndpoint {
            host: self.config.listen_host.clone(),
            port: self.config.listen_port,
        })
    }

    /// Terminate the forwarding process and wait for it. Always returns to
    /// `Idle`; a child that outlives the grace period is killed.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            self.state = ProxyState::Idle;
            return;
        };
        self.state = ProxyState::Stopping;
        info!("stopping internal proxy");

        if let Err(e) = child.start_kill() {
            warn!(error = %e, "could not signal internal proxy");
        }
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
            warn!("internal proxy did not exit within grace period");
        }

        self.seeds_file = None;
        self.state = ProxyState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(binary: &str) -> InternalProxyManager {
        InternalProxyManager::new(ProxyManagerConfig {
            binary: PathBuf::from(binary),
            startup_wait: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_empty_seeds_rejected() {
        let mut mgr = manager("true");
        assert!(mgr.start(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_transitions_to_failed() {
        let mut mgr = manager("/nonexistent/xray-knife");
        let result = mgr.start(&["vless://a@h:443".to_string()]).await;
        assert!(result.is_err());
        assert_eq!(mgr.state(), ProxyState::Failed);
    }

    #[tokio::test]
    async fn test_early_exit_transitions_to_failed() {
        // `true` accepts any arguments and exits immediately, which the
        // manager must read as a failed bind
        let mut mgr = manager("true");
        let result = mgr.start(&["vless://a@h:443".to_string()]).await;
        assert!(result.is_err());
        assert_eq!(mgr.state(), ProxyState::Failed);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_idle() {
        let mut mgr = manager("true");
        mgr.stop().await;
        assert_eq!(mgr.state(), ProxyState::Idle);
    }

    #[tokio::test]
    async fn test_stop_after_failed_returns_to_idle() {
        let mut mgr = manager("/nonexistent/xray-knife");
        let _ = mgr.start(&["vless://a@h:443".to_string()]).await;
        mgr.stop().await;
        assert_eq!(mgr.state(), ProxyState::Idle);
    }

    #[test]
    fn test_socks_endpoint_url() {
        let endpoint = SocksEndpoint {
            host: "127.0.0.1".to_string(),
            port: 2080,
        };
        assert_eq!(endpoint.url(), "socks5://127.0.0.1:2080");
    }
}
