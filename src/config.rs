//! Runtime configuration: TOML file, validated before the pipeline runs
//!
//! Every tunable is fixed for the duration of a run. Validation failures are
//! fatal at startup, before any stage executes.

use crate::Result;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::curator::models::SelectorMode;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub tester: TesterSection,
    #[serde(default)]
    pub speed_test: SpeedTestConfig,
    #[serde(default)]
    pub internal_proxy: InternalProxyConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_servers_per_location: i64,
    pub retest_window_hours: i64,
    pub max_retries: i64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("curator.db"),
            max_servers_per_location: 5,
            retest_window_hours: 12,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Chat group identifiers to harvest
    pub groups: Vec<String>,
    /// Messages fetched per source per run
    pub fetch_limit: usize,
    /// Directory of exported chat dumps, one `<group>.json` per source
    pub dump_dir: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            fetch_limit: 200,
            dump_dir: PathBuf::from("messages"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TesterSection {
    /// Tester binary name or path; resolved against PATH at startup
    pub path: PathBuf,
    pub extra_args: Vec<String>,
    pub concurrency: usize,
    pub chunk_size: usize,
    pub timeout_secs: u64,
}

impl Default for TesterSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("xray-knife"),
            extra_args: Vec::new(),
            concurrency: 4,
            chunk_size: 25,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeedTestConfig {
    pub enabled: bool,
    pub max_candidates_per_location: i64,
    /// Hard filter on the publish set when set
    pub min_download_mbps: Option<f64>,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_candidates_per_location: 3,
            min_download_mbps: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InternalProxyConfig {
    pub enabled: bool,
    pub selector: SelectorMode,
    pub max_links: usize,
    pub listen_host: String,
    pub listen_port: u16,
    pub extra_args: Vec<String>,
}

impl Default for InternalProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            selector: SelectorMode::SpeedPassed,
            max_links: 3,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 2080,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PublisherConfig {
    pub enabled: bool,
    pub owner: String,
    pub repo: String,
    pub file_path: String,
    pub commit_message: String,
    /// Falls back to the GITHUB_TOKEN environment variable when empty
    pub token: String,
    /// Base64-encode the blob before hand-off
    pub upload_base64: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation: anything wrong here aborts before the pipeline
    /// touches the store.
    pub fn validate(&self) -> Result<()> {
        if self.database.max_servers_per_location <= 0 {
            bail!("database.max_servers_per_location must be positive");
        }
        if self.database.max_retries <= 0 {
            bail!("database.max_retries must be positive");
        }
        if self.database.retest_window_hours < 0 {
            bail!("database.retest_window_hours must not be negative");
        }
        if self.tester.concurrency == 0 {
            bail!("tester.concurrency must be positive");
        }
        if self.speed_test.enabled && self.speed_test.max_candidates_per_location <= 0 {
            bail!("speed_test.max_candidates_per_location must be positive");
        }
        if self.internal_proxy.enabled && self.internal_proxy.max_links == 0 {
            bail!("internal_proxy.max_links must be positive");
        }

        if resolve_binary(&self.tester.path).is_none() {
            bail!(
                "tester binary not found or not executable: {}",
                self.tester.path.display()
            );
        }

        if self.publisher.enabled {
            let token_available =
                !self.publisher.token.is_empty() || std::env::var("GITHUB_TOKEN").is_ok();
            if !token_available {
                bail!("publisher enabled but no token configured and GITHUB_TOKEN unset");
            }
            if self.publisher.token.starts_with("YOUR_") {
                bail!("publisher.token still holds the placeholder value");
            }
            if self.publisher.owner.is_empty() || self.publisher.repo.is_empty() {
                bail!("publisher.owner and publisher.repo are required when enabled");
            }
            if self.publisher.file_path.is_empty() {
                bail!("publisher.file_path is required when enabled");
            }
        }
        Ok(())
    }
}

/// Resolve a binary the way a shell would: absolute/relative paths as given,
/// bare names against PATH.
pub fn resolve_binary(name: &Path) -> Option<PathBuf> {
    if name.components().count() > 1 {
        return is_executable(name).then(|| name.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            tester: TesterSection {
                // Present and executable everywhere the tests run
                path: PathBuf::from("sh"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_tester_binary_is_fatal() {
        let mut config = valid_config();
        config.tester.path = PathBuf::from("definitely-not-a-real-binary-1f9a");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nonpositive_cap_is_fatal() {
        let mut config = valid_config();
        config.database.max_servers_per_location = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publisher_placeholder_token_is_fatal() {
        let mut config = valid_config();
        config.publisher.enabled = true;
        config.publisher.owner = "me".into();
        config.publisher.repo = "subs".into();
        config.publisher.file_path = "sub.txt".into();
        config.publisher.token = "YOUR_GITHUB_PERSONAL_ACCESS_TOKEN".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            [database]
            path = "servers.db"
            max_servers_per_location = 4

            [sources]
            groups = ["group_one", "group_two"]

            [tester]
            path = "sh"
            concurrency = 8

            [speed_test]
            enabled = true
            max_candidates_per_location = 2
            min_download_mbps = 5.0

            [internal_proxy]
            enabled = true
            selector = "latency_passed"
            max_links = 2
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.database.max_servers_per_location, 4);
        assert_eq!(config.sources.groups.len(), 2);
        assert_eq!(config.tester.concurrency, 8);
        assert_eq!(config.speed_test.min_download_mbps, Some(5.0));
        assert_eq!(config.internal_proxy.selector, SelectorMode::LatencyPassed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_binary_on_path() {
        assert!(resolve_binary(Path::new("sh")).is_some());
        assert!(resolve_binary(Path::new("no-such-binary-9c2e")).is_none());
    }
}
