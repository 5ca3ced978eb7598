//! Publisher boundary: delivers the curated subscription blob
//!
//! The pipeline's obligation ends at producing the blob; this module carries
//! it to a GitHub repository through the contents API (create-or-update with
//! the existing file's sha).

use crate::config::PublisherConfig;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, content: &str) -> Result<()>;
}

/// Publisher used when publishing is disabled; the blob goes nowhere.
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, _content: &str) -> Result<()> {
        info!("publishing disabled, blob discarded");
        Ok(())
    }
}

#[derive(Deserialize)]
struct ContentsResponse {
    sha: String,
}

pub struct GithubPublisher {
    config: PublisherConfig,
    client: reqwest::Client,
}

impl GithubPublisher {
    pub fn new(config: PublisherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("proxy-curator")
            .build()?;
        Ok(Self { config, client })
    }

    fn token(&self) -> String {
        if !self.config.token.is_empty() {
            self.config.token.clone()
        } else {
            std::env::var("GITHUB_TOKEN").unwrap_or_default()
        }
    }

    fn contents_url(&self) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/contents/{}",
            self.config.owner, self.config.repo, self.config.file_path
        )
    }

    /// Sha of the existing file, or None when it does not exist yet.
    async fn existing_sha(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.contents_url())
            .bearer_auth(self.token())
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().context("fetching current file")?;
        let body: ContentsResponse = response.json().await?;
        Ok(Some(body.sha))
    }
}

#[async_trait]
impl Publisher for GithubPublisher {
    async fn publish(&self, content: &str) -> Result<()> {
        let sha = self.existing_sha().await?;

        // The contents API requires base64 regardless of the blob's own
        // encoding
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let mut body = json!({
            "message": self.config.commit_message,
            "content": encoded,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }

        self.client
            .put(self.contents_url())
            .bearer_auth(self.token())
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("updating subscription file")?;

        info!(
            repo = format!("{}/{}", self.config.owner, self.config.repo),
            path = %self.config.file_path,
            "subscription published"
        );
        Ok(())
    }
}

/// Assemble the hand-off blob from renamed URIs.
pub fn subscription_blob(uris: &[String], as_base64: bool) -> String {
    let joined = uris.join("\n");
    if as_base64 {
        base64::engine::general_purpose::STANDARD.encode(joined)
    } else {
        joined
    }
}
