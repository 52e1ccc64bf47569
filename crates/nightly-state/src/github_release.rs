//! GitHub Releases backend for the release channel.
//!
//! Uploads go to an existing release looked up by tag. A same-named asset is
//! deleted before the new one is uploaded, which gives the channel its
//! overwrite semantics.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::*;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_UPLOAD_BASE: &str = "https://uploads.github.com";
const USER_AGENT: &str = concat!("nightly-pipeline/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct GithubRelease {
    id: u64,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    id: u64,
    name: String,
}

/// Release channel backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubReleaseChannel {
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    owner: String,
    repo: String,
}

impl GithubReleaseChannel {
    /// Create a channel for `owner/repo`.
    pub fn new(repository: &str) -> StorageResult<Self> {
        let (owner, repo) = parse_repository(repository)?;
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            owner,
            repo,
        })
    }

    /// Point the channel at a different API host (GitHub Enterprise).
    pub fn with_endpoints(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    fn authed(&self, builder: RequestBuilder, token: &SecretToken) -> RequestBuilder {
        builder
            .bearer_auth(token.expose())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn release_by_tag(&self, tag: &str, token: &SecretToken) -> StorageResult<GithubRelease> {
        let url = format!(
            "{}/repos/{}/{}/releases/tags/{}",
            self.api_base, self.owner, self.repo, tag
        );
        let response = self.authed(self.client.get(&url), token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::ReleaseNotFound {
                tag: tag.to_string(),
            });
        }
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn delete_asset(&self, asset_id: u64, token: &SecretToken) -> Result<(), String> {
        let url = format!(
            "{}/repos/{}/{}/releases/assets/{}",
            self.api_base, self.owner, self.repo, asset_id
        );
        let response = self
            .authed(self.client.delete(&url), token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(format!("delete of existing asset failed: {}", response.status()))
        }
    }

    async fn upload_asset(
        &self,
        release_id: u64,
        asset: &ReleaseAsset,
        token: &SecretToken,
    ) -> Result<(), String> {
        let body = tokio::fs::read(&asset.path)
            .await
            .map_err(|e| format!("read {}: {e}", asset.path.display()))?;
        let url = format!(
            "{}/repos/{}/{}/releases/{}/assets",
            self.upload_base, self.owner, self.repo, release_id
        );
        let response = self
            .authed(self.client.post(&url), token)
            .query(&[("name", asset.name.as_str())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(format!("upload failed: {status}: {text}"))
        }
    }
}

#[async_trait]
impl ReleaseChannel for GithubReleaseChannel {
    async fn publish(
        &self,
        tag: &str,
        assets: &[ReleaseAsset],
        token: &SecretToken,
    ) -> StorageResult<PublishReport> {
        let release = self.release_by_tag(tag, token).await?;
        let mut uploads = Vec::with_capacity(assets.len());

        for asset in assets {
            if let Some(existing) = release.assets.iter().find(|a| a.name == asset.name) {
                debug!(asset = %asset.name, id = existing.id, "replacing existing asset");
                if let Err(e) = self.delete_asset(existing.id, token).await {
                    uploads.push(UploadOutcome::failed(&asset.name, e));
                    continue;
                }
            }
            match self.upload_asset(release.id, asset, token).await {
                Ok(()) => {
                    info!(tag = %tag, asset = %asset.name, "asset uploaded");
                    uploads.push(UploadOutcome::ok(&asset.name));
                }
                Err(e) => uploads.push(UploadOutcome::failed(&asset.name, e)),
            }
        }

        Ok(PublishReport {
            tag: tag.to_string(),
            uploads,
        })
    }

    async fn list_assets(&self, tag: &str, token: &SecretToken) -> StorageResult<Vec<String>> {
        let release = self.release_by_tag(tag, token).await?;
        Ok(release.assets.into_iter().map(|a| a.name).collect())
    }
}

fn parse_repository(repository: &str) -> StorageResult<(String, String)> {
    match repository.trim().split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(StorageError::Backend(format!(
            "repository must be owner/name, got '{repository}'"
        ))),
    }
}
