//! GitHub REST reader for manifest repositories.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use portal_core::{ManifestError, ManifestResult, RepoRef, RepoSnapshot};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::{build_snapshot, RawFile, RepositoryReader};

const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw+json";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_base_url: String,
    pub token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub config_file_name: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            token: None,
            user_agent: "portal-manifest-sync/0.1".to_string(),
            timeout: Duration::from_secs(20),
            config_file_name: "config.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
}

/// Maps a non-success GitHub answer onto the manifest error taxonomy.
pub fn classify_failure(
    status: StatusCode,
    ratelimit_remaining: Option<&str>,
    body: &str,
    url: &str,
) -> ManifestError {
    let rate_limited_body = body.to_ascii_lowercase().contains("rate limit");
    match status {
        StatusCode::NOT_FOUND => {
            ManifestError::NotFound(format!("repository or content not found: {url}"))
        }
        StatusCode::UNAUTHORIZED => {
            ManifestError::AuthFailed("invalid or expired credentials".to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => {
            ManifestError::RateLimited("rate limit exceeded, try again later".to_string())
        }
        StatusCode::FORBIDDEN if ratelimit_remaining == Some("0") || rate_limited_body => {
            ManifestError::RateLimited("rate limit exceeded, try again later".to_string())
        }
        StatusCode::FORBIDDEN => ManifestError::PermissionDenied(format!(
            "request refused by GitHub: {}",
            body.chars().take(200).collect::<String>()
        )),
        other => ManifestError::Internal(anyhow!("http status {other} for {url}")),
    }
}

fn csv_entries(listing: Vec<ContentEntry>) -> Vec<ContentEntry> {
    let mut entries: Vec<_> = listing
        .into_iter()
        .filter(|e| e.kind == "file" && e.path.ends_with(".csv"))
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

#[derive(Debug)]
pub struct GitHubReader {
    client: reqwest::Client,
    config: GitHubConfig,
}

impl GitHubReader {
    pub fn new(config: GitHubConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn api_url(&self, repo: &RepoRef, tail: &[&str]) -> ManifestResult<Url> {
        let mut url = Url::parse(&self.config.api_base_url)
            .with_context(|| format!("parsing api base url {}", self.config.api_base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url cannot be a base: {}", self.config.api_base_url))?
            .pop_if_empty()
            .extend(["repos", repo.owner.as_str(), repo.repo.as_str()])
            .extend(tail);
        Ok(url)
    }

    async fn get(&self, url: Url, accept: &str) -> ManifestResult<reqwest::Response> {
        let mut request = self
            .client
            .get(url.clone())
            .header(ACCEPT, accept)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.config.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        debug!(%url, "github request");
        let resp = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, remaining.as_deref(), &body, url.as_str()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> ManifestResult<T> {
        let resp = self.get(url.clone(), JSON_MEDIA_TYPE).await?;
        let value = resp
            .json::<T>()
            .await
            .with_context(|| format!("decoding json from {url}"))?;
        Ok(value)
    }

    async fn get_raw(&self, url: Url) -> ManifestResult<Vec<u8>> {
        let resp = self.get(url.clone(), RAW_MEDIA_TYPE).await?;
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("reading body from {url}"))?;
        Ok(bytes.to_vec())
    }

    async fn latest_commit(&self, repo: &RepoRef, path: &str) -> ManifestResult<String> {
        let mut url = self.api_url(repo, &["commits"])?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("per_page", "1");
        let commits: Vec<CommitEntry> = self.get_json(url).await?;
        commits
            .into_iter()
            .next()
            .map(|c| c.sha)
            .ok_or_else(|| ManifestError::NotFound(format!("no commits touch {path}")))
    }

    async fn raw_file(&self, repo: &RepoRef, name: &str, path: &str) -> ManifestResult<RawFile> {
        let bytes = self.get_raw(self.api_url(repo, &["contents", path])?).await?;
        let commit_hash = self.latest_commit(repo, path).await?;
        Ok(RawFile {
            name: name.to_string(),
            bytes,
            commit_hash,
        })
    }
}

#[async_trait]
impl RepositoryReader for GitHubReader {
    async fn fetch_snapshot(&self, repo: &RepoRef) -> ManifestResult<RepoSnapshot> {
        let span = info_span!("github_fetch", repo = %repo.full_name());
        async {
            let _repo: JsonValue = self.get_json(self.api_url(repo, &[])?).await?;

            let config_name = self.config.config_file_name.as_str();
            let config = self.raw_file(repo, config_name, config_name).await?;

            let listing: Vec<ContentEntry> =
                self.get_json(self.api_url(repo, &["contents"])?).await?;
            let mut csv_files = Vec::new();
            for entry in csv_entries(listing) {
                csv_files.push(self.raw_file(repo, &entry.name, &entry.path).await?);
            }
            debug!(files = csv_files.len(), "fetched repository files");

            build_snapshot(config, csv_files)
        }
        .instrument(span)
        .await
    }
}
