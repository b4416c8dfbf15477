//! GitHub content host
//!
//! Implements [`ContentHost`] on top of octocrab for REST API calls and
//! reqwest for raw files, release assets and the curated data lists. All
//! API calls are paced by a token bucket.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use octocrab::Octocrab;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::critical::CriticalEntry;
use crate::error::{Error, Result};
use crate::host::{
    ContentHost, IndexEntry, RateStatus, Release, ReleaseAsset, RemoteRepository, TreeEntry,
};
use crate::ratelimit::TokenBucket;
use crate::registry::RemovedRepository;
use crate::repository::category::Category;

const USER_AGENT: &str = concat!("repokeeper/", env!("CARGO_PKG_VERSION"));

/// GitHub client wrapper with authentication management
pub struct GitHubClient {
    client: Octocrab,
    http: reqwest::Client,
    raw_url: String,
    web_url: String,
    data_url: String,
    auth_strategy: AuthStrategy,
    limiter: Mutex<TokenBucket>,
    /// ETags of curated lists, keyed by URL
    etags: std::sync::Mutex<HashMap<String, String>>,
}

/// GitHub authentication strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
    /// Unauthenticated, with the much lower anonymous quota
    Anonymous,
}

// ===== REST payloads =====

#[derive(Debug, Deserialize)]
struct ApiRepository {
    id: u64,
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    pushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    download_count: u64,
}

#[derive(Debug, Deserialize)]
struct ApiRelease {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<ApiAsset>,
}

#[derive(Debug, Deserialize)]
struct ApiTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ApiTree {
    tree: Vec<ApiTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiRate {
    limit: u32,
    remaining: u32,
    reset: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResources {
    core: ApiRate,
}

#[derive(Debug, Deserialize)]
struct ApiRateLimit {
    resources: ApiResources,
}

#[derive(Serialize)]
struct PageParams {
    per_page: usize,
}

#[derive(Serialize)]
struct TreeParams {
    recursive: u8,
}

impl From<ApiRepository> for RemoteRepository {
    fn from(repo: ApiRepository) -> Self {
        Self {
            id: repo.id,
            full_name: repo.full_name,
            description: repo.description,
            default_branch: repo.default_branch,
            archived: repo.archived,
            topics: repo.topics,
            stargazers_count: repo.stargazers_count,
            pushed_at: repo.pushed_at,
        }
    }
}

impl From<ApiRelease> for Release {
    fn from(release: ApiRelease) -> Self {
        Self {
            tag_name: release.tag_name,
            prerelease: release.prerelease,
            draft: release.draft,
            published_at: release.published_at,
            assets: release
                .assets
                .into_iter()
                .map(|asset| ReleaseAsset {
                    name: asset.name,
                    download_url: asset.browser_download_url,
                    download_count: asset.download_count,
                })
                .collect(),
        }
    }
}

impl GitHubClient {
    /// Create a new GitHub client with automatic authentication
    pub fn new(config: &HostConfig) -> anyhow::Result<Self> {
        let (auth_strategy, token) = Self::detect_authentication(config)?;
        info!("Using authentication strategy: {:?}", auth_strategy);
        Self::build(config, auth_strategy, token)
    }

    /// Client with explicit credentials, skipping detection
    pub fn with_token(config: &HostConfig, token: Option<String>) -> anyhow::Result<Self> {
        let strategy = if token.is_some() {
            AuthStrategy::EnvironmentToken
        } else {
            AuthStrategy::Anonymous
        };
        Self::build(config, strategy, token)
    }

    fn build(
        config: &HostConfig,
        auth_strategy: AuthStrategy,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut builder = Octocrab::builder()
            .base_uri(config.api_url.as_str())
            .with_context(|| format!("Invalid API URL: {}", config.api_url))?;
        if let Some(token) = token {
            builder = builder.personal_token(token);
        }
        let client = builder.build().context("Failed to create GitHub client")?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            http,
            raw_url: config.raw_url.trim_end_matches('/').to_string(),
            web_url: config.web_url.trim_end_matches('/').to_string(),
            data_url: config.data_url.trim_end_matches('/').to_string(),
            auth_strategy,
            limiter: Mutex::new(TokenBucket::new(config.burst, config.requests_per_second)),
            etags: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn auth_strategy(&self) -> AuthStrategy {
        self.auth_strategy
    }

    /// Detect and obtain GitHub authentication
    fn detect_authentication(
        config: &HostConfig,
    ) -> anyhow::Result<(AuthStrategy, Option<String>)> {
        match config.auth_method.as_str() {
            "auto" => {
                // Try GitHub CLI first, then environment token
                if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, Some(token)))
                } else if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, Some(token)))
                } else {
                    warn!(
                        "No GitHub authentication found, continuing anonymously. \
                         Run `gh auth login` or set GITHUB_TOKEN for a higher API quota"
                    );
                    Ok((AuthStrategy::Anonymous, None))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, Some(token)))
            }
            "token" => {
                let token = Self::try_environment_token()
                    .context("GITHUB_TOKEN environment variable not found or invalid")?;
                Ok((AuthStrategy::EnvironmentToken, Some(token)))
            }
            "anonymous" => Ok((AuthStrategy::Anonymous, None)),
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> anyhow::Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !Self::is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr)
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> anyhow::Result<String> {
        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !["ghp_", "gho_", "ghs_", "github_pat_"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token");
        }

        Ok(token)
    }

    /// Check if a command is available in PATH
    fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn pace(&self) {
        self.limiter.lock().await.acquire().await;
    }

    async fn api_get<T, P>(&self, route: &str, params: Option<&P>) -> Result<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        self.pace().await;
        debug!("GET {}", route);
        self.client
            .get(route, params)
            .await
            .map_err(|e| map_octocrab_error(route, e))
    }

    /// GET a curated list, honoring ETags
    async fn get_data<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let etag = self
            .etags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(url)
            .cloned();

        let mut request = self.http.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(|e| transport_error(url, e))?;
        let response = check_status(url, response)?;

        if let Some(etag) = response.headers().get(ETAG).and_then(|value| value.to_str().ok()) {
            self.etags
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(url.to_string(), etag.to_string());
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Host(format!("invalid data at {}: {}", url, e)))
    }
}

fn map_octocrab_error(route: &str, err: octocrab::Error) -> Error {
    match err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            let message = source.message.clone();
            match status {
                304 => Error::NotModified,
                401 => Error::Authentication(message),
                403 | 429 if message.to_lowercase().contains("rate limit") => {
                    Error::RateLimited { reset: None }
                }
                404 => Error::NotFound(route.to_string()),
                _ => Error::Host(format!("{} returned {}: {}", route, status, message)),
            }
        }
        other => Error::Host(format!("{}: {}", route, other)),
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(url.to_string())
    } else {
        Error::Host(format!("{}: {}", url, err))
    }
}

fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_MODIFIED => Err(Error::NotModified),
        StatusCode::NOT_FOUND => Err(Error::NotFound(url.to_string())),
        StatusCode::UNAUTHORIZED => Err(Error::Authentication(url.to_string())),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
            if response
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|value| value == "0") =>
        {
            let reset = response
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<i64>().ok())
                .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
            Err(Error::RateLimited { reset })
        }
        status => Err(Error::Host(format!("{} returned {}", url, status))),
    }
}

/// Entries of a category index, either an id-keyed object or a list
fn index_entries(data: Value) -> Vec<IndexEntry> {
    match data {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(id, value)| {
                let mut entry = IndexEntry::from_value(value)?;
                entry.data.entry("id").or_insert(Value::String(id));
                Some(entry)
            })
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(full_name) => Some(IndexEntry::new(full_name)),
                other => IndexEntry::from_value(other),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl ContentHost for GitHubClient {
    async fn get_repository(&self, full_name: &str) -> Result<RemoteRepository> {
        let repo: ApiRepository = self
            .api_get(&format!("/repos/{}", full_name), None::<&()>)
            .await?;
        Ok(repo.into())
    }

    async fn list_releases(
        &self,
        full_name: &str,
        include_prereleases: bool,
        limit: usize,
    ) -> Result<Vec<Release>> {
        let params = PageParams {
            per_page: limit.clamp(1, 100),
        };
        let releases: Vec<ApiRelease> = self
            .api_get(&format!("/repos/{}/releases", full_name), Some(&params))
            .await?;
        Ok(releases
            .into_iter()
            .filter(|release| include_prereleases || !release.prerelease)
            .map(Release::from)
            .collect())
    }

    async fn get_tree(&self, full_name: &str, git_ref: &str) -> Result<Vec<TreeEntry>> {
        let tree: ApiTree = self
            .api_get(
                &format!("/repos/{}/git/trees/{}", full_name, git_ref),
                Some(&TreeParams { recursive: 1 }),
            )
            .await?;
        if tree.truncated {
            warn!("File tree of {}@{} is truncated", full_name, git_ref);
        }
        Ok(tree
            .tree
            .into_iter()
            .map(|entry| TreeEntry {
                is_directory: entry.kind == "tree",
                path: entry.path,
            })
            .collect())
    }

    async fn get_file(&self, full_name: &str, path: &str, git_ref: &str) -> Result<Option<String>> {
        let url = self.file_url(full_name, git_ref, path);
        match self.download(&url).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::Host(format!("{} is not valid UTF-8", url))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn last_commit(&self, full_name: &str, git_ref: &str) -> Result<String> {
        let commit: ApiCommit = self
            .api_get(&format!("/repos/{}/commits/{}", full_name, git_ref), None::<&()>)
            .await?;
        Ok(commit.sha.chars().take(7).collect())
    }

    fn file_url(&self, full_name: &str, git_ref: &str, path: &str) -> String {
        format!("{}/{}/{}/{}", self.raw_url, full_name, git_ref, path)
    }

    fn release_asset_url(&self, full_name: &str, tag: &str, filename: &str) -> String {
        format!("{}/{}/releases/download/{}/{}", self.web_url, full_name, tag, filename)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Downloading {}", url);
        let response = self.http.get(url).send().await.map_err(|e| transport_error(url, e))?;
        let response = check_status(url, response)?;
        let bytes = response.bytes().await.map_err(|e| transport_error(url, e))?;
        Ok(bytes.to_vec())
    }

    async fn rate_limit(&self) -> Result<RateStatus> {
        // Not paced; GitHub does not count this call against the quota
        let status: ApiRateLimit = self
            .client
            .get("/rate_limit", None::<&()>)
            .await
            .map_err(|e| map_octocrab_error("/rate_limit", e))?;
        let core = status.resources.core;
        Ok(RateStatus {
            remaining: core.remaining,
            limit: core.limit,
            reset: Utc.timestamp_opt(core.reset, 0).single(),
        })
    }

    async fn fetch_critical(&self) -> Result<Vec<CriticalEntry>> {
        self.get_data(&format!("{}/critical/data.json", self.data_url)).await
    }

    async fn fetch_removed(&self) -> Result<Vec<RemovedRepository>> {
        self.get_data(&format!("{}/removed/data.json", self.data_url))
            .await
    }

    async fn fetch_default_index(&self, category: Category) -> Result<Vec<IndexEntry>> {
        let data: Value = self
            .get_data(&format!("{}/{}/data.json", self.data_url, category.as_str()))
            .await?;
        Ok(index_entries(data))
    }
}
