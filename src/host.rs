//! Content host abstraction layer
//!
//! This module provides a provider-agnostic interface to the remote host that
//! stores repositories: metadata, releases, file trees, raw file contents,
//! quota status and the curated critical/removed/default lists.

use crate::critical::CriticalEntry;
use crate::error::Result;
use crate::registry::RemovedRepository;
use crate::repository::category::Category;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Repository metadata as reported by the remote host
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteRepository {
    /// Numeric id, stable across renames
    pub id: u64,

    /// Owner and name (e.g., "acme/widget")
    pub full_name: String,

    pub description: Option<String>,

    /// Default branch name
    pub default_branch: Option<String>,

    pub archived: bool,

    pub topics: Vec<String>,

    pub stargazers_count: u64,

    /// Time of the most recent push
    pub pushed_at: Option<DateTime<Utc>>,
}

/// A downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
    #[serde(default)]
    pub download_count: u64,
}

/// A published release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// One entry of a recursive file tree listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the repository root, '/' separated
    pub path: String,
    pub is_directory: bool,
}

impl TreeEntry {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: true,
        }
    }

    /// Last path component
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Parent directory, "" for root entries
    pub fn parent(&self) -> &str {
        self.path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
    }
}

/// One repository of a curated default index, with whatever metadata the
/// index carries for it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexEntry {
    pub full_name: String,
    pub data: Map<String, Value>,
}

impl IndexEntry {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            data: Map::new(),
        }
    }

    /// Build from an index object; `None` without a usable `full_name`
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(data) = value else {
            return None;
        };
        let full_name = data.get("full_name")?.as_str()?.to_string();
        if !full_name.contains('/') {
            return None;
        }
        Some(Self { full_name, data })
    }
}

/// Remote API quota
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateStatus {
    pub remaining: u32,
    pub limit: u32,
    pub reset: Option<DateTime<Utc>>,
}

/// Capabilities consumed from the remote content host.
///
/// Errors use the crate error type: `NotFound` for missing repositories, refs
/// or files, `RateLimited`/`Authentication` for quota failures and
/// `NotModified` when a curated list has not changed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentHost: Send + Sync {
    async fn get_repository(&self, full_name: &str) -> Result<RemoteRepository>;

    /// Newest first. Drafts are included; callers filter them.
    async fn list_releases(
        &self,
        full_name: &str,
        include_prereleases: bool,
        limit: usize,
    ) -> Result<Vec<Release>>;

    /// Recursive file tree at a ref
    async fn get_tree(&self, full_name: &str, git_ref: &str) -> Result<Vec<TreeEntry>>;

    /// Text contents of a file, `None` if it does not exist at that ref
    async fn get_file(&self, full_name: &str, path: &str, git_ref: &str) -> Result<Option<String>>;

    /// Short hash of the newest commit on a ref
    async fn last_commit(&self, full_name: &str, git_ref: &str) -> Result<String>;

    /// URL serving the raw bytes of a file at a ref
    fn file_url(&self, full_name: &str, git_ref: &str, path: &str) -> String;

    /// URL of a named release asset
    fn release_asset_url(&self, full_name: &str, tag: &str, filename: &str) -> String;

    /// Fetch raw bytes. A single attempt; callers apply timeouts and retries.
    async fn download(&self, url: &str) -> Result<Vec<u8>>;

    async fn rate_limit(&self) -> Result<RateStatus>;

    /// Repositories flagged for forced removal
    async fn fetch_critical(&self) -> Result<Vec<CriticalEntry>>;

    /// Repositories withdrawn from the default index
    async fn fetch_removed(&self) -> Result<Vec<RemovedRepository>>;

    /// Curated default index for a category
    async fn fetch_default_index(&self, category: Category) -> Result<Vec<IndexEntry>>;
}
