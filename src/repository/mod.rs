//! Repository records and their lifecycle
//!
//! - [`Repository`]: the persisted record of one content repository
//! - [`category`]: per-category layout rules and post-change hooks
//! - [`fields`]: static field table used to merge index data into records
//! - [`download`]: download strategy decision and file fetching
//! - [`machine`]: the register/update/install/uninstall state machine

pub mod category;
pub mod download;
pub mod fields;
pub mod machine;

use crate::error::{Error, Result};
use crate::host::{Release, ReleaseAsset, RemoteRepository, TreeEntry};
use crate::version;
use category::Category;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Display state derived from a repository's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepositoryState {
    New,
    Default,
    PendingRestart,
    PendingUpgrade,
    Installed,
}

impl RepositoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryState::New => "new",
            RepositoryState::Default => "default",
            RepositoryState::PendingRestart => "pending-restart",
            RepositoryState::PendingUpgrade => "pending-upgrade",
            RepositoryState::Installed => "installed",
        }
    }
}

/// Whether an install replaced existing content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    FirstInstall,
    Reinstall,
}

/// Optional `hacs.json` content manifest at the repository root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentManifest {
    pub name: Option<String>,
    pub content_in_root: bool,
    pub filename: Option<String>,
    pub zip_release: bool,
    pub persistent_directory: Option<String>,
    pub hide_default_branch: bool,
    pub render_readme: bool,
    /// Country codes the content is limited to
    #[serde(deserialize_with = "one_or_many")]
    pub country: Vec<String>,
    /// Minimum host version
    #[serde(alias = "homeassistant")]
    pub min_host_version: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
        None => Vec::new(),
    })
}

impl ContentManifest {
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let manifest: Self =
            serde_json::from_str(contents)
                .map_err(|e| format!("hacs.json is not valid JSON: {}", e))?;

        if let Some(dir) = &manifest.persistent_directory {
            if !crate::paths::is_relative_inside(dir) {
                return Err(format!(
                    "persistent_directory '{}' in hacs.json must be a relative path \
                     inside the content",
                    dir
                ));
            }
        }
        Ok(manifest)
    }
}

/// Persisted record of one content repository
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    /// Immutable once non-zero
    pub id: u64,
    pub full_name: String,
    pub category: Category,
    pub description: Option<String>,
    pub default_branch: Option<String>,

    pub installed: bool,
    pub installed_version: Option<String>,
    pub installed_commit: Option<String>,
    pub last_version: Option<String>,
    pub last_commit: Option<String>,
    /// Ref pinned by the user
    pub selected_tag: Option<String>,
    pub show_beta: bool,
    pub hide: bool,
    pub new: bool,
    pub archived: bool,
    pub topics: Vec<String>,
    pub published_tags: Vec<String>,

    /// Whether content is distributed through releases
    pub releases: bool,
    /// Newest prerelease tag
    pub prerelease: Option<String>,
    pub stargazers_count: u64,
    pub downloads: u64,
    pub last_updated: Option<String>,
    /// When remote data was last fetched
    pub last_fetched: Option<DateTime<Utc>>,

    /// Integration domain from manifest.json
    pub domain: Option<String>,
    pub manifest_name: Option<String>,
    pub authors: Vec<String>,
    pub config_flow: bool,
    pub first_install: bool,
    pub pending_restart: bool,

    /// Remote directory holding the content, "" for the root
    pub content_path: String,
    /// Main file for single-file content and plugins
    pub file_name: Option<String>,
    pub manifest: ContentManifest,

    #[serde(skip)]
    pub tree: Vec<TreeEntry>,
    #[serde(skip)]
    pub fetched_releases: Vec<Release>,
}

impl Repository {
    pub fn new(full_name: impl Into<String>, category: Category) -> Self {
        Self {
            full_name: full_name.into(),
            category,
            ..Self::default()
        }
    }

    /// Repository name without the owner
    pub fn name(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.full_name)
    }

    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or("")
    }

    /// Registry key
    pub fn key(&self) -> String {
        self.full_name.to_lowercase()
    }

    pub fn display_name(&self) -> &str {
        self.manifest
            .name
            .as_deref()
            .or(self.manifest_name.as_deref())
            .unwrap_or_else(|| self.name())
    }

    pub fn default_ref(&self) -> &str {
        match self.default_branch.as_deref() {
            Some(branch) if !branch.is_empty() => branch,
            _ => version::FALLBACK_BRANCH,
        }
    }

    /// Current display state.
    ///
    /// Restart and upgrade markers only apply to installed content; an
    /// uninstalled repository is `Default` once it is no longer new.
    pub fn state(&self) -> RepositoryState {
        if self.new {
            RepositoryState::New
        } else if !self.installed {
            RepositoryState::Default
        } else if self.pending_restart {
            RepositoryState::PendingRestart
        } else if self.pending_update() {
            RepositoryState::PendingUpgrade
        } else {
            RepositoryState::Installed
        }
    }

    /// Whether the tracked ref has moved past the installed content
    pub fn pending_update(&self) -> bool {
        if !self.installed {
            return false;
        }

        let tracks_branch = match (&self.selected_tag, &self.last_version) {
            (Some(selected), _) => selected == self.default_ref(),
            (None, None) => true,
            (None, Some(_)) => !self.releases,
        };

        if tracks_branch {
            return match (&self.installed_commit, &self.last_commit) {
                (Some(installed), Some(latest)) => installed != latest,
                _ => false,
            };
        }

        let available = self.selected_tag.as_ref().or(self.last_version.as_ref());
        match (&self.installed_version, available) {
            (Some(installed), Some(available)) => installed != available,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Version shown as available: newest tag, or newest commit for branches
    pub fn available_version(&self) -> Option<&str> {
        self.last_version
            .as_deref()
            .or(self.last_commit.as_deref())
    }

    /// Version shown as installed
    pub fn installed_display(&self) -> Option<&str> {
        match self.installed_version.as_deref() {
            Some(version) if version != self.default_ref() => Some(version),
            _ => self
                .installed_commit
                .as_deref()
                .or(self.installed_version.as_deref()),
        }
    }

    /// Ref to fetch content from; may clear `selected_tag`
    pub fn resolve_ref(&mut self) -> String {
        version::resolve_ref(
            self.last_version.as_deref(),
            &mut self.selected_tag,
            &self.published_tags,
            self.default_branch.as_deref(),
        )
    }

    /// Reject an incoming id that differs from a stored non-zero id.
    pub fn check_identity(&self, incoming: u64) -> Result<()> {
        if self.id != 0 && incoming != 0 && self.id != incoming {
            return Err(Error::RepositoryIdChanged {
                full_name: self.full_name.clone(),
                stored: self.id,
                incoming,
            });
        }
        Ok(())
    }

    /// Set the id if unset; identical ids are a no-op.
    pub fn set_id(&mut self, incoming: u64) -> Result<()> {
        self.check_identity(incoming)?;
        if self.id == 0 {
            self.id = incoming;
        }
        Ok(())
    }

    /// Copy remote metadata onto the record.
    ///
    /// The identity check runs first; nothing is changed when it fails.
    pub fn apply_remote(&mut self, remote: &RemoteRepository) -> Result<()> {
        self.set_id(remote.id)?;

        if !remote.full_name.is_empty() && remote.full_name != self.full_name {
            if !remote.full_name.eq_ignore_ascii_case(&self.full_name) {
                info!(
                    "Repository {} was renamed to {}",
                    self.full_name, remote.full_name
                );
            }
            self.full_name = remote.full_name.clone();
        }

        self.description = remote.description.clone();
        self.default_branch = remote.default_branch.clone();
        self.archived = remote.archived;
        self.topics = fields::filter_topics(&remote.topics);
        self.stargazers_count = remote.stargazers_count;
        self.last_updated = remote.pushed_at.map(|at| at.to_rfc3339());
        Ok(())
    }

    /// Derive versions and published tags from a release listing (newest first)
    pub fn apply_releases(&mut self, releases: Vec<Release>) {
        let published: Vec<&Release> = releases.iter().filter(|r| !r.draft).collect();

        self.last_version = published
            .iter()
            .find(|r| !r.prerelease)
            .map(|r| r.tag_name.clone());
        self.prerelease = published
            .iter()
            .find(|r| r.prerelease)
            .map(|r| r.tag_name.clone());
        self.published_tags = published
            .iter()
            .filter(|r| self.show_beta || !r.prerelease)
            .map(|r| r.tag_name.clone())
            .collect();
        self.releases = !self.published_tags.is_empty();
        self.downloads = published
            .first()
            .map(|r| r.assets.iter().map(|a| a.download_count).sum())
            .unwrap_or(0);

        if self.show_beta {
            if let (Some(pre), Some(last)) = (&self.prerelease, &self.last_version) {
                if version::is_newer(pre, last).unwrap_or(false) {
                    self.last_version = Some(pre.clone());
                }
            }
        }

        if let Some(selected) = &self.selected_tag {
            if *selected != self.default_ref() && !self.published_tags.contains(selected) {
                warn!(
                    "Selected tag {} is no longer published for {}",
                    selected, self.full_name
                );
            }
        }

        self.fetched_releases = releases;
    }

    /// Assets of the release currently targeted
    pub fn release_assets(&self) -> &[ReleaseAsset] {
        let target = self.selected_tag.as_ref().or(self.last_version.as_ref());
        target
            .and_then(|tag| self.fetched_releases.iter().find(|r| &r.tag_name == tag))
            .map(|r| r.assets.as_slice())
            .unwrap_or(&[])
    }

    /// Assets of a specific release tag
    pub fn assets_for(&self, tag: &str) -> &[ReleaseAsset] {
        self.fetched_releases
            .iter()
            .find(|r| r.tag_name == tag)
            .map(|r| r.assets.as_slice())
            .unwrap_or(&[])
    }
}
