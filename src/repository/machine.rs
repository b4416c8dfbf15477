//! Repository State Machine - register, update, install and uninstall
//!
//! Operations take the record by `&mut` and only write to it once the
//! operation has succeeded, so a failed call leaves the caller's record as it
//! was. Exclusive access per repository is the caller's job; the state
//! machine holds no locks.

use super::category::{Category, IntegrationManifest, PostAction};
use super::download::{self, Downloader};
use super::{ContentManifest, InstallOutcome, Repository};
use crate::backup::BackupManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, RepositoryEvent};
use crate::host::{ContentHost, TreeEntry};
use crate::paths;
use crate::registry::RemovedRepository;
use crate::version;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RepositoryStateMachine {
    host: Arc<dyn ContentHost>,
    config: Arc<Config>,
    events: EventBus,
    downloader: Downloader,
}

impl RepositoryStateMachine {
    pub fn new(host: Arc<dyn ContentHost>, config: Arc<Config>, events: EventBus) -> Self {
        let downloader = Downloader::new(host.clone(), &config.download, events.clone());
        Self {
            host,
            config,
            events,
            downloader,
        }
    }

    /// Validate a repository and fill in everything known about it.
    ///
    /// Structural problems are collected and returned together as
    /// `ValidationFailed`. On success the record is marked new.
    pub async fn register(
        &self,
        repository: &mut Repository,
        removed: Option<&RemovedRepository>,
    ) -> Result<()> {
        let full_name = repository.full_name.clone();
        info!("Registering {} ({})", full_name, repository.category);

        if removed.is_some_and(RemovedRepository::blocks_registration) {
            return Err(Error::ArchivedOrBlacklisted {
                full_name,
                reason: "Repository has been requested to be removed.".to_string(),
            });
        }

        let remote = self.host.get_repository(&full_name).await?;
        if remote.archived {
            return Err(Error::ArchivedOrBlacklisted {
                full_name,
                reason: "Repository is archived.".to_string(),
            });
        }

        let mut candidate = repository.clone();
        candidate.apply_remote(&remote)?;

        let reasons = self.refresh(&mut candidate).await?;
        if !reasons.is_empty() {
            for reason in &reasons {
                warn!("{}: {}", full_name, reason);
            }
            return Err(Error::ValidationFailed { full_name, reasons });
        }

        candidate.new = true;
        *repository = candidate;

        self.events.emit(RepositoryEvent::Registered {
            id: repository.id,
            full_name: repository.full_name.clone(),
        });
        self.state_changed(repository);
        Ok(())
    }

    /// Refresh remote metadata and candidate versions. Local files are never
    /// touched.
    ///
    /// Without `force`, a repository with nothing pushed since the last fetch
    /// only has its metadata refreshed. Returns whether contents were
    /// re-read.
    pub async fn update(&self, repository: &mut Repository, force: bool) -> Result<bool> {
        let remote = self.host.get_repository(&repository.full_name).await?;

        let mut candidate = repository.clone();
        candidate.apply_remote(&remote)?;

        let unchanged = candidate.last_updated.is_some()
            && candidate.last_updated == repository.last_updated
            && !repository.tree.is_empty();
        if unchanged && !force {
            debug!("{} has not changed since the last fetch", candidate.full_name);
            *repository = candidate;
            return Ok(false);
        }

        let reasons = self.refresh(&mut candidate).await?;
        if !reasons.is_empty() {
            return Err(Error::ValidationFailed {
                full_name: candidate.full_name,
                reasons,
            });
        }

        let state_before = repository.state();
        *repository = candidate;

        self.events.emit(RepositoryEvent::Updated {
            id: repository.id,
            full_name: repository.full_name.clone(),
        });
        if repository.state() != state_before {
            self.state_changed(repository);
        }
        Ok(true)
    }

    /// Install the content at `version`, or at the resolved ref.
    ///
    /// Existing content is moved to a snapshot first and put back if the
    /// write fails.
    pub async fn install(
        &self,
        repository: &mut Repository,
        version: Option<&str>,
    ) -> Result<InstallOutcome> {
        let category = repository.category;
        category.before_install(repository)?;

        if let (Some(required), Some(current)) = (
            repository.manifest.min_host_version.as_deref(),
            self.config.host_version.as_deref(),
        ) {
            if !version::satisfies_minimum(current, required) {
                return Err(Error::Incompatible {
                    full_name: repository.full_name.clone(),
                    required: required.to_string(),
                    current: current.to_string(),
                });
            }
        }

        let mut candidate = repository.clone();
        let git_ref = match version {
            // An explicit ref is installed as given; an unknown one fails in `prepare`
            Some(version) => {
                candidate.selected_tag = (candidate.last_version.as_deref() != Some(version))
                    .then(|| version.to_string());
                version.to_string()
            }
            None => candidate.resolve_ref(),
        };
        self.prepare(&mut candidate, &git_ref).await?;
        info!("Installing {} at {}", candidate.full_name, git_ref);

        let outcome = if candidate.installed {
            InstallOutcome::Reinstall
        } else {
            InstallOutcome::FirstInstall
        };

        let config_root = self.config.config_root_path();
        let protected = self.config.protected_roots();
        let local = category.local_path(&config_root, &candidate);
        let target = category.install_target(&config_root, &candidate);
        let scratch = self
            .config
            .backup_root()
            .join(category.as_str())
            .join(candidate.name());

        let base = category.base_directory(&config_root);
        if !paths::is_within(&base, &target) {
            error!(
                "Refusing to install {}: {} is outside {}",
                candidate.full_name,
                target.display(),
                base.display()
            );
            return Err(Error::ProtectedPath(target));
        }

        let persistent_dir = candidate
            .manifest
            .persistent_directory
            .as_ref()
            .map(|dir| local.join(dir));
        if let Some(dir) = &persistent_dir {
            if !paths::is_within(&local, dir) {
                error!(
                    "Refusing to install {}: persistent directory {} is outside {}",
                    candidate.full_name,
                    dir.display(),
                    local.display()
                );
                return Err(Error::ProtectedPath(dir.clone()));
            }
        }
        let persistent = persistent_dir
            .map(|dir| BackupManager::new(dir, &scratch.join("persistent"), protected.clone()));
        if let Some(persistent) = &persistent {
            persistent.create_async().await?;
        }

        let backup = BackupManager::new(&target, &scratch, protected);
        if let Err(e) = backup.create_async().await {
            if let Some(persistent) = &persistent {
                restore_and_cleanup(persistent).await;
            }
            return Err(e);
        }

        let written = match download::plan(self.host.as_ref(), &candidate, &git_ref) {
            Ok(strategy) => self.downloader.run(&candidate, strategy, &local).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            error!("Install of {} failed: {}", candidate.full_name, e);
            if backup.has_snapshot() {
                restore_and_cleanup(&backup).await;
            } else if paths::is_safe(&self.config.protected_roots(), &target) {
                // Nothing to roll back to; drop the partial write
                let partial = target.clone();
                let removed = paths::blocking(move || {
                    paths::remove_path(&partial)
                        .map_err(|e| Error::io(format!("remove {}", partial.display()), e))
                })
                .await;
                if let Err(e) = removed {
                    warn!("Could not remove partial install of {}: {}", candidate.full_name, e);
                }
            }
            if let Some(persistent) = &persistent {
                restore_and_cleanup(persistent).await;
            }
            return Err(match e {
                Error::DownloadFailed { .. } => e,
                other => Error::DownloadFailed {
                    full_name: candidate.full_name.clone(),
                    reason: other.to_string(),
                },
            });
        }

        if let Err(e) = backup.cleanup_async().await {
            warn!("Could not remove backup for {}: {}", candidate.full_name, e);
        }
        if let Some(persistent) = &persistent {
            restore_and_cleanup(persistent).await;
        }

        candidate.installed = true;
        candidate.installed_version = if git_ref == candidate.default_ref() {
            None
        } else {
            Some(git_ref)
        };
        candidate.installed_commit = candidate.last_commit.clone();
        candidate.new = false;
        candidate.first_install = outcome == InstallOutcome::FirstInstall;
        let action = category.after_install(&mut candidate, outcome);

        *repository = candidate;
        info!(
            "Installed {} ({})",
            repository.full_name,
            repository.installed_display().unwrap_or("unknown version")
        );

        self.events.emit(RepositoryEvent::Installed {
            id: repository.id,
            full_name: repository.full_name.clone(),
            outcome,
        });
        self.announce(repository, action);
        self.state_changed(repository);
        Ok(outcome)
    }

    /// Remove installed content. Protected roots are never removed.
    pub async fn uninstall(&self, repository: &mut Repository) -> Result<()> {
        let category = repository.category;
        let config_root = self.config.config_root_path();
        let target = category.install_target(&config_root, repository);

        let base = category.base_directory(&config_root);
        if !paths::is_safe(&self.config.protected_roots(), &target)
            || !paths::is_within(&base, &target)
        {
            error!(
                "Refusing to uninstall {}: {} is protected",
                repository.full_name,
                target.display()
            );
            return Err(Error::ProtectedPath(target));
        }

        let mut doomed: Vec<PathBuf> = vec![target];
        if category == Category::Theme {
            if let Some(file_name) = &repository.file_name {
                let compiled = base.join(file_name);
                if paths::is_within(&base, &compiled) {
                    doomed.push(compiled);
                }
            }
        }

        info!("Uninstalling {}", repository.full_name);
        paths::blocking(move || {
            for path in &doomed {
                paths::remove_path(path)
                    .map_err(|e| Error::io(format!("remove {}", path.display()), e))?;
            }
            Ok(())
        })
        .await?;

        repository.installed = false;
        repository.installed_version = None;
        repository.installed_commit = None;
        repository.first_install = false;
        let action = category.after_uninstall(repository);
        repository.pending_restart = action == PostAction::Restart;

        self.events.emit(RepositoryEvent::Uninstalled {
            id: repository.id,
            full_name: repository.full_name.clone(),
        });
        self.announce(repository, action);
        self.state_changed(repository);
        Ok(())
    }

    /// Fetch releases, tree and manifests into `candidate`.
    ///
    /// Returns validation reasons; transport errors are returned as `Err`.
    async fn refresh(&self, candidate: &mut Repository) -> Result<Vec<String>> {
        let full_name = candidate.full_name.clone();
        let mut reasons = Vec::new();

        match self
            .host
            .list_releases(&full_name, candidate.show_beta, self.config.download.release_limit)
            .await
        {
            Ok(releases) => candidate.apply_releases(releases),
            Err(e) if e.is_quota_failure() => return Err(e),
            Err(e) => {
                debug!("No releases for {}: {}", full_name, e);
                candidate.apply_releases(Vec::new());
            }
        }

        let mut git_ref = candidate.resolve_ref();
        let tree = match self.host.get_tree(&full_name, &git_ref).await {
            Err(Error::NotFound(_)) if candidate.selected_tag.is_some() => {
                warn!(
                    "Ref {} of {} no longer exists, falling back to the default",
                    git_ref, full_name
                );
                candidate.selected_tag = None;
                git_ref = candidate.resolve_ref();
                self.host.get_tree(&full_name, &git_ref).await?
            }
            other => other?,
        };

        let default_ref = candidate.default_ref().to_string();
        match self.host.last_commit(&full_name, &default_ref).await {
            Ok(commit) => candidate.last_commit = Some(commit),
            Err(e) if e.is_quota_failure() => return Err(e),
            Err(e) => warn!("Could not read last commit of {}: {}", full_name, e),
        }

        candidate.manifest = match self.host.get_file(&full_name, "hacs.json", &git_ref).await? {
            Some(contents) => match ContentManifest::parse(&contents) {
                Ok(manifest) => manifest,
                Err(reason) => {
                    reasons.push(reason);
                    ContentManifest::default()
                }
            },
            None => ContentManifest::default(),
        };

        let category = candidate.category;
        reasons.extend(category.inspect(candidate, &tree));

        if category == Category::Integration && reasons.is_empty() {
            let path = manifest_path(&candidate.content_path);
            match self.host.get_file(&full_name, &path, &git_ref).await? {
                Some(contents) => {
                    if let Err(reason) = IntegrationManifest::apply(&contents, candidate) {
                        reasons.push(reason);
                    }
                }
                None => reasons.push(format!("{} is missing", path)),
            }
        }

        candidate.tree = tree;
        candidate.last_fetched = Some(Utc::now());
        Ok(reasons)
    }

    /// Make sure the tree and releases for `git_ref` are loaded.
    async fn prepare(&self, candidate: &mut Repository, git_ref: &str) -> Result<()> {
        if candidate.releases && candidate.fetched_releases.is_empty() {
            let releases = self
                .host
                .list_releases(
                    &candidate.full_name,
                    candidate.show_beta,
                    self.config.download.release_limit,
                )
                .await?;
            candidate.apply_releases(releases);
        }

        let tree: Vec<TreeEntry> = self.host.get_tree(&candidate.full_name, git_ref).await?;
        let category = candidate.category;
        let reasons = category.inspect(candidate, &tree);
        if !reasons.is_empty() {
            return Err(Error::ValidationFailed {
                full_name: candidate.full_name.clone(),
                reasons,
            });
        }
        candidate.tree = tree;
        Ok(())
    }

    fn announce(&self, repository: &Repository, action: PostAction) {
        match action {
            PostAction::Nothing => {}
            PostAction::Reload(target) => {
                debug!("{} requests reload of {}", repository.full_name, target);
                self.events.emit(RepositoryEvent::ReloadRequested { target });
            }
            PostAction::Restart => {
                info!("Restart required to apply changes to {}", repository.full_name);
                self.events.emit(RepositoryEvent::RestartRequired {
                    reason: format!("{} changed", repository.full_name),
                });
            }
        }
    }

    fn state_changed(&self, repository: &Repository) {
        self.events.emit(RepositoryEvent::StateChanged {
            id: repository.id,
            full_name: repository.full_name.clone(),
            state: repository.state(),
        });
    }
}

fn manifest_path(content_path: &str) -> String {
    if content_path.is_empty() {
        "manifest.json".to_string()
    } else {
        format!("{}/manifest.json", content_path)
    }
}

async fn restore_and_cleanup(backup: &BackupManager) {
    if let Err(e) = backup.restore_async().await {
        error!("Could not restore {}: {}", backup.source_path().display(), e);
    }
    if let Err(e) = backup.cleanup_async().await {
        warn!("Could not remove backup {}: {}", backup.snapshot_path().display(), e);
    }
}
