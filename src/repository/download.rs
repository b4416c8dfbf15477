//! Download strategy decision and content fetching
//!
//! The strategy is re-derived on every install from the content manifest, the
//! resolved ref and the category layout:
//! - a zipped release asset extracted into the install directory, or
//! - individual files fetched concurrently as one task group.

use super::category::Category;
use super::{ContentManifest, Repository};
use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, RepositoryEvent};
use crate::host::ContentHost;
use crate::paths;
use crate::queue::TaskQueue;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One file to fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FileDownload {
    pub url: String,
    /// Destination relative to the install directory
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStrategy {
    /// Release asset archive extracted into the install directory
    Archive { url: String },
    Files(Vec<FileDownload>),
}

/// Zipped releases are only used for tagged refs
pub fn use_archive(manifest: &ContentManifest, git_ref: &str, default_branch: &str) -> bool {
    manifest.zip_release
        && manifest
            .filename
            .as_deref()
            .is_some_and(|name| name.ends_with(".zip"))
        && git_ref != default_branch
}

/// Whether release assets are preferred over repository files
fn use_release_assets(repository: &Repository, git_ref: &str) -> bool {
    git_ref != repository.default_ref()
        && repository.category.uses_release_assets()
        && repository.releases
}

/// Decide how to fetch a repository's content at `git_ref`.
pub fn plan(
    host: &dyn ContentHost,
    repository: &Repository,
    git_ref: &str,
) -> Result<DownloadStrategy> {
    let full_name = repository.full_name.as_str();

    if use_archive(&repository.manifest, git_ref, repository.default_ref()) {
        let filename = repository.manifest.filename.as_deref().unwrap_or_default();
        return Ok(DownloadStrategy::Archive {
            url: host.release_asset_url(full_name, git_ref, filename),
        });
    }

    if use_release_assets(repository, git_ref) {
        let files: Vec<FileDownload> = repository
            .assets_for(git_ref)
            .iter()
            .map(|asset| FileDownload {
                url: asset.download_url.clone(),
                target: PathBuf::from(&asset.name),
            })
            .collect();
        if !files.is_empty() {
            return Ok(DownloadStrategy::Files(files));
        }
    }

    let remote = repository.content_path.as_str();
    let in_dir = |path: &str| -> Option<String> {
        if remote.is_empty() {
            Some(path.to_string())
        } else {
            path.strip_prefix(remote)
                .and_then(|rest| rest.strip_prefix('/'))
                .map(str::to_string)
        }
    };
    let file = |path: &str, relative: String| FileDownload {
        url: host.file_url(full_name, git_ref, path),
        target: PathBuf::from(relative),
    };

    let files: Vec<FileDownload> = if repository.category.is_single_file()
        || (repository.category == Category::Theme && repository.manifest.content_in_root)
    {
        // One file, written straight into the category directory
        let Some(name) = repository.file_name.as_deref() else {
            return Err(no_content(full_name));
        };
        let path = if remote.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", remote, name)
        };
        repository
            .tree
            .iter()
            .filter(|entry| !entry.is_directory && entry.path == path)
            .map(|entry| file(&entry.path, entry.filename().to_string()))
            .collect()
    } else {
        let only = match (repository.manifest.content_in_root, &repository.manifest.filename) {
            (true, Some(filename)) => Some(filename.as_str()),
            _ => None,
        };
        repository
            .tree
            .iter()
            .filter(|entry| !entry.is_directory)
            .filter(|entry| only.map_or(true, |name| entry.filename() == name))
            .filter(|entry| match repository.category {
                // Plugin code lives flat in the root or in dist/
                Category::Plugin => {
                    entry.parent() == remote
                        && (!remote.is_empty() || entry.filename().ends_with(".js"))
                }
                _ => true,
            })
            .filter_map(|entry| in_dir(&entry.path).map(|relative| file(&entry.path, relative)))
            .collect()
    };

    if files.is_empty() {
        return Err(no_content(full_name));
    }
    Ok(DownloadStrategy::Files(files))
}

fn no_content(full_name: &str) -> Error {
    Error::DownloadFailed {
        full_name: full_name.to_string(),
        reason: "No content to download".to_string(),
    }
}

/// Fetch a URL with a per-attempt timeout. Only timeouts are retried.
pub async fn fetch_with_retry(
    host: &dyn ContentHost,
    url: &str,
    timeout: Duration,
    attempts: u32,
) -> Result<Vec<u8>> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, host.download(url)).await {
            Ok(Err(e)) if e.is_retryable() && attempt < attempts => {
                warn!("Download of {} failed: {} (attempt {}/{})", url, e, attempt, attempts)
            }
            Ok(result) => return result,
            Err(_) => warn!(
                "Download of {} timed out after {:?} (attempt {}/{})",
                url, timeout, attempt, attempts
            ),
        }
    }
    Err(Error::Timeout(url.to_string()))
}

/// Unpack a zip archive into `directory`. Entries escaping it are skipped.
pub fn extract_archive(bytes: &[u8], directory: &Path) -> Result<usize> {
    let invalid = |e: zip::result::ZipError| {
        Error::io("read release archive", io::Error::new(io::ErrorKind::InvalidData, e))
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(invalid)?;
    let mut extracted = 0;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(invalid)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let destination = directory.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&destination)
                .map_err(|e| Error::io(format!("create {}", destination.display()), e))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
        let mut out = std::fs::File::create(&destination)
            .map_err(|e| Error::io(format!("create {}", destination.display()), e))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| Error::io(format!("write {}", destination.display()), e))?;
        extracted += 1;
    }

    Ok(extracted)
}

/// Executes a [`DownloadStrategy`] for one repository
pub struct Downloader {
    host: Arc<dyn ContentHost>,
    timeout: Duration,
    attempts: u32,
    events: EventBus,
}

impl Downloader {
    pub fn new(host: Arc<dyn ContentHost>, config: &DownloadConfig, events: EventBus) -> Self {
        Self {
            host,
            timeout: config.timeout_duration(),
            attempts: config.retries,
            events,
        }
    }

    /// Write the content into `directory`.
    ///
    /// All files are attempted; every failure is collected into a single
    /// `DownloadFailed`.
    pub async fn run(
        &self,
        repository: &Repository,
        strategy: DownloadStrategy,
        directory: &Path,
    ) -> Result<()> {
        let full_name = repository.full_name.clone();

        match strategy {
            DownloadStrategy::Archive { url } => {
                info!("Downloading release archive for {}", full_name);
                let bytes = fetch_with_retry(self.host.as_ref(), &url, self.timeout, self.attempts)
                    .await
                    .map_err(|e| Error::DownloadFailed {
                        full_name: full_name.clone(),
                        reason: e.to_string(),
                    })?;
                let directory = directory.to_path_buf();
                let count = paths::blocking(move || extract_archive(&bytes, &directory))
                    .await
                    .map_err(|e| Error::DownloadFailed {
                        full_name: full_name.clone(),
                        reason: e.to_string(),
                    })?;
                debug!("Extracted {} files for {}", count, full_name);
                self.events.emit(RepositoryEvent::DownloadProgress {
                    id: repository.id,
                    progress: 100,
                });
                Ok(())
            }
            DownloadStrategy::Files(files) => self.fetch_files(repository, files, directory).await,
        }
    }

    async fn fetch_files(
        &self,
        repository: &Repository,
        files: Vec<FileDownload>,
        directory: &Path,
    ) -> Result<()> {
        let total = files.len();
        let done = Arc::new(AtomicUsize::new(0));
        let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let group = files
            .into_iter()
            .map(|file| {
                let host = self.host.clone();
                let events = self.events.clone();
                let done = done.clone();
                let failures = failures.clone();
                let destination = directory.join(&file.target);
                let (timeout, attempts, id) = (self.timeout, self.attempts, repository.id);

                Box::pin(async move {
                    let fetched =
                        fetch_with_retry(host.as_ref(), &file.url, timeout, attempts).await;
                    let result = match fetched {
                        Ok(bytes) => write_file(&destination, bytes).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => {
                            debug!("Download of {} completed", file.target.display());
                            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                            events.emit(RepositoryEvent::DownloadProgress {
                                id,
                                progress: ((finished * 100) / total) as u8,
                            });
                        }
                        Err(e) => {
                            warn!("Download of {} failed: {}", file.target.display(), e);
                            failures
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push(format!(
                                    "[{}] was not downloaded: {}",
                                    file.target.display(),
                                    e
                                ));
                        }
                    }
                }) as crate::queue::Task
            })
            .collect();

        let queue = TaskQueue::new();
        queue.add(group);
        queue.execute(None).await?;

        let failures = std::mem::take(
            &mut *failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if failures.is_empty() {
            info!("Downloaded {} files for {}", total, repository.full_name);
            Ok(())
        } else {
            Err(Error::DownloadFailed {
                full_name: repository.full_name.clone(),
                reason: failures.join("; "),
            })
        }
    }
}

async fn write_file(destination: &Path, bytes: Vec<u8>) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
    }
    tokio::fs::write(destination, bytes)
        .await
        .map_err(|e| Error::io(format!("write {}", destination.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockContentHost, Release, ReleaseAsset, TreeEntry};
    use assert_matches::assert_matches;
    use std::io::Write;
    use tempfile::TempDir;

    fn host() -> MockContentHost {
        let mut host = MockContentHost::new();
        host.expect_file_url()
            .returning(|name, git_ref, path| format!("raw://{}/{}/{}", name, git_ref, path));
        host.expect_release_asset_url()
            .returning(|name, tag, file| format!("asset://{}/{}/{}", name, tag, file));
        host
    }

    fn manifest(zip_release: bool, filename: Option<&str>) -> ContentManifest {
        ContentManifest {
            zip_release,
            filename: filename.map(str::to_string),
            ..ContentManifest::default()
        }
    }

    #[test]
    fn test_archive_decision_table() {
        assert!(use_archive(&manifest(true, Some("widget.zip")), "1.0.0", "main"));
        assert!(!use_archive(&manifest(true, Some("widget.zip")), "main", "main"));
        assert!(!use_archive(&manifest(true, Some("widget.js")), "1.0.0", "main"));
        assert!(!use_archive(&manifest(false, Some("widget.zip")), "1.0.0", "main"));
        assert!(!use_archive(&manifest(true, None), "1.0.0", "main"));
    }

    #[test]
    fn test_plan_integration_files() {
        let mut repo = Repository::new("acme/widget", Category::Integration);
        repo.content_path = "custom_components/widget".to_string();
        repo.tree = vec![
            TreeEntry::directory("custom_components/widget"),
            TreeEntry::file("custom_components/widget/__init__.py"),
            TreeEntry::file("custom_components/widget/translations/en.json"),
            TreeEntry::file("custom_components/widget_extra/other.py"),
            TreeEntry::file("README.md"),
        ];

        let strategy = plan(&host(), &repo, "main").unwrap();
        let DownloadStrategy::Files(files) = strategy else {
            panic!("expected files");
        };
        let targets: Vec<_> = files.iter().map(|f| f.target.clone()).collect();
        assert_eq!(
            targets,
            vec![PathBuf::from("__init__.py"), PathBuf::from("translations/en.json")]
        );
        assert_eq!(
            files[0].url,
            "raw://acme/widget/main/custom_components/widget/__init__.py"
        );
    }

    #[test]
    fn test_plan_zip_release() {
        let mut repo = Repository::new("acme/widget", Category::Integration);
        repo.manifest = manifest(true, Some("widget.zip"));

        assert_eq!(
            plan(&host(), &repo, "2.0.0").unwrap(),
            DownloadStrategy::Archive {
                url: "asset://acme/widget/2.0.0/widget.zip".to_string()
            }
        );
    }

    #[test]
    fn test_plan_plugin_prefers_release_assets_on_tags() {
        let mut repo = Repository::new("acme/fancy-card", Category::Plugin);
        repo.file_name = Some("fancy-card.js".to_string());
        repo.tree = vec![TreeEntry::file("fancy-card.js"), TreeEntry::file("package.json")];
        repo.apply_releases(vec![Release {
            tag_name: "1.0.0".to_string(),
            prerelease: false,
            draft: false,
            published_at: None,
            assets: vec![ReleaseAsset {
                name: "fancy-card.js".to_string(),
                download_url: "https://example.invalid/fancy-card.js".to_string(),
                download_count: 3,
            }],
        }]);

        let DownloadStrategy::Files(files) = plan(&host(), &repo, "1.0.0").unwrap() else {
            panic!("expected files");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].url, "https://example.invalid/fancy-card.js");

        // Default branch reads the tree, js files only
        let DownloadStrategy::Files(files) = plan(&host(), &repo, "main").unwrap() else {
            panic!("expected files");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].url, "raw://acme/fancy-card/main/fancy-card.js");
    }

    #[test]
    fn test_plan_single_file() {
        let mut repo = Repository::new("acme/hello", Category::PythonScript);
        repo.content_path = "python_scripts".to_string();
        repo.file_name = Some("hello.py".to_string());
        repo.tree = vec![
            TreeEntry::file("python_scripts/hello.py"),
            TreeEntry::file("python_scripts/other.py"),
        ];

        let DownloadStrategy::Files(files) = plan(&host(), &repo, "main").unwrap() else {
            panic!("expected files");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].target, PathBuf::from("hello.py"));
    }

    #[test]
    fn test_plan_without_content_fails() {
        let repo = Repository::new("acme/widget", Category::Integration);
        assert_matches!(
            plan(&host(), &repo, "main"),
            Err(Error::DownloadFailed { .. })
        );
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_other_errors() {
        let mut host = MockContentHost::new();
        host.expect_download()
            .times(1)
            .returning(|url| Err(Error::NotFound(url.to_string())));

        let result = fetch_with_retry(&host, "raw://missing", Duration::from_secs(5), 5).await;
        assert_matches!(result, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_retries_transport_timeouts() {
        let mut host = MockContentHost::new();
        host.expect_download()
            .times(2)
            .returning(|url| Err(Error::Timeout(url.to_string())));
        host.expect_download().returning(|_| Ok(b"ok".to_vec()));

        let result = fetch_with_retry(&host, "raw://slow", Duration::from_secs(5), 5).await;
        assert_eq!(result.unwrap(), b"ok".to_vec());
    }

    #[test]
    fn test_extract_archive() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("widget.js", options).unwrap();
        writer.write_all(b"console.log('widget')").unwrap();
        writer.add_directory("assets/", options).unwrap();
        writer.start_file("assets/icon.svg", options).unwrap();
        writer.write_all(b"<svg/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let temp = TempDir::new().unwrap();
        let count = extract_archive(&bytes, temp.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("widget.js")).unwrap(),
            "console.log('widget')"
        );
        assert!(temp.path().join("assets/icon.svg").is_file());
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        assert!(extract_archive(b"not a zip", temp.path()).is_err());
    }
}
