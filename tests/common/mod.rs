/// Common test utilities and helpers for RepoKeeper tests
use async_trait::async_trait;
use repokeeper::critical::CriticalEntry;
use repokeeper::host::{ContentHost, IndexEntry, RateStatus, Release, RemoteRepository, TreeEntry};
use repokeeper::{Category, Config, Error, Orchestrator, RemovedRepository, Result, StateDb};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Test configuration helper
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_root: PathBuf,
    pub db_path: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_root = temp_dir.path().join("config");
        std::fs::create_dir_all(&config_root).expect("Failed to create config root");
        let db_path = temp_dir.path().join("state.db");

        Self {
            temp_dir,
            config_root,
            db_path,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.config_root = self.config_root.to_string_lossy().into_owned();
        config.backup.directory = self
            .temp_dir
            .path()
            .join("backup")
            .to_string_lossy()
            .into_owned();
        config.daemon.pid_file = self
            .temp_dir
            .path()
            .join("repokeeper.pid")
            .to_string_lossy()
            .into_owned();
        config.download.timeout = 5;
        config.download.retries = 1;
        config
    }

    /// Orchestrator over `host` with a store that survives re-opening
    pub fn orchestrator(&self, host: Arc<FakeHost>) -> Orchestrator {
        let store = StateDb::open_at(self.db_path.clone()).expect("Failed to open state db");
        Orchestrator::new(self.config(), host, store)
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.config_root.join(relative)
    }
}

/// Repository served by [`FakeHost`]
#[derive(Debug, Clone)]
pub struct FakeRepository {
    pub remote: RemoteRepository,
    pub releases: Vec<Release>,
    pub files: BTreeMap<String, String>,
}

impl FakeRepository {
    pub fn new(full_name: &str, id: u64) -> Self {
        Self {
            remote: RemoteRepository {
                id,
                full_name: full_name.to_string(),
                description: Some(format!("{} for testing", full_name)),
                default_branch: Some("main".to_string()),
                ..RemoteRepository::default()
            },
            releases: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    /// A compliant integration with the given domain
    pub fn integration(full_name: &str, id: u64, domain: &str) -> Self {
        Self::new(full_name, id)
            .with_file(
                &format!("custom_components/{}/manifest.json", domain),
                &format!(
                    r#"{{"domain": "{}", "name": "Widget", "codeowners": ["@acme"],
                        "version": "1.0.0"}}"#,
                    domain
                ),
            )
            .with_file(&format!("custom_components/{}/__init__.py", domain), "VERSION = 1\n")
            .with_file(&format!("custom_components/{}/sensor.py", domain), "# sensor\n")
            .with_file("hacs.json", r#"{"name": "Widget"}"#)
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    pub fn with_release(mut self, tag: &str) -> Self {
        self.releases.insert(
            0,
            Release {
                tag_name: tag.to_string(),
                prerelease: false,
                draft: false,
                published_at: None,
                assets: Vec::new(),
            },
        );
        self
    }

    pub fn archived(mut self) -> Self {
        self.remote.archived = true;
        self
    }

    fn knows_ref(&self, git_ref: &str) -> bool {
        self.remote.default_branch.as_deref() == Some(git_ref)
            || self.releases.iter().any(|release| release.tag_name == git_ref)
    }

    fn tree(&self) -> Vec<TreeEntry> {
        let mut directories = HashSet::new();
        let mut entries = Vec::new();
        for path in self.files.keys() {
            let mut parent = path.as_str();
            while let Some((dir, _)) = parent.rsplit_once('/') {
                if directories.insert(dir.to_string()) {
                    entries.push(TreeEntry::directory(dir));
                }
                parent = dir;
            }
            entries.push(TreeEntry::file(path.as_str()));
        }
        entries
    }
}

/// In-memory content host. File URLs have the form
/// `fake://{owner}/{name}/{ref}/{path}`.
#[derive(Default)]
pub struct FakeHost {
    repositories: Mutex<HashMap<String, FakeRepository>>,
    remaining: AtomicU32,
    critical: Mutex<Vec<CriticalEntry>>,
    removed: Mutex<Vec<RemovedRepository>>,
    index: Mutex<Vec<(Category, Vec<IndexEntry>)>>,
    failing: Mutex<HashSet<String>>,
    pub downloads: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        let host = Self::default();
        host.remaining.store(5000, Ordering::SeqCst);
        Arc::new(host)
    }

    pub fn add(&self, repository: FakeRepository) {
        self.repositories
            .lock()
            .unwrap()
            .insert(repository.remote.full_name.to_lowercase(), repository);
    }

    pub fn edit(&self, full_name: &str, edit: impl FnOnce(&mut FakeRepository)) {
        let mut repositories = self.repositories.lock().unwrap();
        edit(repositories.get_mut(&full_name.to_lowercase()).expect("unknown fake repository"));
    }

    pub fn set_remaining(&self, remaining: u32) {
        self.remaining.store(remaining, Ordering::SeqCst);
    }

    pub fn set_critical(&self, entries: Vec<CriticalEntry>) {
        *self.critical.lock().unwrap() = entries;
    }

    pub fn set_removed(&self, entries: Vec<RemovedRepository>) {
        *self.removed.lock().unwrap() = entries;
    }

    pub fn set_index(&self, category: Category, full_names: &[&str]) {
        let entries = full_names.iter().map(|name| IndexEntry::new(*name)).collect();
        self.index.lock().unwrap().push((category, entries));
    }

    /// Make downloads of this repository path fail
    pub fn fail_download(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    fn repository(&self, full_name: &str) -> Result<FakeRepository> {
        self.repositories
            .lock()
            .unwrap()
            .get(&full_name.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::NotFound(full_name.to_string()))
    }
}

#[async_trait]
impl ContentHost for FakeHost {
    async fn get_repository(&self, full_name: &str) -> Result<RemoteRepository> {
        Ok(self.repository(full_name)?.remote)
    }

    async fn list_releases(
        &self,
        full_name: &str,
        include_prereleases: bool,
        limit: usize,
    ) -> Result<Vec<Release>> {
        Ok(self
            .repository(full_name)?
            .releases
            .into_iter()
            .filter(|release| include_prereleases || !release.prerelease)
            .take(limit)
            .collect())
    }

    async fn get_tree(&self, full_name: &str, git_ref: &str) -> Result<Vec<TreeEntry>> {
        let repository = self.repository(full_name)?;
        if !repository.knows_ref(git_ref) {
            return Err(Error::NotFound(format!("{}@{}", full_name, git_ref)));
        }
        Ok(repository.tree())
    }

    async fn get_file(
        &self,
        full_name: &str,
        path: &str,
        _git_ref: &str,
    ) -> Result<Option<String>> {
        Ok(self.repository(full_name)?.files.get(path).cloned())
    }

    async fn last_commit(&self, _full_name: &str, _git_ref: &str) -> Result<String> {
        Ok("abc1234".to_string())
    }

    fn file_url(&self, full_name: &str, git_ref: &str, path: &str) -> String {
        format!("fake://{}/{}/{}", full_name, git_ref, path)
    }

    fn release_asset_url(&self, full_name: &str, tag: &str, filename: &str) -> String {
        format!("fake://{}/{}/{}", full_name, tag, filename)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let rest = url
            .strip_prefix("fake://")
            .ok_or_else(|| Error::Host(format!("unexpected url {}", url)))?;
        let mut parts = rest.splitn(4, '/');
        let (Some(owner), Some(name), Some(_git_ref), Some(path)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Host(format!("malformed url {}", url)));
        };

        if self.failing.lock().unwrap().contains(path) {
            return Err(Error::Host("connection reset by peer".to_string()));
        }
        self.repository(&format!("{}/{}", owner, name))?
            .files
            .get(path)
            .map(|contents| contents.clone().into_bytes())
            .ok_or_else(|| Error::NotFound(url.to_string()))
    }

    async fn rate_limit(&self) -> Result<RateStatus> {
        Ok(RateStatus {
            remaining: self.remaining.load(Ordering::SeqCst),
            limit: 5000,
            reset: None,
        })
    }

    async fn fetch_critical(&self) -> Result<Vec<CriticalEntry>> {
        Ok(self.critical.lock().unwrap().clone())
    }

    async fn fetch_removed(&self) -> Result<Vec<RemovedRepository>> {
        Ok(self.removed.lock().unwrap().clone())
    }

    async fn fetch_default_index(&self, category: Category) -> Result<Vec<IndexEntry>> {
        Ok(self
            .index
            .lock()
            .unwrap()
            .iter()
            .filter(|(indexed, _)| *indexed == category)
            .flat_map(|(_, entries)| entries.clone())
            .collect())
    }
}
