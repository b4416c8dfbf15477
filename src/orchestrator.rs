//! Orchestrator - startup, scheduling and the public repository API
//!
//! The orchestrator owns the registry, the store and the background task
//! queue. Every repository operation takes a clone out of the registry, drives
//! it through the state machine and writes it back only on success, so no lock
//! is ever held across a suspension point. At most one install, update or
//! uninstall may be in flight per repository.

use crate::config::Config;
use crate::critical::{CriticalEntry, CriticalRepositoryMonitor, RepositoryRemover, SweepReport};
use crate::error::{Error, Result};
use crate::events::{DisabledReason, EventBus, RepositoryEvent};
use crate::host::{ContentHost, IndexEntry};
use crate::queue::TaskQueue;
use crate::ratelimit::Governor;
use crate::registry::{Registry, RemovedRepository};
use crate::repository::category::Category;
use crate::repository::machine::RepositoryStateMachine;
use crate::repository::{fields, InstallOutcome, Repository};
use crate::state::{EventType, LifecycleEventBuilder, StateDb};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error, info, warn};

/// Snapshot of the orchestrator's scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub startup: bool,
    pub background_task_running: bool,
    pub pending_task_count: usize,
    pub disabled_reason: Option<DisabledReason>,
}

/// Cheaply cloneable handle; all clones share one state
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    host: Arc<dyn ContentHost>,
    store: Arc<Mutex<StateDb>>,
    registry: RwLock<Registry>,
    machine: RepositoryStateMachine,
    governor: Governor,
    queue: Arc<TaskQueue>,
    critical_queue: Arc<TaskQueue>,
    events: EventBus,
    in_flight: Mutex<HashSet<u64>>,
    startup: AtomicBool,
    disabled: Mutex<Option<DisabledReason>>,
}

/// Admission ticket for one repository; released on drop
struct InFlight<'a> {
    ids: &'a Mutex<HashSet<u64>>,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

impl Orchestrator {
    pub fn new(config: Config, host: Arc<dyn ContentHost>, store: StateDb) -> Self {
        let config = Arc::new(config);
        let events = EventBus::default();
        let machine = RepositoryStateMachine::new(host.clone(), config.clone(), events.clone());
        let governor = Governor::from_config(&config.host);

        Self {
            inner: Arc::new(Inner {
                config,
                host,
                store: Arc::new(Mutex::new(store)),
                registry: RwLock::new(Registry::new()),
                machine,
                governor,
                queue: Arc::new(TaskQueue::new()),
                critical_queue: Arc::new(TaskQueue::new()),
                events,
                in_flight: Mutex::new(HashSet::new()),
                startup: AtomicBool::new(false),
                disabled: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RepositoryEvent> {
        self.inner.events.subscribe()
    }

    /// All known repositories, sorted by name
    pub fn repositories(&self) -> Vec<Repository> {
        let mut repositories: Vec<Repository> =
            self.read_registry(|registry| registry.iter().cloned().collect());
        repositories.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        repositories
    }

    pub fn repository(&self, id: u64) -> Option<Repository> {
        self.read_registry(|registry| registry.get(id).cloned())
    }

    pub fn find(&self, full_name: &str) -> Option<Repository> {
        self.read_registry(|registry| registry.find(full_name).cloned())
    }

    pub fn status(&self) -> Status {
        Status {
            startup: self.inner.startup.load(Ordering::SeqCst),
            background_task_running: self.inner.queue.running(),
            pending_task_count: self.inner.queue.pending(),
            disabled_reason: self.disabled_reason(),
        }
    }

    pub fn disabled_reason(&self) -> Option<DisabledReason> {
        *self.inner.disabled.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ===== Registry access =====

    fn read_registry<T>(&self, action: impl FnOnce(&Registry) -> T) -> T {
        let registry = self.inner.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        action(&registry)
    }

    fn write_registry<T>(&self, action: impl FnOnce(&mut Registry) -> T) -> T {
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        action(&mut registry)
    }

    fn with_store<T>(&self, action: impl FnOnce(&StateDb) -> anyhow::Result<T>) -> Result<T> {
        let store = self.inner.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        action(&store).map_err(Error::from)
    }

    fn record(&self, builder: LifecycleEventBuilder) {
        if let Err(e) = self.with_store(|store| store.record_event(builder)) {
            warn!("Failed to record lifecycle event: {}", e);
        }
    }

    fn admit(&self, id: u64) -> Result<InFlight<'_>> {
        let mut ids = self.inner.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !ids.insert(id) {
            return Err(Error::AlreadyInFlight(id));
        }
        Ok(InFlight {
            ids: &self.inner.in_flight,
            id,
        })
    }

    fn checkout(&self, id: u64) -> Result<Repository> {
        self.repository(id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))
    }

    fn commit(&self, repository: Repository) -> Result<()> {
        self.write_registry(|registry| registry.insert(repository))?;
        self.persist()
    }

    /// Load the registry from the store. Returns the number of records.
    pub fn restore(&self) -> Result<usize> {
        let snapshot = self.with_store(|store| store.load_snapshot())?;
        let restored = self.write_registry(|registry| registry.restore(snapshot));
        info!("Restored {} repositories from the store", restored);
        Ok(restored)
    }

    /// Save the registry in one transaction
    pub fn persist(&self) -> Result<()> {
        let snapshot = self.read_registry(Registry::snapshot);
        self.with_store(|store| store.save_snapshot(&snapshot))?;
        debug!("Persisted {} repositories", snapshot.repositories.len());
        Ok(())
    }

    // ===== Repository operations =====

    /// Validate and add a repository.
    ///
    /// An explicit registration clears a previous skip. Repositories failing
    /// validation are added to the skip set.
    pub async fn register(&self, full_name: &str, category: Category) -> Result<Repository> {
        if !self.inner.config.is_category_enabled(category) {
            return Err(Error::Config(format!("category {} is not enabled", category)));
        }

        let (existing, removed) = self.write_registry(|registry| {
            if registry.unskip(full_name) {
                info!("Clearing skip for {}", full_name);
            }
            (
                registry.find(full_name).cloned(),
                registry.removed_entry(full_name).cloned(),
            )
        });

        let _ticket = match &existing {
            Some(repository) if repository.id != 0 => Some(self.admit(repository.id)?),
            _ => None,
        };

        let mut repository = existing.unwrap_or_else(|| Repository::new(full_name, category));
        if let Err(e) = self.inner.machine.register(&mut repository, removed.as_ref()).await {
            self.rejected(full_name, removed.as_ref(), &e);
            return Err(e);
        }

        self.write_registry(|registry| registry.insert(repository.clone()))?;
        self.record(
            LifecycleEventBuilder::new(
                EventType::Registered,
                format!("Registered {}", repository.full_name),
            )
                .repo(&repository.full_name),
        );
        self.persist()?;
        Ok(repository)
    }

    fn rejected(&self, full_name: &str, removed: Option<&RemovedRepository>, e: &Error) {
        match e {
            Error::ValidationFailed { reasons, .. } => {
                self.write_registry(|registry| registry.skip(full_name));
                self.record(
                    LifecycleEventBuilder::new(
                        EventType::ValidationFailed,
                        format!("{} failed validation", full_name),
                    )
                        .repo(full_name)
                        .details_json(reasons),
                );
            }
            Error::ArchivedOrBlacklisted { .. }
                if !removed.is_some_and(RemovedRepository::blocks_registration) =>
            {
                self.write_registry(|registry| registry.mark_archived(full_name));
            }
            _ => {}
        }
        if let Err(e) = self.persist() {
            warn!("Could not persist after rejecting {}: {}", full_name, e);
        }
    }

    pub async fn install(&self, id: u64, version: Option<&str>) -> Result<InstallOutcome> {
        let _ticket = self.admit(id)?;
        let mut repository = self.checkout(id)?;

        match self.inner.machine.install(&mut repository, version).await {
            Ok(outcome) => {
                let summary = format!(
                    "Installed {} {}",
                    repository.full_name,
                    repository.installed_display().unwrap_or_default()
                );
                self.record(
                    LifecycleEventBuilder::new(EventType::Installed, summary.trim_end().to_string())
                        .repo(&repository.full_name),
                );
                self.commit(repository)?;
                Ok(outcome)
            }
            Err(e) => {
                self.record(
                    LifecycleEventBuilder::new(
                        EventType::InstallFailed,
                        format!("Install of {} failed", repository.full_name),
                    )
                        .repo(&repository.full_name)
                        .details(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Refresh a repository. A failure leaves the stored record untouched.
    pub async fn update(&self, id: u64, force: bool) -> Result<()> {
        let _ticket = self.admit(id)?;
        let mut repository = self.checkout(id)?;
        let previous_name = repository.full_name.clone();

        self.inner.machine.update(&mut repository, force).await?;

        if repository.full_name != previous_name {
            info!("{} was renamed to {}", previous_name, repository.full_name);
        }
        if repository.pending_update() {
            self.record(
                LifecycleEventBuilder::new(
                    EventType::Updated,
                    format!(
                        "{} has {} available",
                        repository.full_name,
                        repository.available_version().unwrap_or("an update")
                    ),
                )
                .repo(&repository.full_name),
            );
        }
        self.commit(repository)
    }

    pub async fn uninstall(&self, id: u64) -> Result<()> {
        let _ticket = self.admit(id)?;
        let mut repository = self.checkout(id)?;

        self.inner.machine.uninstall(&mut repository).await?;

        self.record(
            LifecycleEventBuilder::new(
                EventType::Uninstalled,
                format!("Uninstalled {}", repository.full_name),
            )
                .repo(&repository.full_name),
        );
        self.commit(repository)
    }

    // ===== Scheduling =====

    /// Startup sequence: restore, removed list, critical sweep, discovery and
    /// one queue pass.
    pub async fn startup(&self) -> Result<()> {
        self.inner.startup.store(true, Ordering::SeqCst);
        self.emit_status();

        self.restore()?;

        if let Err(e) = self.handle_removed().await {
            warn!("Could not apply the removed list: {}", e);
        }

        let monitor = self.critical_monitor();
        monitor.report_pending()?;
        self.run_critical_sweep().await?;

        if let Err(e) = self.discover().await {
            warn!("Could not load default repositories: {}", e);
        }
        self.schedule_installed_updates();
        self.process_queue().await?;

        self.inner.startup.store(false, Ordering::SeqCst);
        self.emit_status();
        info!("Startup complete with {} repositories", self.read_registry(Registry::len));
        Ok(())
    }

    /// Run queued work within the remote quota.
    ///
    /// Returns the number of task groups executed. A failed probe disables
    /// processing as `InvalidToken`, an exhausted quota as `RateLimit`.
    pub async fn process_queue(&self) -> Result<usize> {
        if let Some(reason) = self.disabled_reason() {
            debug!("Queue processing disabled ({})", reason.as_str());
            return Ok(0);
        }
        let queue = &self.inner.queue;
        if !queue.has_pending() {
            debug!("Nothing in the queue");
            return Ok(0);
        }
        if queue.running() {
            debug!("Queue is already running");
            return Ok(0);
        }

        let mut executed = 0;
        while queue.has_pending() {
            let capacity = match self.inner.governor.capacity(self.inner.host.as_ref()).await {
                None => {
                    self.disable(DisabledReason::InvalidToken);
                    break;
                }
                Some(0) => {
                    self.disable(DisabledReason::RateLimit);
                    break;
                }
                Some(capacity) => capacity,
            };

            info!(
                "Processing up to {} of {} queued task groups",
                capacity,
                queue.pending()
            );
            self.emit_status();
            match queue.execute(Some(capacity as usize)).await {
                Ok(count) => executed += count,
                Err(Error::StillInProgress) => break,
                Err(e) => return Err(e),
            }
        }

        if !queue.has_pending() {
            self.persist()?;
        }
        self.emit_status();
        Ok(executed)
    }

    /// Re-probe the quota while disabled for rate limiting. Returns true when
    /// processing was re-enabled.
    pub async fn check_rate_limit(&self) -> Result<bool> {
        if self.disabled_reason() != Some(DisabledReason::RateLimit) {
            return Ok(false);
        }
        match self.inner.governor.capacity(self.inner.host.as_ref()).await {
            Some(capacity) if capacity > 0 => {
                self.enable();
                self.process_queue().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Queue one update group per installed repository
    pub fn schedule_installed_updates(&self) -> usize {
        let ids: Vec<u64> = self.read_registry(|registry| {
            registry
                .installed()
                .map(|repository| repository.id)
                .collect()
        });
        for &id in &ids {
            let handle = Arc::downgrade(&self.inner);
            self.inner.queue.add_task(async move {
                let Some(orchestrator) = upgrade(&handle) else {
                    return;
                };
                match orchestrator.update(id, false).await {
                    Ok(()) => {}
                    Err(Error::AlreadyInFlight(_)) => {
                        debug!("Repository {} busy, skipping update", id)
                    }
                    Err(e) => warn!("Background update of repository {} failed: {}", id, e),
                }
            });
        }
        debug!("Queued {} installed repositories for update", ids.len());
        ids.len()
    }

    /// Queue a refresh of every known repository
    pub fn schedule_all_updates(&self) -> usize {
        let ids: Vec<u64> = self.read_registry(|registry| {
            registry.iter().map(|repository| repository.id).collect()
        });
        for &id in &ids {
            let handle = Arc::downgrade(&self.inner);
            self.inner.queue.add_task(async move {
                if let Some(orchestrator) = upgrade(&handle) {
                    if let Err(e) = orchestrator.update(id, false).await {
                        debug!("Background refresh of repository {} failed: {}", id, e);
                    }
                }
            });
        }
        ids.len()
    }

    /// Load the default index of every enabled category.
    ///
    /// Unknown repositories are queued for background registration; known
    /// ones have the index metadata merged in. Returns the number queued.
    pub async fn discover(&self) -> Result<usize> {
        let mut queued = 0;
        for &category in &self.inner.config.categories.enabled {
            let entries = match self.inner.host.fetch_default_index(category).await {
                Ok(entries) => entries,
                Err(e) if e.is_quota_failure() => return Err(e),
                Err(e) => {
                    warn!("Could not load the {} index: {}", category, e);
                    continue;
                }
            };
            debug!("{} index lists {} repositories", category, entries.len());

            for entry in entries {
                if self.ingest(category, entry) {
                    queued += 1;
                }
            }
        }
        info!("Queued {} new default repositories", queued);
        Ok(queued)
    }

    /// Returns true when a background registration was queued.
    fn ingest(&self, category: Category, entry: IndexEntry) -> bool {
        let full_name = self.read_registry(|registry| {
            registry
                .renamed()
                .get(&entry.full_name.to_lowercase())
                .cloned()
                .unwrap_or_else(|| entry.full_name.clone())
        });

        let known = self.write_registry(|registry| {
            if registry.removed_entry(&full_name).is_some()
                || registry.is_archived(&full_name)
                || registry.is_skipped(&full_name)
            {
                return Some(false);
            }
            let id = registry.find(&full_name)?.id;
            let Some(repository) = registry.get_mut(id) else {
                return Some(false);
            };
            if let Err(e) = fields::merge(repository, &entry.data) {
                warn!("Not merging index data for {}: {}", full_name, e);
            }
            Some(true)
        });
        if known.is_some() {
            return false;
        }

        let handle = Arc::downgrade(&self.inner);
        self.inner.queue.add_task(async move {
            let Some(orchestrator) = upgrade(&handle) else {
                return;
            };
            if orchestrator.read_registry(|registry| registry.is_skipped(&full_name)) {
                return;
            }
            if let Err(e) = orchestrator.register(&full_name, category).await {
                match e {
                    Error::ValidationFailed { .. } | Error::ArchivedOrBlacklisted { .. } => {
                        debug!("Skipping {}: {}", full_name, e)
                    }
                    e => warn!("Background registration of {} failed: {}", full_name, e),
                }
            }
        });
        true
    }

    /// Apply the removed list. Removed repositories that are not installed
    /// are unregistered; installed ones only raise a warning.
    pub async fn handle_removed(&self) -> Result<usize> {
        let removed = match self.inner.host.fetch_removed().await {
            Ok(removed) => removed,
            Err(Error::NotModified) => Vec::new(),
            Err(e) => return Err(e),
        };

        let unregistered = self.write_registry(|registry| {
            for entry in removed {
                registry.set_removed(entry);
            }

            let mut doomed = Vec::new();
            for entry in registry.removed() {
                let Some(repository) = registry.find(&entry.repository) else {
                    continue;
                };
                if repository.installed && entry.removal_type != "critical" {
                    warn!(
                        "{} is installed but has been removed ({}), \
                         please consider uninstalling it",
                        repository.full_name, entry.removal_type
                    );
                } else if !repository.installed {
                    doomed.push(repository.id);
                }
            }
            for id in &doomed {
                if let Some(repository) = registry.remove(*id) {
                    info!("Unregistered removed repository {}", repository.full_name);
                }
            }
            doomed.len()
        });

        self.persist()?;
        Ok(unregistered)
    }

    fn critical_monitor(&self) -> CriticalRepositoryMonitor {
        CriticalRepositoryMonitor::new(
            self.inner.host.clone(),
            self.inner.store.clone(),
            Arc::new(self.clone()),
            self.inner.events.clone(),
            self.inner.critical_queue.clone(),
        )
    }

    /// Force-remove repositories on the critical list
    pub async fn run_critical_sweep(&self) -> Result<SweepReport> {
        let report = self.critical_monitor().sweep().await?;
        for full_name in &report.forced {
            self.record(
                LifecycleEventBuilder::new(
                    EventType::CriticalRemoval,
                    format!("Removed critical repository {}", full_name),
                )
                    .repo(full_name),
            );
        }
        self.persist()?;
        Ok(report)
    }

    pub fn pending_critical(&self) -> Result<Vec<CriticalEntry>> {
        self.critical_monitor().pending_acknowledgements()
    }

    pub fn acknowledge_critical(&self, full_name: &str) -> Result<bool> {
        self.critical_monitor().acknowledge(full_name)
    }

    // ===== Status =====

    fn disable(&self, reason: DisabledReason) {
        let mut disabled = self
            .inner
            .disabled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if disabled.replace(reason) != Some(reason) {
            error!("Background processing disabled: {}", reason.as_str());
            if reason == DisabledReason::RateLimit {
                self.record(LifecycleEventBuilder::new(
                    EventType::RateLimited,
                    "Background processing paused until the API quota resets",
                ));
            }
            self.inner.events.emit(RepositoryEvent::Disabled { reason });
        }
    }

    fn enable(&self) {
        let previous = self
            .inner
            .disabled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if previous.is_some() {
            info!("Background processing enabled");
            self.inner.events.emit(RepositoryEvent::Enabled);
        }
    }

    fn emit_status(&self) {
        let status = self.status();
        self.inner.events.emit(RepositoryEvent::Status {
            startup: status.startup,
            background_task_running: status.background_task_running,
            pending_task_count: status.pending_task_count,
        });
    }
}

fn upgrade(handle: &Weak<Inner>) -> Option<Orchestrator> {
    handle.upgrade().map(|inner| Orchestrator { inner })
}

#[async_trait]
impl RepositoryRemover for Orchestrator {
    fn is_installed(&self, full_name: &str) -> bool {
        self.read_registry(|registry| {
            registry
                .find(full_name)
                .is_some_and(|repository| repository.installed)
        })
    }

    async fn remove(&self, full_name: &str) -> Result<()> {
        let id = self
            .find(full_name)
            .map(|repository| repository.id)
            .ok_or_else(|| Error::NotFound(full_name.to_string()))?;
        self.uninstall(id).await
    }

    fn mark_critical(&self, entry: &CriticalEntry) {
        let mut removed = RemovedRepository::new(&entry.repository, "critical");
        removed.reason = entry.reason.clone();
        removed.link = entry.link.clone();
        removed.acknowledged = entry.acknowledged;
        self.write_registry(|registry| registry.set_removed(removed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockContentHost, RateStatus, RemoteRepository, TreeEntry};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn config(root: &TempDir) -> Config {
        Config {
            config_root: root.path().join("config").to_string_lossy().into_owned(),
            ..Config::default()
        }
    }

    fn quota(remaining: u32) -> RateStatus {
        RateStatus {
            remaining,
            limit: 5000,
            reset: None,
        }
    }

    fn orchestrator(host: MockContentHost, root: &TempDir) -> Orchestrator {
        let store = StateDb::open_in_memory().unwrap();
        Orchestrator::new(config(root), Arc::new(host), store)
    }

    fn seeded(orchestrator: &Orchestrator, full_name: &str, id: u64, installed: bool) {
        let mut repository = Repository::new(full_name, Category::Plugin);
        repository.id = id;
        repository.installed = installed;
        orchestrator
            .write_registry(|registry| registry.insert(repository))
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_processing() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_rate_limit().returning(|| Ok(quota(900)));
        let orchestrator = orchestrator(host, &root);
        let mut events = orchestrator.subscribe();

        orchestrator.inner.queue.add_task(async {});
        let executed = orchestrator.process_queue().await.unwrap();

        assert_eq!(executed, 0);
        assert_eq!(orchestrator.status().pending_task_count, 1);
        assert_eq!(orchestrator.disabled_reason(), Some(DisabledReason::RateLimit));
        assert!(crate::events::drain(&mut events).contains(&RepositoryEvent::Disabled {
            reason: DisabledReason::RateLimit
        }));
    }

    #[tokio::test]
    async fn test_failed_probe_disables_as_invalid_token() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_rate_limit()
            .returning(|| Err(Error::Authentication("bad credentials".to_string())));
        let orchestrator = orchestrator(host, &root);

        orchestrator.inner.queue.add_task(async {});
        orchestrator.process_queue().await.unwrap();

        assert_eq!(orchestrator.disabled_reason(), Some(DisabledReason::InvalidToken));
    }

    #[tokio::test]
    async fn test_capacity_bounds_groups_per_pass() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_rate_limit()
            .times(1)
            .returning(|| Ok(quota(1020)));
        host.expect_rate_limit().returning(|| Ok(quota(1000)));
        let orchestrator = orchestrator(host, &root);

        for _ in 0..3 {
            orchestrator.inner.queue.add_task(async {});
        }
        let executed = orchestrator.process_queue().await.unwrap();

        assert_eq!(executed, 2);
        assert_eq!(orchestrator.status().pending_task_count, 1);
        assert_eq!(orchestrator.disabled_reason(), Some(DisabledReason::RateLimit));
    }

    #[tokio::test]
    async fn test_check_rate_limit_reenables() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_rate_limit().returning(|| Ok(quota(5000)));
        let orchestrator = orchestrator(host, &root);
        orchestrator.disable(DisabledReason::RateLimit);
        orchestrator.inner.queue.add_task(async {});

        assert!(orchestrator.check_rate_limit().await.unwrap());
        assert_eq!(orchestrator.disabled_reason(), None);
        assert_eq!(orchestrator.status().pending_task_count, 0);
    }

    #[tokio::test]
    async fn test_operation_already_in_flight() {
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(MockContentHost::new(), &root);
        seeded(&orchestrator, "acme/widget", 7, true);

        let _ticket = orchestrator.admit(7).unwrap();
        assert_matches!(orchestrator.uninstall(7).await, Err(Error::AlreadyInFlight(7)));
        assert_matches!(orchestrator.install(7, None).await, Err(Error::AlreadyInFlight(7)));
    }

    #[tokio::test]
    async fn test_validation_failure_adds_to_skip() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_get_repository().returning(|full_name| {
            Ok(RemoteRepository {
                id: 11,
                full_name: full_name.to_string(),
                default_branch: Some("main".to_string()),
                ..RemoteRepository::default()
            })
        });
        host.expect_list_releases().returning(|_, _, _| Ok(Vec::new()));
        host.expect_get_tree()
            .returning(|_, _| Ok(vec![TreeEntry::file("README.md")]));
        host.expect_last_commit().returning(|_, _| Ok("abc1234".to_string()));
        host.expect_get_file().returning(|_, _, _| Ok(None));
        let orchestrator = orchestrator(host, &root);

        let result = orchestrator.register("acme/empty", Category::Plugin).await;

        assert_matches!(result, Err(Error::ValidationFailed { .. }));
        assert!(orchestrator.read_registry(|registry| registry.is_skipped("acme/empty")));
        assert!(orchestrator.find("acme/empty").is_none());
    }

    #[tokio::test]
    async fn test_register_disabled_category() {
        let root = TempDir::new().unwrap();
        let mut config = config(&root);
        config.categories.enabled = vec![Category::Integration];
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(MockContentHost::new()),
            StateDb::open_in_memory().unwrap(),
        );

        let result = orchestrator.register("acme/theme", Category::Theme).await;
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_discover_queues_unknown_and_merges_known() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_fetch_default_index().returning(|category| {
            if category != Category::Plugin {
                return Ok(Vec::new());
            }
            let mut known = IndexEntry::new("acme/known");
            known.data.insert("stargazers_count".to_string(), serde_json::json!(42));
            Ok(vec![
                known,
                IndexEntry::new("acme/new"),
                IndexEntry::new("acme/skipped"),
                IndexEntry::new("acme/gone"),
            ])
        });
        let orchestrator = orchestrator(host, &root);
        seeded(&orchestrator, "acme/known", 3, false);
        orchestrator.write_registry(|registry| {
            registry.skip("acme/skipped");
            registry.set_removed(RemovedRepository::new("acme/gone", "remove"));
        });

        let queued = orchestrator.discover().await.unwrap();

        assert_eq!(queued, 1);
        assert_eq!(orchestrator.status().pending_task_count, 1);
        assert_eq!(orchestrator.repository(3).unwrap().stargazers_count, 42);
    }

    #[tokio::test]
    async fn test_handle_removed_unregisters_only_uninstalled() {
        let root = TempDir::new().unwrap();
        let mut host = MockContentHost::new();
        host.expect_fetch_removed().returning(|| {
            Ok(vec![
                RemovedRepository::new("acme/idle", "remove"),
                RemovedRepository::new("acme/busy", "remove"),
            ])
        });
        let orchestrator = orchestrator(host, &root);
        seeded(&orchestrator, "acme/idle", 1, false);
        seeded(&orchestrator, "acme/busy", 2, true);

        let unregistered = orchestrator.handle_removed().await.unwrap();

        assert_eq!(unregistered, 1);
        assert!(orchestrator.find("acme/idle").is_none());
        assert!(orchestrator.find("acme/busy").is_some());
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let root = TempDir::new().unwrap();
        let db_path = root.path().join("state.db");

        let first = Orchestrator::new(
            config(&root),
            Arc::new(MockContentHost::new()),
            StateDb::open_at(db_path.clone()).unwrap(),
        );
        seeded(&first, "acme/widget", 7, true);
        first.write_registry(|registry| registry.skip("acme/broken"));
        first.persist().unwrap();
        drop(first);

        let second = Orchestrator::new(
            config(&root),
            Arc::new(MockContentHost::new()),
            StateDb::open_at(db_path).unwrap(),
        );
        assert_eq!(second.restore().unwrap(), 1);
        assert!(second.find("acme/widget").unwrap().installed);
        assert!(second.read_registry(|registry| registry.is_skipped("acme/broken")));
    }
}
