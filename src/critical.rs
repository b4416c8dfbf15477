//! Critical Repository Monitor - forced removal of repositories flagged unsafe
//!
//! A sweep reads the curated critical list, force-uninstalls every listed
//! repository that is installed and has not been seen before, and records
//! each entry with an acknowledgement flag. Uninstalls run on the monitor's
//! own task queue so they never wait behind regular background work.

use crate::error::{Error, Result};
use crate::events::{EventBus, RepositoryEvent};
use crate::host::ContentHost;
use crate::queue::{Task, TaskQueue};
use crate::state::StateDb;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Entry of the critical list, also the stored acknowledgement record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalEntry {
    pub repository: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl CriticalEntry {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reason: None,
            link: None,
            acknowledged: false,
        }
    }
}

/// What the monitor needs from whoever owns the repositories
#[async_trait]
pub trait RepositoryRemover: Send + Sync {
    fn is_installed(&self, full_name: &str) -> bool;

    /// Force-uninstall, bypassing the regular queue
    async fn remove(&self, full_name: &str) -> Result<()>;

    /// Record the entry in the removed list as `critical`
    fn mark_critical(&self, entry: &CriticalEntry);
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub listed: usize,
    pub forced: Vec<String>,
    pub failed: Vec<String>,
    pub restart_required: bool,
}

pub struct CriticalRepositoryMonitor {
    host: Arc<dyn ContentHost>,
    store: Arc<Mutex<StateDb>>,
    remover: Arc<dyn RepositoryRemover>,
    events: EventBus,
    queue: Arc<TaskQueue>,
}

impl CriticalRepositoryMonitor {
    pub fn new(
        host: Arc<dyn ContentHost>,
        store: Arc<Mutex<StateDb>>,
        remover: Arc<dyn RepositoryRemover>,
        events: EventBus,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            host,
            store,
            remover,
            events,
            queue,
        }
    }

    fn with_store<T>(&self, action: impl FnOnce(&StateDb) -> anyhow::Result<T>) -> Result<T> {
        let store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        action(&store).map_err(Error::from)
    }

    /// Run one sweep. A failed or unchanged fetch is a no-op.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let critical = match self.host.fetch_critical().await {
            Ok(critical) => critical,
            Err(Error::NotModified) => {
                debug!("Critical list not modified");
                return Ok(SweepReport::default());
            }
            Err(e) => {
                warn!("Could not fetch critical repositories: {}", e);
                return Ok(SweepReport::default());
            }
        };

        let stored: HashMap<String, CriticalEntry> = self
            .with_store(|store| store.load_critical())?
            .into_iter()
            .map(|entry| (entry.repository.to_lowercase(), entry))
            .collect();

        let mut report = SweepReport {
            listed: critical.len(),
            ..SweepReport::default()
        };
        let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut group: Vec<Task> = Vec::new();
        let mut records = Vec::with_capacity(critical.len());

        for entry in critical {
            self.remover.mark_critical(&entry);

            let acknowledged = match stored.get(&entry.repository.to_lowercase()) {
                Some(previous) => previous.acknowledged,
                None if self.remover.is_installed(&entry.repository) => {
                    error!(
                        "Removing critical repository {}: {}",
                        entry.repository,
                        entry.reason.as_deref().unwrap_or("no reason given")
                    );
                    report.forced.push(entry.repository.clone());

                    let remover = self.remover.clone();
                    let failed = failed.clone();
                    let full_name = entry.repository.clone();
                    group.push(Box::pin(async move {
                        if let Err(e) = remover.remove(&full_name).await {
                            error!("Forced removal of {} failed: {}", full_name, e);
                            failed
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push(full_name);
                        }
                    }));
                    false
                }
                None => true,
            };

            records.push(CriticalEntry {
                acknowledged,
                ..entry
            });
        }

        if !group.is_empty() {
            self.queue.add(group);
            while self.queue.has_pending() {
                match self.queue.execute(None).await {
                    Ok(_) => {}
                    Err(Error::StillInProgress) => {
                        warn!("Critical queue already running, leaving removals queued");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Failed removals do not block persisting the batch
        self.with_store(|store| store.save_critical(&records))?;

        report.failed = std::mem::take(
            &mut *failed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if !report.forced.is_empty() {
            report.restart_required = true;
            self.events.emit(RepositoryEvent::RestartRequired {
                reason: format!(
                    "critical repositories removed: {}",
                    report.forced.join(", ")
                ),
            });
        }

        info!(
            "Critical sweep: {} listed, {} removed, {} failed",
            report.listed,
            report.forced.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Stored records not yet acknowledged
    pub fn pending_acknowledgements(&self) -> Result<Vec<CriticalEntry>> {
        Ok(self
            .with_store(|store| store.load_critical())?
            .into_iter()
            .filter(|entry| !entry.acknowledged)
            .collect())
    }

    /// Recorded repositories that are still installed, i.e. a forced removal failed
    pub fn still_installed(&self) -> Result<Vec<String>> {
        Ok(self
            .with_store(|store| store.load_critical())?
            .into_iter()
            .filter(|entry| self.remover.is_installed(&entry.repository))
            .map(|entry| entry.repository)
            .collect())
    }

    /// Log and announce unacknowledged removals.
    pub fn report_pending(&self) -> Result<usize> {
        let stuck = self.still_installed()?;
        if !stuck.is_empty() {
            error!(
                "URGENT: critical repositories are still installed, uninstall them manually: {}",
                stuck.join(", ")
            );
        }

        let pending = self.pending_acknowledgements()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let names: Vec<String> = pending.iter().map(|entry| entry.repository.clone()).collect();
        error!(
            "URGENT: critical repositories were removed and need acknowledgement: {}",
            names.join(", ")
        );
        self.events.emit(RepositoryEvent::CriticalPending { repositories: names });
        Ok(pending.len())
    }

    /// Mark a stored record acknowledged. Returns false if unknown.
    pub fn acknowledge(&self, full_name: &str) -> Result<bool> {
        self.with_store(|store| {
            let mut records = store.load_critical()?;
            let Some(record) = records
                .iter_mut()
                .find(|entry| entry.repository.eq_ignore_ascii_case(full_name))
            else {
                return Ok(false);
            };
            record.acknowledged = true;
            store.save_critical(&records)?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockContentHost;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingRemover {
        installed: HashSet<String>,
        failing: HashSet<String>,
        removed: Mutex<Vec<String>>,
        marked: Mutex<Vec<String>>,
    }

    impl RecordingRemover {
        fn installed(names: &[&str]) -> Self {
            Self {
                installed: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RepositoryRemover for RecordingRemover {
        fn is_installed(&self, full_name: &str) -> bool {
            self.installed.contains(full_name)
        }

        async fn remove(&self, full_name: &str) -> Result<()> {
            self.removed.lock().unwrap().push(full_name.to_string());
            if self.failing.contains(full_name) {
                return Err(Error::Host("boom".to_string()));
            }
            Ok(())
        }

        fn mark_critical(&self, entry: &CriticalEntry) {
            self.marked.lock().unwrap().push(entry.repository.clone());
        }
    }

    fn monitor(
        critical: Vec<CriticalEntry>,
        remover: Arc<RecordingRemover>,
    ) -> (CriticalRepositoryMonitor, Arc<Mutex<StateDb>>) {
        let mut host = MockContentHost::new();
        host.expect_fetch_critical()
            .returning(move || Ok(critical.clone()));
        let store = Arc::new(Mutex::new(StateDb::open_in_memory().unwrap()));
        let monitor = CriticalRepositoryMonitor::new(
            Arc::new(host),
            store.clone(),
            remover,
            EventBus::default(),
            Arc::new(TaskQueue::new()),
        );
        (monitor, store)
    }

    #[tokio::test]
    async fn test_installed_unseen_repository_is_removed_once() {
        let remover = Arc::new(RecordingRemover::installed(&["acme/evil"]));
        let (monitor, store) = monitor(vec![CriticalEntry::new("acme/evil")], remover.clone());

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.forced, vec!["acme/evil".to_string()]);
        assert!(report.restart_required);
        assert_eq!(remover.removed(), vec!["acme/evil".to_string()]);

        let stored = store.lock().unwrap().load_critical().unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].acknowledged);

        // Already recorded: no second removal
        let report = monitor.sweep().await.unwrap();
        assert!(report.forced.is_empty());
        assert_eq!(remover.removed().len(), 1);
        assert_eq!(monitor.pending_acknowledgements().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_not_installed_is_never_removed() {
        let remover = Arc::new(RecordingRemover::default());
        let (monitor, store) = monitor(vec![CriticalEntry::new("acme/evil")], remover.clone());

        let report = monitor.sweep().await.unwrap();
        assert!(report.forced.is_empty());
        assert!(!report.restart_required);
        assert!(remover.removed().is_empty());
        assert_eq!(*remover.marked.lock().unwrap(), vec!["acme/evil".to_string()]);

        let stored = store.lock().unwrap().load_critical().unwrap();
        assert!(stored[0].acknowledged);
    }

    #[tokio::test]
    async fn test_failed_removal_still_persists_batch() {
        let remover = Arc::new(RecordingRemover {
            installed: ["acme/evil", "acme/worse"].iter().map(|n| n.to_string()).collect(),
            failing: ["acme/evil"].iter().map(|n| n.to_string()).collect(),
            ..RecordingRemover::default()
        });
        let (monitor, store) = monitor(
            vec![CriticalEntry::new("acme/evil"), CriticalEntry::new("acme/worse")],
            remover,
        );

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.failed, vec!["acme/evil".to_string()]);
        assert_eq!(store.lock().unwrap().load_critical().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_removal_is_reported_as_still_installed() {
        let remover = Arc::new(RecordingRemover {
            installed: ["acme/evil"].iter().map(|n| n.to_string()).collect(),
            failing: ["acme/evil"].iter().map(|n| n.to_string()).collect(),
            ..RecordingRemover::default()
        });
        let (monitor, _store) = monitor(vec![CriticalEntry::new("acme/evil")], remover.clone());
        assert!(monitor.still_installed().unwrap().is_empty());

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.failed, vec!["acme/evil".to_string()]);
        assert_eq!(monitor.still_installed().unwrap(), vec!["acme/evil".to_string()]);
        assert_eq!(monitor.report_pending().unwrap(), 1);

        // Recorded entries are not retried by later sweeps
        monitor.sweep().await.unwrap();
        assert_eq!(remover.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_noop() {
        let mut host = MockContentHost::new();
        host.expect_fetch_critical()
            .returning(|| Err(Error::NotModified));
        let monitor = CriticalRepositoryMonitor::new(
            Arc::new(host),
            Arc::new(Mutex::new(StateDb::open_in_memory().unwrap())),
            Arc::new(RecordingRemover::installed(&["acme/evil"])),
            EventBus::default(),
            Arc::new(TaskQueue::new()),
        );

        assert_eq!(monitor.sweep().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_acknowledge_and_report() {
        let remover = Arc::new(RecordingRemover::installed(&["acme/evil"]));
        let (monitor, _store) = monitor(vec![CriticalEntry::new("acme/evil")], remover);
        let mut receiver = monitor.events.subscribe();

        monitor.sweep().await.unwrap();
        assert_eq!(monitor.report_pending().unwrap(), 1);
        let events = crate::events::drain(&mut receiver);
        assert!(events
            .iter()
            .any(|event| matches!(event, RepositoryEvent::CriticalPending { .. })));

        assert!(monitor.acknowledge("ACME/evil").unwrap());
        assert!(!monitor.acknowledge("acme/unknown").unwrap());
        assert_eq!(monitor.report_pending().unwrap(), 0);
    }
}
