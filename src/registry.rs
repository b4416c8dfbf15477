//! In-memory registry of known repositories
//!
//! Records are keyed by numeric id with a secondary index on the lower-cased
//! full name. The registry also holds the bookkeeping sets the orchestrator
//! consults before queuing background work: skipped, archived, removed and
//! renamed repositories.

use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::state::RegistrySnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Entry of the curated list of repositories withdrawn from the default index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedRepository {
    pub repository: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// `archived`, `not_compliant`, `critical`, `dev`, `broken` or `remove`
    #[serde(default = "default_removal_type")]
    pub removal_type: String,
    #[serde(default)]
    pub acknowledged: bool,
}

fn default_removal_type() -> String {
    "remove".to_string()
}

impl RemovedRepository {
    pub fn new(repository: impl Into<String>, removal_type: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reason: None,
            link: None,
            removal_type: removal_type.into(),
            acknowledged: false,
        }
    }

    /// Only plain `remove` entries may still be added by hand.
    pub fn blocks_registration(&self) -> bool {
        self.removal_type != "remove"
    }
}

/// Which bookkeeping set a stored value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySet {
    Skip,
    Archived,
}

impl RegistrySet {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrySet::Skip => "skip",
            RegistrySet::Archived => "archived",
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    by_id: HashMap<u64, Repository>,
    by_name: HashMap<String, u64>,
    skip: BTreeSet<String>,
    archived: BTreeSet<String>,
    removed: Vec<RemovedRepository>,
    /// Old lower-cased name to current full name
    renamed: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Add or replace a record.
    ///
    /// The record must carry an id. A record whose name changed is re-keyed
    /// and the old name remembered as renamed.
    pub fn insert(&mut self, repository: Repository) -> Result<()> {
        if repository.id == 0 {
            return Err(Error::store(format!(
                "refusing to register {} without an id",
                repository.full_name
            )));
        }

        let key = repository.key();
        if let Some(&existing) = self.by_name.get(&key) {
            if existing != repository.id {
                return Err(Error::RepositoryIdChanged {
                    full_name: repository.full_name.clone(),
                    stored: existing,
                    incoming: repository.id,
                });
            }
        }

        if let Some(previous) = self.by_id.get(&repository.id) {
            let old_key = previous.key();
            if old_key != key {
                info!("Re-keying {} as {}", previous.full_name, repository.full_name);
                self.by_name.remove(&old_key);
                self.renamed.insert(old_key, repository.full_name.clone());
            }
        }

        self.by_name.insert(key, repository.id);
        self.by_id.insert(repository.id, repository);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&Repository> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Repository> {
        self.by_id.get_mut(&id)
    }

    /// Look up by full name, case-insensitively, following renames.
    pub fn find(&self, full_name: &str) -> Option<&Repository> {
        let key = full_name.to_lowercase();
        let id = self.by_name.get(&key).or_else(|| {
            self.renamed
                .get(&key)
                .and_then(|current| self.by_name.get(&current.to_lowercase()))
        })?;
        self.by_id.get(id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Repository> {
        let repository = self.by_id.remove(&id)?;
        self.by_name.remove(&repository.key());
        debug!("Unregistered {}", repository.full_name);
        Some(repository)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.by_id.values()
    }

    pub fn installed(&self) -> impl Iterator<Item = &Repository> {
        self.by_id.values().filter(|repository| repository.installed)
    }

    pub fn skip(&mut self, full_name: &str) {
        self.skip.insert(full_name.to_lowercase());
    }

    pub fn unskip(&mut self, full_name: &str) -> bool {
        self.skip.remove(&full_name.to_lowercase())
    }

    pub fn is_skipped(&self, full_name: &str) -> bool {
        self.skip.contains(&full_name.to_lowercase())
    }

    pub fn mark_archived(&mut self, full_name: &str) {
        self.archived.insert(full_name.to_lowercase());
    }

    pub fn is_archived(&self, full_name: &str) -> bool {
        self.archived.contains(&full_name.to_lowercase())
    }

    pub fn set(&self, kind: RegistrySet) -> Vec<String> {
        match kind {
            RegistrySet::Skip => self.skip.iter().cloned().collect(),
            RegistrySet::Archived => self.archived.iter().cloned().collect(),
        }
    }

    pub fn restore_set(&mut self, kind: RegistrySet, values: Vec<String>) {
        let target = match kind {
            RegistrySet::Skip => &mut self.skip,
            RegistrySet::Archived => &mut self.archived,
        };
        target.extend(values.into_iter().map(|value| value.to_lowercase()));
    }

    pub fn renamed(&self) -> &HashMap<String, String> {
        &self.renamed
    }

    pub fn restore_renamed(&mut self, renamed: HashMap<String, String>) {
        self.renamed.extend(renamed);
    }

    pub fn removed(&self) -> &[RemovedRepository] {
        &self.removed
    }

    pub fn removed_entry(&self, full_name: &str) -> Option<&RemovedRepository> {
        self.removed
            .iter()
            .find(|entry| entry.repository.eq_ignore_ascii_case(full_name))
    }

    /// Add or replace a removed-list entry.
    pub fn set_removed(&mut self, entry: RemovedRepository) {
        match self
            .removed
            .iter_mut()
            .find(|existing| existing.repository.eq_ignore_ascii_case(&entry.repository))
        {
            Some(existing) => *existing = entry,
            None => self.removed.push(entry),
        }
    }

    /// Everything that is persisted
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut repositories: Vec<Repository> = self.by_id.values().cloned().collect();
        repositories.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        RegistrySnapshot {
            repositories,
            skip: self.set(RegistrySet::Skip),
            archived: self.set(RegistrySet::Archived),
            removed: self.removed.clone(),
            renamed: self.renamed.clone(),
        }
    }

    /// Load a stored snapshot. Returns the number of records restored.
    pub fn restore(&mut self, snapshot: RegistrySnapshot) -> usize {
        let mut restored = 0;
        for repository in snapshot.repositories {
            let full_name = repository.full_name.clone();
            match self.insert(repository) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Dropping stored record for {}: {}", full_name, e),
            }
        }
        self.restore_set(RegistrySet::Skip, snapshot.skip);
        self.restore_set(RegistrySet::Archived, snapshot.archived);
        for entry in snapshot.removed {
            self.set_removed(entry);
        }
        self.restore_renamed(snapshot.renamed);
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::category::Category;
    use assert_matches::assert_matches;

    fn repo(full_name: &str, id: u64) -> Repository {
        let mut repository = Repository::new(full_name, Category::Integration);
        repository.id = id;
        repository
    }

    #[test]
    fn test_insert_and_find_case_insensitive() {
        let mut registry = Registry::new();
        registry.insert(repo("Acme/Widget", 1)).unwrap();

        assert_eq!(registry.find("acme/widget").map(|r| r.id), Some(1));
        assert_eq!(registry.get(1).map(|r| r.full_name.as_str()), Some("Acme/Widget"));
        assert!(registry.find("acme/other").is_none());
    }

    #[test]
    fn test_insert_without_id_is_rejected() {
        let mut registry = Registry::new();
        assert!(registry.insert(repo("acme/widget", 0)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_name_claimed_by_other_id() {
        let mut registry = Registry::new();
        registry.insert(repo("acme/widget", 1)).unwrap();
        assert_matches!(
            registry.insert(repo("acme/widget", 2)),
            Err(Error::RepositoryIdChanged {
                stored: 1,
                incoming: 2,
                ..
            })
        );
    }

    #[test]
    fn test_rename_rekeys_and_remembers() {
        let mut registry = Registry::new();
        registry.insert(repo("acme/widget", 1)).unwrap();
        registry.insert(repo("acme-labs/widget", 1)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.find("acme/widget").map(|r| r.full_name.as_str()),
            Some("acme-labs/widget")
        );
        assert_eq!(
            registry.renamed().get("acme/widget").map(String::as_str),
            Some("acme-labs/widget")
        );
    }

    #[test]
    fn test_skip_set() {
        let mut registry = Registry::new();
        registry.skip("Acme/Broken");
        assert!(registry.is_skipped("acme/broken"));
        assert!(registry.unskip("acme/BROKEN"));
        assert!(!registry.is_skipped("acme/broken"));
    }

    #[test]
    fn test_removed_entries() {
        let mut registry = Registry::new();
        registry.set_removed(RemovedRepository::new("acme/gone", "remove"));
        registry.set_removed(RemovedRepository::new("Acme/Gone", "critical"));

        assert_eq!(registry.removed().len(), 1);
        let entry = registry.removed_entry("acme/gone").unwrap();
        assert!(entry.blocks_registration());
        assert!(!RemovedRepository::new("x/y", "remove").blocks_registration());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut registry = Registry::new();
        registry.insert(repo("acme/widget", 1)).unwrap();
        registry.skip("acme/broken");
        registry.mark_archived("acme/dusty");
        registry.set_removed(RemovedRepository::new("acme/gone", "remove"));

        let mut snapshot = registry.snapshot();
        snapshot.repositories.push(repo("acme/no-id", 0));

        let mut restored = Registry::new();
        assert_eq!(restored.restore(snapshot), 1);
        assert!(restored.find("acme/widget").is_some());
        assert!(restored.is_skipped("acme/broken"));
        assert!(restored.is_archived("acme/dusty"));
        assert!(restored.removed_entry("acme/gone").is_some());
    }

    #[test]
    fn test_removed_entry_deserializes_with_defaults() {
        let entry: RemovedRepository =
            serde_json::from_str(r#"{"repository": "acme/gone", "reason": "Abandoned"}"#).unwrap();
        assert_eq!(entry.removal_type, "remove");
        assert!(!entry.acknowledged);
    }
}
