//! Backup Manager - Snapshot installed content around destructive writes
//!
//! Usage contract for an install:
//! 1. `create()` before writing
//! 2. on failure `restore()` then `cleanup()`
//! 3. on success `cleanup()` only
//!
//! A snapshot moves the content out of the way (copy, then remove the
//! original), so the write always starts from an empty target.

use crate::error::{Error, Result};
use crate::paths::{self, copy_path, move_path, remove_path};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BackupManager {
    source_path: PathBuf,
    snapshot_path: PathBuf,
    protected: Vec<PathBuf>,
}

impl BackupManager {
    /// Snapshot `source_path` into `scratch_dir`, keeping its basename.
    pub fn new(
        source_path: impl Into<PathBuf>,
        scratch_dir: &Path,
        protected: Vec<PathBuf>,
    ) -> Self {
        let source_path = source_path.into();
        let basename = source_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "content".into());

        Self {
            snapshot_path: scratch_dir.join(basename),
            source_path,
            protected,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn has_snapshot(&self) -> bool {
        paths::exists(&self.snapshot_path)
    }

    /// Move the current content into the snapshot.
    ///
    /// Returns `false` without touching anything when the source is absent or
    /// is a protected root.
    pub fn create(&self) -> Result<bool> {
        if !paths::exists(&self.source_path) {
            debug!("Nothing to back up at {}", self.source_path.display());
            return Ok(false);
        }
        if !paths::is_safe(&self.protected, &self.source_path) {
            warn!(
                "Refusing to back up protected path {}",
                self.source_path.display()
            );
            return Ok(false);
        }

        remove_path(&self.snapshot_path)
            .map_err(|e| {
                Error::io(
                    format!("clear stale snapshot {}", self.snapshot_path.display()),
                    e,
                )
            })?;
        copy_path(&self.source_path, &self.snapshot_path).map_err(|e| {
            Error::io(
                format!(
                    "copy {} to {}",
                    self.source_path.display(),
                    self.snapshot_path.display()
                ),
                e,
            )
        })?;
        remove_path(&self.source_path)
            .map_err(|e| Error::io(format!("remove {}", self.source_path.display()), e))?;

        if paths::exists(&self.source_path) {
            return Err(Error::io(
                format!("remove {}", self.source_path.display()),
                std::io::Error::new(std::io::ErrorKind::Other, "path still present after removal"),
            ));
        }

        info!(
            "Backup of {} created at {}",
            self.source_path.display(),
            self.snapshot_path.display()
        );
        Ok(true)
    }

    /// Replace whatever is at the source path with the snapshot. The
    /// snapshot is moved back, so a following `cleanup()` has nothing left
    /// to remove.
    ///
    /// Returns `false` when there is no snapshot to restore.
    pub fn restore(&self) -> Result<bool> {
        if !self.has_snapshot() {
            return Ok(false);
        }

        move_path(&self.snapshot_path, &self.source_path)
            .map_err(|e| Error::io(format!("restore {}", self.source_path.display()), e))?;

        info!("Restored {} from backup", self.source_path.display());
        Ok(true)
    }

    /// Remove the snapshot if present.
    pub fn cleanup(&self) -> Result<()> {
        if !self.has_snapshot() {
            return Ok(());
        }
        remove_path(&self.snapshot_path)
            .map_err(|e| Error::io(format!("remove backup {}", self.snapshot_path.display()), e))?;
        debug!("Backup {} removed", self.snapshot_path.display());
        Ok(())
    }

    pub async fn create_async(&self) -> Result<bool> {
        let backup = self.clone();
        paths::blocking(move || backup.create()).await
    }

    pub async fn restore_async(&self) -> Result<bool> {
        let backup = self.clone();
        paths::blocking(move || backup.restore()).await
    }

    pub async fn cleanup_async(&self) -> Result<()> {
        let backup = self.clone();
        paths::blocking(move || backup.cleanup()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn snapshot_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                if path.is_dir() {
                    out.insert(relative, Vec::new());
                    walk(root, &path, out);
                } else {
                    out.insert(relative, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let config_root = temp.path().join("config");
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(config_root.join("custom_components")).unwrap();
        (temp, config_root, scratch)
    }

    #[test]
    fn test_create_and_restore_missing_source_are_noops() {
        let (_temp, config_root, scratch) = setup();
        let backup = BackupManager::new(
            config_root.join("custom_components/missing"),
            &scratch,
            paths::protected_roots(&config_root),
        );

        assert!(!backup.create().unwrap());
        assert!(!backup.restore().unwrap());
        backup.cleanup().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let (_temp, config_root, scratch) = setup();
        let source = config_root.join("custom_components/widget");
        fs::create_dir_all(source.join("translations")).unwrap();
        fs::write(source.join("__init__.py"), b"DOMAIN = 'widget'\n").unwrap();
        fs::write(source.join("manifest.json"), br#"{"domain": "widget"}"#).unwrap();
        fs::write(source.join("translations/en.json"), [0u8, 159, 146, 150]).unwrap();
        let before = snapshot_tree(&source);

        let backup = BackupManager::new(&source, &scratch, paths::protected_roots(&config_root));
        assert!(backup.create().unwrap());
        assert!(!source.exists());
        assert!(backup.has_snapshot());

        assert!(backup.restore().unwrap());
        backup.cleanup().unwrap();

        assert_eq!(snapshot_tree(&source), before);
        assert!(!backup.has_snapshot());
    }

    #[test]
    fn test_restore_replaces_partial_write() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config_root = temp.child("config");
        config_root.child("www/community/card/card.js").write_str("v1").unwrap();
        let source = config_root.child("www/community/card");

        let backup = BackupManager::new(
            source.path(),
            temp.child("scratch").path(),
            paths::protected_roots(config_root.path()),
        );
        backup.create().unwrap();

        source.child("card.js").write_str("partial").unwrap();
        source.child("stray.js").write_str("junk").unwrap();

        backup.restore().unwrap();
        backup.cleanup().unwrap();

        source.child("card.js").assert("v1");
        source.child("stray.js").assert(predicate::path::missing());
    }

    #[test]
    fn test_single_file_round_trip() {
        let (_temp, config_root, scratch) = setup();
        let file = config_root.join("python_scripts/hello.py");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "print('hello')").unwrap();

        let backup = BackupManager::new(&file, &scratch, paths::protected_roots(&config_root));
        assert!(backup.create().unwrap());
        assert!(!file.exists());
        assert!(backup.snapshot_path().is_file());

        fs::write(&file, "broken").unwrap();
        backup.restore().unwrap();
        backup.cleanup().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "print('hello')");
    }

    #[test]
    fn test_protected_root_is_never_moved() {
        let (_temp, config_root, scratch) = setup();
        let root = config_root.join("custom_components");
        let backup = BackupManager::new(&root, &scratch, paths::protected_roots(&config_root));

        assert!(!backup.create().unwrap());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_async_wrappers() {
        let (_temp, config_root, scratch) = setup();
        let source = config_root.join("custom_components/widget");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("sensor.py"), "x = 1").unwrap();

        let backup = BackupManager::new(&source, &scratch, paths::protected_roots(&config_root));
        assert!(backup.create_async().await.unwrap());
        backup.cleanup_async().await.unwrap();
        assert!(!backup.restore_async().await.unwrap());
    }
}
