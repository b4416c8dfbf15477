//! Filesystem helpers: protected roots, copy, move and recursive removal.

use crate::error::{Error, Result};
use path_clean::PathClean;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Category roots under the config directory that must never be removed
/// wholesale, plus the config directory itself.
pub fn protected_roots(config_root: &Path) -> Vec<PathBuf> {
    [
        "",
        "custom_components",
        "www",
        "www/community",
        "themes",
        "python_scripts",
        "custom_templates",
        "appdaemon",
        "appdaemon/apps",
        "netdaemon",
        "netdaemon/apps",
    ]
    .iter()
    .map(|relative| config_root.join(relative).clean())
    .collect()
}

/// Whether `path` may be removed, i.e. it is not one of the protected roots.
pub fn is_safe(protected: &[PathBuf], path: &Path) -> bool {
    let path = path.clean();
    !protected.iter().any(|root| *root == path)
}

/// Whether `path` lies strictly below `base` once both are cleaned.
pub fn is_within(base: &Path, path: &Path) -> bool {
    let (base, path) = (base.clean(), path.clean());
    path != base && path.starts_with(&base)
}

/// Whether `name` is exactly one plain path component (no separators, no
/// root, no `.` or `..`).
pub fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Whether `name` is a non-empty relative path made of plain components only,
/// so joining it onto a directory stays inside that directory.
pub fn is_relative_inside(name: &str) -> bool {
    let path = Path::new(name);
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Copy a file or a directory tree to `destination`, creating parents.
pub fn copy_path(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    if source.is_dir() {
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &destination.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, destination)?;
    }
    Ok(())
}

/// Remove a file or a directory tree. A missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Move a file or a directory tree to `destination`, replacing it.
///
/// Falls back to copy and remove when a rename is not possible, e.g.
/// across filesystems.
pub fn move_path(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_path(destination)?;

    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            copy_path(source, destination)?;
            remove_path(source)
        }
    }
}

pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Run blocking filesystem work off the async executor.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}
