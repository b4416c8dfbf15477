//! Category layout rules
//!
//! Where each kind of content lives remotely and locally, how a repository of
//! that kind is validated against its file tree, and what the host must do
//! after content changes.

use super::{InstallOutcome, Repository};
use crate::error::{Error, Result};
use crate::host::TreeEntry;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of installable content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Integration,
    Plugin,
    Theme,
    PythonScript,
    Template,
    Appdaemon,
}

/// Follow-up required from the host after content changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAction {
    Nothing,
    /// Reload a host service without restarting
    Reload(String),
    /// The host must restart
    Restart,
}

/// `manifest.json` of an integration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IntegrationManifest {
    pub domain: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub codeowners: Vec<String>,
    #[serde(default)]
    pub config_flow: bool,
    pub version: Option<String>,
}

impl Category {
    pub fn all() -> &'static [Category] {
        &[
            Category::Integration,
            Category::Plugin,
            Category::Theme,
            Category::PythonScript,
            Category::Template,
            Category::Appdaemon,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Integration => "integration",
            Category::Plugin => "plugin",
            Category::Theme => "theme",
            Category::PythonScript => "python_script",
            Category::Template => "template",
            Category::Appdaemon => "appdaemon",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "integration" => Some(Category::Integration),
            "plugin" | "lovelace" => Some(Category::Plugin),
            "theme" => Some(Category::Theme),
            "python_script" => Some(Category::PythonScript),
            "template" => Some(Category::Template),
            "appdaemon" => Some(Category::Appdaemon),
            _ => None,
        }
    }

    /// Content is one file rather than a directory
    pub fn is_single_file(&self) -> bool {
        matches!(self, Category::PythonScript | Category::Template)
    }

    /// Categories whose content may be shipped as release assets
    pub fn uses_release_assets(&self) -> bool {
        matches!(self, Category::Plugin | Category::Theme)
    }

    /// Directory under the config root holding this category
    pub fn base_directory(&self, config_root: &Path) -> PathBuf {
        match self {
            Category::Integration => config_root.join("custom_components"),
            Category::Plugin => config_root.join("www").join("community"),
            Category::Theme => config_root.join("themes"),
            Category::PythonScript => config_root.join("python_scripts"),
            Category::Template => config_root.join("custom_templates"),
            Category::Appdaemon => config_root.join("appdaemon").join("apps"),
        }
    }

    /// Directory the content is written into
    pub fn local_path(&self, config_root: &Path, repository: &Repository) -> PathBuf {
        let base = self.base_directory(config_root);
        match self {
            Category::Integration => base.join(
                repository
                    .domain
                    .clone()
                    .unwrap_or_else(|| repository.name().to_string()),
            ),
            Category::Plugin => base.join(repository.name()),
            Category::Theme => base.join(
                repository
                    .file_name
                    .as_deref()
                    .map(|name| name.trim_end_matches(".yaml").to_string())
                    .unwrap_or_else(|| repository.name().to_string()),
            ),
            Category::PythonScript | Category::Template => base,
            Category::Appdaemon => base.join(
                repository
                    .content_path
                    .rsplit('/')
                    .next()
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| repository.name()),
            ),
        }
    }

    /// The path an uninstall removes: the file for single-file content, the
    /// content directory otherwise
    pub fn install_target(&self, config_root: &Path, repository: &Repository) -> PathBuf {
        let local = self.local_path(config_root, repository);
        match (self.is_single_file(), repository.file_name.as_deref()) {
            (true, Some(file_name)) => local.join(file_name),
            _ => local,
        }
    }

    /// Check the remote tree and record where the content lives.
    ///
    /// Returns every reason the layout is not usable; an empty list means the
    /// repository is compliant.
    pub fn inspect(&self, repository: &mut Repository, tree: &[TreeEntry]) -> Vec<String> {
        let in_root = repository.manifest.content_in_root;
        let mut reasons = Vec::new();

        match self {
            Category::Integration => {
                let manifest = tree.iter().find(|entry| {
                    !entry.is_directory
                        && entry.filename() == "manifest.json"
                        && if in_root {
                            entry.parent().is_empty()
                        } else {
                            entry.parent().starts_with("custom_components/")
                                && entry.parent().matches('/').count() == 1
                        }
                });
                match manifest {
                    Some(entry) => repository.content_path = entry.parent().to_string(),
                    None => reasons.push(format!(
                        "Repository structure for {} is not compliant",
                        repository.full_name
                    )),
                }
            }
            Category::Plugin => {
                let names = plugin_candidates(repository);
                let found = ["dist", ""]
                    .iter()
                    .filter(|dir| !(in_root && !dir.is_empty()))
                    .find_map(|dir| {
                        tree.iter()
                            .filter(|entry| !entry.is_directory && entry.parent() == *dir)
                            .find(|entry| {
                                names.iter().any(|name| entry.filename() == name.as_str())
                            })
                            .map(|entry| (dir.to_string(), entry.filename().to_string()))
                    });
                let asset = repository
                    .release_assets()
                    .iter()
                    .find(|asset| names.iter().any(|name| asset.name == *name))
                    .map(|asset| asset.name.clone());

                match (found, asset) {
                    (Some((dir, file)), _) => {
                        repository.content_path = dir;
                        repository.file_name = Some(file);
                    }
                    (None, Some(file)) => {
                        repository.content_path = String::new();
                        repository.file_name = Some(file);
                    }
                    (None, None) => reasons.push(format!(
                        "Repository structure for {} is not compliant",
                        repository.full_name
                    )),
                }
            }
            Category::Theme => {
                let dir = if in_root { "" } else { "themes" };
                match first_with_extension(tree, dir, ".yaml") {
                    Some(file) => {
                        repository.content_path = dir.to_string();
                        repository.file_name = Some(file);
                    }
                    None => reasons.push(format!(
                        "Repository structure for {} is not compliant",
                        repository.full_name
                    )),
                }
            }
            Category::PythonScript => {
                let dir = if in_root { "" } else { "python_scripts" };
                match first_with_extension(tree, dir, ".py") {
                    Some(file) => {
                        repository.content_path = dir.to_string();
                        repository.file_name = Some(file);
                    }
                    None => reasons.push(format!(
                        "Repository structure for {} is not compliant",
                        repository.full_name
                    )),
                }
            }
            Category::Template => match repository.manifest.filename.clone() {
                Some(filename)
                    if filename.ends_with(".jinja")
                        && paths::is_single_component(&filename)
                        && tree
                            .iter()
                            .any(|entry| !entry.is_directory && entry.path == filename) =>
                {
                    repository.content_path = String::new();
                    repository.file_name = Some(filename);
                }
                Some(filename) => reasons.push(format!(
                    "{} is not a .jinja file in the repository root",
                    filename
                )),
                None => reasons.push("hacs.json must declare 'filename' for templates".to_string()),
            },
            Category::Appdaemon => {
                let app = tree
                    .iter()
                    .find(|entry| entry.is_directory && entry.parent() == "apps");
                match app {
                    Some(entry) => repository.content_path = entry.path.clone(),
                    None => reasons.push(format!(
                        "Repository structure for {} is not compliant",
                        repository.full_name
                    )),
                }
            }
        }

        reasons
    }

    /// Checks that must pass before any file is written
    pub fn before_install(&self, repository: &Repository) -> Result<()> {
        let missing = match self {
            Category::Integration if repository.domain.is_none() => {
                Some("integration domain is unknown".to_string())
            }
            _ if self.is_single_file() && repository.file_name.is_none() => {
                Some("content file name is unknown".to_string())
            }
            _ => None,
        };

        match missing {
            Some(reason) => Err(Error::ValidationFailed {
                full_name: repository.full_name.clone(),
                reasons: vec![reason],
            }),
            None => Ok(()),
        }
    }

    /// Host follow-up after content was written
    pub fn after_install(&self, repository: &mut Repository, kind: InstallOutcome) -> PostAction {
        match self {
            Category::Integration => {
                // Reinstalling replaces code the host already loaded.
                repository.pending_restart = kind == InstallOutcome::Reinstall;
                if repository.config_flow {
                    PostAction::Reload(repository.domain.clone().unwrap_or_default())
                } else {
                    PostAction::Restart
                }
            }
            Category::Theme => PostAction::Reload("frontend.reload_themes".to_string()),
            Category::PythonScript => PostAction::Reload("python_script.reload".to_string()),
            Category::Plugin | Category::Template | Category::Appdaemon => PostAction::Nothing,
        }
    }

    /// Host follow-up after content was removed
    pub fn after_uninstall(&self, repository: &mut Repository) -> PostAction {
        match self {
            Category::Integration => {
                if repository.config_flow {
                    PostAction::Reload(repository.domain.clone().unwrap_or_default())
                } else {
                    PostAction::Restart
                }
            }
            Category::Theme => PostAction::Reload("frontend.reload_themes".to_string()),
            Category::PythonScript => PostAction::Reload("python_script.reload".to_string()),
            Category::Plugin | Category::Template | Category::Appdaemon => PostAction::Nothing,
        }
    }
}

impl IntegrationManifest {
    /// Parse `manifest.json` and copy its fields onto the repository
    pub fn apply(contents: &str, repository: &mut Repository) -> std::result::Result<(), String> {
        let manifest: IntegrationManifest = serde_json::from_str(contents)
            .map_err(|e| format!("manifest.json is not valid JSON: {}", e))?;

        let domain = manifest
            .domain
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| "Missing expected key 'domain' in manifest.json".to_string())?;
        if !paths::is_single_component(&domain) {
            return Err(format!(
                "Domain '{}' in manifest.json is not a plain directory name",
                domain
            ));
        }

        repository.domain = Some(domain);
        repository.manifest_name = manifest.name;
        repository.authors = manifest.codeowners;
        repository.config_flow = manifest.config_flow;
        Ok(())
    }
}

/// File names a plugin's main module may have
fn plugin_candidates(repository: &Repository) -> Vec<String> {
    if let Some(filename) = &repository.manifest.filename {
        return vec![filename.clone()];
    }
    let name = repository.name();
    let stripped = name.trim_start_matches("lovelace-");
    let mut names = vec![format!("{}.js", stripped), format!("{}-bundle.js", stripped)];
    if stripped != name {
        names.push(format!("{}.js", name));
    }
    names
}

fn first_with_extension(tree: &[TreeEntry], dir: &str, extension: &str) -> Option<String> {
    tree.iter()
        .filter(|entry| !entry.is_directory && entry.parent() == dir)
        .find(|entry| entry.filename().ends_with(extension))
        .map(|entry| entry.filename().to_string())
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::parse(s).ok_or_else(|| {
            let known: Vec<&str> = Category::all().iter().map(|c| c.as_str()).collect();
            format!("unknown category '{}', expected one of: {}", s, known.join(", "))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(paths: &[&str]) -> Vec<TreeEntry> {
        paths
            .iter()
            .map(|path| match path.strip_suffix('/') {
                Some(dir) => TreeEntry::directory(dir),
                None => TreeEntry::file(*path),
            })
            .collect()
    }

    #[test]
    fn test_parse_round_trip() {
        for category in Category::all() {
            assert_eq!(Category::parse(category.as_str()), Some(*category));
            assert_eq!(category.to_string().parse::<Category>().unwrap(), *category);
        }
        assert!("bogus".parse::<Category>().is_err());
    }

    #[test]
    fn test_integration_layout() {
        let mut repo = Repository::new("acme/widget", Category::Integration);
        let reasons = Category::Integration.inspect(
            &mut repo,
            &tree(&[
                "custom_components/",
                "custom_components/widget/",
                "custom_components/widget/manifest.json",
                "custom_components/widget/__init__.py",
                "README.md",
            ]),
        );
        assert!(reasons.is_empty());
        assert_eq!(repo.content_path, "custom_components/widget");

        repo.domain = Some("widget".to_string());
        assert_eq!(
            Category::Integration.local_path(Path::new("/config"), &repo),
            PathBuf::from("/config/custom_components/widget")
        );
    }

    #[test]
    fn test_integration_without_manifest_is_not_compliant() {
        let mut repo = Repository::new("acme/widget", Category::Integration);
        let reasons = Category::Integration.inspect(&mut repo, &tree(&["README.md"]));
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("not compliant"));
    }

    #[test]
    fn test_plugin_prefers_dist() {
        let mut repo = Repository::new("acme/lovelace-fancy-card", Category::Plugin);
        let reasons = Category::Plugin.inspect(
            &mut repo,
            &tree(&["fancy-card.js", "dist/fancy-card.js", "package.json"]),
        );
        assert!(reasons.is_empty());
        assert_eq!(repo.content_path, "dist");
        assert_eq!(repo.file_name.as_deref(), Some("fancy-card.js"));
        assert_eq!(
            Category::Plugin.local_path(Path::new("/config"), &repo),
            PathBuf::from("/config/www/community/lovelace-fancy-card")
        );
    }

    #[test]
    fn test_single_file_targets() {
        let mut repo = Repository::new("acme/hello", Category::PythonScript);
        let reasons =
            Category::PythonScript.inspect(&mut repo, &tree(&["python_scripts/hello.py"]));
        assert!(reasons.is_empty());
        assert_eq!(
            Category::PythonScript.install_target(Path::new("/config"), &repo),
            PathBuf::from("/config/python_scripts/hello.py")
        );
    }

    #[test]
    fn test_template_requires_manifest_filename() {
        let mut repo = Repository::new("acme/macros", Category::Template);
        let reasons = Category::Template.inspect(&mut repo, &tree(&["macros.jinja"]));
        assert_eq!(reasons.len(), 1);

        repo.manifest.filename = Some("macros.jinja".to_string());
        assert!(Category::Template.inspect(&mut repo, &tree(&["macros.jinja"])).is_empty());
        assert_eq!(repo.file_name.as_deref(), Some("macros.jinja"));
    }

    #[test]
    fn test_template_in_subdirectory_is_rejected() {
        let mut repo = Repository::new("acme/macros", Category::Template);
        repo.manifest.filename = Some("sub/macros.jinja".to_string());

        let reasons = Category::Template.inspect(&mut repo, &tree(&["sub/", "sub/macros.jinja"]));
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("repository root"));
        assert_eq!(repo.file_name, None);
    }

    #[test]
    fn test_integration_domain_must_be_a_directory_name() {
        for domain in ["/tmp/outside/victim", "../../victim", "sub/widget", ".."] {
            let mut repo = Repository::new("acme/evil", Category::Integration);
            let manifest = serde_json::json!({ "name": "Evil", "domain": domain }).to_string();

            let err = IntegrationManifest::apply(&manifest, &mut repo).unwrap_err();
            assert!(err.contains("not a plain directory name"), "{}", err);
            assert_eq!(repo.domain, None);
        }
    }

    #[test]
    fn test_integration_manifest_requires_domain() {
        let mut repo = Repository::new("acme/widget", Category::Integration);
        let err = IntegrationManifest::apply(r#"{"name": "Widget"}"#, &mut repo).unwrap_err();
        assert_eq!(err, "Missing expected key 'domain' in manifest.json");

        IntegrationManifest::apply(
            r#"{"name":"Widget","domain":"widget","codeowners":["@acme"]}"#,
            &mut repo,
        )
        .unwrap();
        assert_eq!(repo.domain.as_deref(), Some("widget"));
        assert_eq!(repo.manifest_name.as_deref(), Some("Widget"));
        assert_eq!(repo.authors, vec!["@acme".to_string()]);
        assert!(!repo.config_flow);
    }

    #[test]
    fn test_post_install_actions() {
        let mut repo = Repository::new("acme/widget", Category::Integration);
        repo.domain = Some("widget".to_string());

        assert_eq!(
            Category::Integration.after_install(&mut repo, InstallOutcome::FirstInstall),
            PostAction::Restart
        );
        assert!(!repo.pending_restart);

        Category::Integration.after_install(&mut repo, InstallOutcome::Reinstall);
        assert!(repo.pending_restart);

        repo.config_flow = true;
        assert_eq!(
            Category::Integration.after_uninstall(&mut repo),
            PostAction::Reload("widget".to_string())
        );
    }

    #[test]
    fn test_before_install_requires_domain() {
        let repo = Repository::new("acme/widget", Category::Integration);
        assert!(Category::Integration.before_install(&repo).is_err());
    }
}
