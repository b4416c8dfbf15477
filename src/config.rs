use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;
use crate::repository::category::Category;

/// Main configuration structure for RepoKeeper
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Host application configuration directory that content is installed into
    pub config_root: String,

    /// Running host application version, used for compatibility checks
    #[serde(default)]
    pub host_version: Option<String>,

    /// Remote host authentication and quota settings
    #[serde(default)]
    pub host: HostConfig,

    /// Periodic task intervals
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Content categories
    #[serde(default)]
    pub categories: CategoryConfig,

    /// Install snapshot settings
    #[serde(default)]
    pub backup: BackupConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote host configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token", "anonymous"

    /// API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Raw file base URL
    #[serde(default = "default_raw_url")]
    pub raw_url: String,

    /// Web base URL, used for release asset downloads
    #[serde(default = "default_web_url")]
    pub web_url: String,

    /// Base URL of the curated lists (critical, removed, per-category index)
    #[serde(default = "default_data_url")]
    pub data_url: String,

    /// API calls kept in reserve
    #[serde(default = "default_api_threshold")]
    pub api_threshold: u32,

    /// API calls one repository refresh is expected to use
    #[serde(default = "default_cost_per_repository")]
    pub cost_per_repository: u32,

    /// Sustained request rate
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Requests allowed in a burst
    #[serde(default = "default_burst")]
    pub burst: u32,
}

/// Periodic task intervals ("30s", "10m", "6h", "2d")
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulingConfig {
    #[serde(default = "default_process_queue_interval")]
    pub process_queue: String,

    /// Re-probe interval while disabled by the rate limit
    #[serde(default = "default_rate_limit_interval")]
    pub rate_limit: String,

    #[serde(default = "default_critical_interval")]
    pub critical: String,

    #[serde(default = "default_update_installed_interval")]
    pub update_installed: String,

    #[serde(default = "default_discovery_interval")]
    pub discovery: String,
}

/// Download configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DownloadConfig {
    /// Timeout for a single file in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Attempts after a timed out download
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Releases fetched per repository
    #[serde(default = "default_release_limit")]
    pub release_limit: usize,
}

/// Category configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CategoryConfig {
    /// Categories discovered from the default index
    #[serde(default = "default_categories")]
    pub enabled: Vec<Category>,
}

/// Backup configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackupConfig {
    /// Scratch directory for install snapshots
    #[serde(default = "default_backup_directory")]
    pub directory: String,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_raw_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}
fn default_web_url() -> String {
    "https://github.com".to_string()
}
fn default_data_url() -> String {
    "https://data-v2.hacs.xyz".to_string()
}
fn default_api_threshold() -> u32 {
    1000
}
fn default_cost_per_repository() -> u32 {
    10
}
fn default_requests_per_second() -> f64 {
    5.0
}
fn default_burst() -> u32 {
    20
}
fn default_process_queue_interval() -> String {
    "10m".to_string()
}
fn default_rate_limit_interval() -> String {
    "5m".to_string()
}
fn default_critical_interval() -> String {
    "6h".to_string()
}
fn default_update_installed_interval() -> String {
    "48h".to_string()
}
fn default_discovery_interval() -> String {
    "6h".to_string()
}
fn default_timeout() -> u64 {
    60
}
fn default_retries() -> u32 {
    5
}
fn default_release_limit() -> usize {
    30
}
fn default_categories() -> Vec<Category> {
    Category::all().to_vec()
}
fn default_backup_directory() -> String {
    std::env::temp_dir()
        .join("repokeeper_backup")
        .to_string_lossy()
        .into_owned()
}
fn default_true() -> bool {
    true
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/repokeeper.pid", runtime_dir)
    } else {
        "/tmp/repokeeper.pid".to_string()
    }
}

fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/repokeeper/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/repokeeper/daemon.log", home)
    } else {
        "/tmp/repokeeper-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for HostConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            api_url: default_api_url(),
            raw_url: default_raw_url(),
            web_url: default_web_url(),
            data_url: default_data_url(),
            api_threshold: default_api_threshold(),
            cost_per_repository: default_cost_per_repository(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            process_queue: default_process_queue_interval(),
            rate_limit: default_rate_limit_interval(),
            critical: default_critical_interval(),
            update_installed: default_update_installed_interval(),
            discovery: default_discovery_interval(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retries: default_retries(),
            release_limit: default_release_limit(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_categories(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_directory(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repokeeper").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.config_root = shellexpand::full(&self.config_root)
            .context("Failed to expand config_root path")?
            .into_owned();

        self.backup.directory = shellexpand::full(&self.backup.directory)
            .context("Failed to expand backup directory path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }

    pub fn config_root_path(&self) -> PathBuf {
        PathBuf::from(&self.config_root)
    }

    pub fn backup_root(&self) -> PathBuf {
        PathBuf::from(&self.backup.directory)
    }

    /// Directories under the config root that are never removed
    pub fn protected_roots(&self) -> Vec<PathBuf> {
        paths::protected_roots(&self.config_root_path())
    }

    pub fn is_category_enabled(&self, category: Category) -> bool {
        self.categories.enabled.contains(&category)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_root: "${HOME}/.homeassistant".to_string(),
            host_version: None,
            host: HostConfig::default(),
            scheduling: SchedulingConfig::default(),
            download: DownloadConfig::default(),
            categories: CategoryConfig::default(),
            backup: BackupConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    // Helper function to create a temporary config directory
    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("repokeeper");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.config_root, "${HOME}/.homeassistant");
        assert_eq!(config.host.auth_method, "auto");
        assert_eq!(config.host.api_threshold, 1000);
        assert_eq!(config.host.cost_per_repository, 10);
        assert_eq!(config.scheduling.process_queue, "10m");
        assert_eq!(config.scheduling.rate_limit, "5m");
        assert_eq!(config.scheduling.update_installed, "48h");
        assert_eq!(config.download.timeout, 60);
        assert_eq!(config.download.retries, 5);
        assert_eq!(config.download.release_limit, 30);
        assert_eq!(config.categories.enabled.len(), Category::all().len());
        assert!(config.host_version.is_none());
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_REPOKEEPER_HOME", "/test/home");

        let mut config = Config::default();
        config.config_root = "${TEST_REPOKEEPER_HOME}/config".to_string();
        config.backup.directory = "${TEST_REPOKEEPER_HOME}/scratch".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.config_root, "/test/home/config");
        assert_eq!(config.backup_root(), PathBuf::from("/test/home/scratch"));

        env::remove_var("TEST_REPOKEEPER_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        let result = Config::load(nonexistent_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_path = config_dir.join("config.yml");

        let mut config = Config::default();
        config.config_root = "/custom/config".to_string();
        config.host_version = Some("2024.6.0".to_string());
        config.categories.enabled = vec![Category::Integration, Category::Theme];
        config.download.retries = 2;

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.config_root, "/custom/config");
        assert_eq!(loaded.host_version, Some("2024.6.0".to_string()));
        assert_eq!(
            loaded.categories.enabled,
            vec![Category::Integration, Category::Theme]
        );
        assert_eq!(loaded.download.retries, 2);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("repokeeper"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_protected_roots_follow_config_root() {
        let mut config = Config::default();
        config.config_root = "/config".to_string();

        let protected = config.protected_roots();
        assert!(protected.contains(&PathBuf::from("/config/custom_components")));
        assert!(protected.contains(&PathBuf::from("/config/www/community")));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
config_root: "${HOME}/ha"
host_version: "2024.1.0"
host:
  auth_method: "token"
  api_threshold: 500
  cost_per_repository: 15
scheduling:
  process_queue: "1m"
  critical: "1h"
download:
  timeout: 30
categories:
  enabled: ["integration", "python_script"]
logging:
  level: "debug"
  color: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.config_root, "${HOME}/ha");
        assert_eq!(config.host.auth_method, "token");
        assert_eq!(config.host.api_threshold, 500);
        assert_eq!(config.host.cost_per_repository, 15);
        assert_eq!(config.host.api_url, "https://api.github.com");
        assert_eq!(config.scheduling.process_queue, "1m");
        assert_eq!(config.scheduling.critical, "1h");
        assert_eq!(config.scheduling.rate_limit, "5m");
        assert_eq!(config.download.timeout_duration(), Duration::from_secs(30));
        assert_eq!(config.download.retries, 5);
        assert!(config.is_category_enabled(Category::PythonScript));
        assert!(!config.is_category_enabled(Category::Theme));
        assert!(!config.logging.color);
    }
}
