use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repokeeper::config::LoggingConfig;
use repokeeper::daemon::{self, is_daemon_running, stop_daemon};
use repokeeper::host::ContentHost;
use repokeeper::state::{EventType, StateDb};
use repokeeper::{Category, Config, Daemon, GitHubClient, Orchestrator, Repository, RepositoryState};

#[derive(Parser)]
#[command(name = "repokeeper")]
#[command(about = "Community content repository manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file for a host configuration directory
    Init {
        /// Host application configuration directory
        #[arg(short = 'r', long, default_value = "~/.homeassistant")]
        config_root: String,
    },

    /// Validate and add a repository
    Register {
        /// Repository in owner/name form
        full_name: String,

        /// Content category
        #[arg(short = 't', long, default_value = "integration")]
        category: Category,
    },

    /// Install a registered repository
    Install {
        /// Repository name or id
        repository: String,

        /// Tag or branch to install instead of the latest release
        #[arg(long)]
        version: Option<String>,
    },

    /// Refresh repository metadata
    Update {
        /// Repository name or id; all installed repositories when omitted
        repository: Option<String>,

        /// Re-read contents even if nothing was pushed
        #[arg(long)]
        force: bool,
    },

    /// Remove installed content
    Uninstall {
        /// Repository name or id
        repository: String,
    },

    /// List known repositories
    List {
        /// Only installed repositories
        #[arg(long)]
        installed: bool,

        /// Show detailed information
        #[arg(long)]
        details: bool,
    },

    /// Show API quota and queue status
    Status,

    /// Show lifecycle events
    Events {
        /// Include acknowledged events
        #[arg(long)]
        all: bool,

        /// Only events of this type
        #[arg(long = "type")]
        event_type: Option<String>,

        /// Only events for this repository
        #[arg(long)]
        repo: Option<String>,

        /// Maximum number of events
        #[arg(long, default_value = "50")]
        limit: u32,

        /// Acknowledge all events after listing
        #[arg(long)]
        ack: bool,

        /// Delete acknowledged events older than this many days
        #[arg(long, value_name = "DAYS")]
        prune: Option<u32>,
    },

    /// Critical repository handling
    Critical {
        #[command(subcommand)]
        critical_command: CriticalCommands,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum CriticalCommands {
    /// Show removals awaiting acknowledgement
    List,
    /// Acknowledge a forced removal
    Ack {
        /// Repository in owner/name form
        full_name: String,
    },
    /// Run a sweep now
    Sweep,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Forking must happen before the runtime starts its threads
    let background = matches!(
        cli.command,
        Commands::Daemon {
            daemon_command: DaemonCommands::Start { foreground: false }
        }
    );
    if background {
        if is_daemon_running(&config)? {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'repokeeper daemon stop' to stop it first");
            return Ok(());
        }
        start_background(&config)?;
    }

    init_logging(cli.verbose, &config.logging, !background)?;
    info!("Starting RepoKeeper v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Init { config_root } => cmd_init(config_root, &config),
        Commands::Register { full_name, category } => {
            cmd_register(&full_name, category, config).await
        }
        Commands::Install { repository, version } => {
            cmd_install(&repository, version, config).await
        }
        Commands::Update { repository, force } => cmd_update(repository, force, config).await,
        Commands::Uninstall { repository } => cmd_uninstall(&repository, config).await,
        Commands::List { installed, details } => cmd_list(installed, details),
        Commands::Status => cmd_status(config).await,
        Commands::Events {
            all,
            event_type,
            repo,
            limit,
            ack,
            prune,
        } => cmd_events(all, event_type, repo, limit, ack, prune),
        Commands::Critical { critical_command } => cmd_critical(critical_command, config).await,
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, config).await,
    }
}

/// Initialize logging from configuration; `--verbose` forces debug
fn init_logging(verbose: bool, logging: &LoggingConfig, ansi: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let ansi = ansi && logging.color;

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "compact" => registry.with(fmt::layer().compact().with_ansi(ansi)).init(),
        "pretty" => registry.with(fmt::layer().pretty().with_ansi(ansi)).init(),
        _ => registry.with(fmt::layer().with_ansi(ansi)).init(),
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Orchestrator backed by GitHub and the on-disk store, registry restored
fn open_orchestrator(config: Config) -> Result<Orchestrator> {
    let host: Arc<dyn ContentHost> = Arc::new(GitHubClient::new(&config.host)?);
    let store = StateDb::open()?;
    let orchestrator = Orchestrator::new(config, host, store);
    orchestrator.restore()?;
    Ok(orchestrator)
}

/// Look up a repository by id or name
fn resolve(orchestrator: &Orchestrator, identifier: &str) -> Result<Repository> {
    let found = match identifier.parse::<u64>() {
        Ok(id) => orchestrator.repository(id),
        Err(_) => orchestrator.find(identifier),
    };
    found.ok_or_else(|| anyhow!("Unknown repository: {} (register it first)", identifier))
}

fn cmd_init(config_root: String, config: &Config) -> Result<()> {
    let expanded_root = shellexpand::full(&config_root)?.into_owned();
    if !std::path::Path::new(&expanded_root).is_dir() {
        println!("⚠️  {} does not exist yet", expanded_root);
    }

    let mut new_config = config.clone();
    new_config.config_root = config_root;

    let config_path = Config::default_config_path()?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    new_config.save(&config_path)?;

    println!("✅ RepoKeeper initialized successfully!");
    println!("   Config: {:?}", config_path);
    println!("   Config root: {}", expanded_root);
    println!("   Next: repokeeper register <owner/name> --category <category>");
    Ok(())
}

async fn cmd_register(full_name: &str, category: Category, config: Config) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;

    match orchestrator.register(full_name, category).await {
        Ok(repository) => {
            println!("✅ Registered {} ({})", repository.full_name, repository.category);
            if let Some(version) = repository.available_version() {
                println!("   📦 Available: {}", version);
            }
            Ok(())
        }
        Err(repokeeper::Error::ValidationFailed { reasons, .. }) => {
            println!("❌ {} failed validation:", full_name);
            for reason in reasons {
                println!("   • {}", reason);
            }
            Err(anyhow!("Validation failed for {}", full_name))
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_install(identifier: &str, version: Option<String>, config: Config) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let repository = resolve(&orchestrator, identifier)?;

    println!("📥 Installing {}...", repository.full_name);
    let outcome = orchestrator
        .install(repository.id, version.as_deref())
        .await
        .with_context(|| format!("Failed to install {}", repository.full_name))?;

    let installed = resolve(&orchestrator, identifier)?;
    println!(
        "✅ Installed {} {} ({:?})",
        installed.full_name,
        installed.installed_display().unwrap_or_default(),
        outcome
    );
    if installed.pending_restart
        || (installed.category == Category::Integration && !installed.config_flow)
    {
        println!("   🔄 Restart the host application to load it");
    }
    Ok(())
}

async fn cmd_update(identifier: Option<String>, force: bool, config: Config) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;

    let targets: Vec<Repository> = match identifier {
        Some(identifier) => vec![resolve(&orchestrator, &identifier)?],
        None => orchestrator
            .repositories()
            .into_iter()
            .filter(|repository| repository.installed)
            .collect(),
    };

    let mut failed = 0;
    for repository in targets {
        match orchestrator.update(repository.id, force).await {
            Ok(()) => {
                let refreshed = orchestrator.repository(repository.id).unwrap_or(repository);
                match refreshed.available_version().filter(|_| refreshed.pending_update()) {
                    Some(version) => println!("⬆️  {}: {} available", refreshed.full_name, version),
                    None => println!("✅ {}: up to date", refreshed.full_name),
                }
            }
            Err(e) => {
                failed += 1;
                println!("❌ {}: {}", repository.full_name, e);
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} update(s) failed", failed));
    }
    Ok(())
}

async fn cmd_uninstall(identifier: &str, config: Config) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let repository = resolve(&orchestrator, identifier)?;

    orchestrator
        .uninstall(repository.id)
        .await
        .with_context(|| format!("Failed to uninstall {}", repository.full_name))?;
    println!("🗑️  Uninstalled {}", repository.full_name);
    Ok(())
}

fn cmd_list(installed_only: bool, details: bool) -> Result<()> {
    let store = StateDb::open()?;
    let repositories: Vec<Repository> = store
        .load_repositories()?
        .into_iter()
        .filter(|repository| !installed_only || repository.installed)
        .collect();

    println!("Repositories ({}):", repositories.len());
    for repository in repositories {
        let marker = match repository.state() {
            RepositoryState::Installed => "✅",
            RepositoryState::PendingUpgrade => "⬆️ ",
            RepositoryState::PendingRestart => "🔄",
            RepositoryState::New => "🆕",
            RepositoryState::Default => "📁",
        };
        println!("  {} {} [{}]", marker, repository.full_name, repository.category);

        if details {
            println!("     🏷️  Name: {}", repository.display_name());
            println!("     id: {}", repository.id);
            if let Some(description) = &repository.description {
                println!("     📝 {}", description);
            }
            if let Some(version) = repository.installed_display() {
                println!("     📦 Installed: {}", version);
            }
            if let Some(version) = repository.available_version() {
                println!("     🆕 Available: {}", version);
            }
            println!("     ⭐ {}", repository.stargazers_count);
        }
    }
    Ok(())
}

async fn cmd_status(config: Config) -> Result<()> {
    let governor = repokeeper::Governor::from_config(&config.host);
    let client = GitHubClient::new(&config.host)?;

    println!("📊 RepoKeeper Status");
    println!("   🔑 Authentication: {:?}", client.auth_strategy());
    match client.rate_limit().await {
        Ok(quota) => {
            println!("   📈 API quota: {} of {} remaining", quota.remaining, quota.limit);
            if let Some(reset) = quota.reset {
                println!("   ⏰ Resets at: {}", reset.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        Err(e) => println!("   ❌ Quota probe failed: {}", e),
    }
    match governor.capacity(&client).await {
        Some(0) => println!("   ⏸️  Background processing would be paused"),
        Some(capacity) => println!("   🔄 Capacity this cycle: {} repositories", capacity),
        None => println!("   ❌ Background processing would be disabled (invalid token)"),
    }

    let store = StateDb::open()?;
    let repositories = store.load_repositories()?;
    let installed = repositories.iter().filter(|repository| repository.installed).count();
    let pending = repositories.iter().filter(|repository| repository.pending_update()).count();
    println!(
        "   📁 Repositories: {} known, {} installed, {} with updates",
        repositories.len(),
        installed,
        pending
    );

    let unacknowledged = store.get_unacknowledged_events()?.len();
    if unacknowledged > 0 {
        println!("   🔔 {} unacknowledged events (repokeeper events)", unacknowledged);
    }
    let critical = store.load_critical()?.into_iter().filter(|entry| !entry.acknowledged).count();
    if critical > 0 {
        println!(
            "   🚨 {} critical removals need acknowledgement (repokeeper critical list)",
            critical
        );
    }

    let daemon_state = if is_daemon_running(&config)? {
        "running"
    } else {
        "not running"
    };
    println!("   🖥️  Daemon: {}", daemon_state);
    Ok(())
}

fn cmd_events(
    all: bool,
    event_type: Option<String>,
    repo: Option<String>,
    limit: u32,
    ack: bool,
    prune: Option<u32>,
) -> Result<()> {
    let store = StateDb::open()?;
    let event_type = match event_type {
        Some(name) => Some(
            EventType::parse(&name).ok_or_else(|| anyhow!("Unknown event type: {}", name))?,
        ),
        None => None,
    };

    let events: Vec<_> = match repo {
        Some(full_name) => store
            .get_events_for_repo(&full_name, Some(limit))?
            .into_iter()
            .filter(|event| all || !event.acknowledged)
            .filter(|event| event_type.map_or(true, |kind| event.event_type == kind))
            .collect(),
        None => {
            let acknowledged = if all { None } else { Some(false) };
            store.get_events_with_filter(acknowledged, event_type, Some(limit))?
        }
    };

    if events.is_empty() {
        println!("No events");
    }
    for event in &events {
        let icon = match event.severity.as_str() {
            "error" => "❌",
            "warning" => "⚠️ ",
            _ => "ℹ️ ",
        };
        println!(
            "{} {} [{}] {}",
            icon,
            event.timestamp.format("%Y-%m-%d %H:%M"),
            event.event_type.as_str(),
            event.summary
        );
        if let Some(details) = &event.details {
            println!("      {}", details);
        }
    }

    if ack {
        let count = store.acknowledge_all_events()?;
        println!("✅ Acknowledged {} events", count);
    }
    if let Some(days) = prune {
        let count = store.cleanup_old_events(days)?;
        println!("🧹 Deleted {} acknowledged events older than {} days", count, days);
    }
    Ok(())
}

async fn cmd_critical(critical_command: CriticalCommands, config: Config) -> Result<()> {
    match critical_command {
        CriticalCommands::List => {
            let store = StateDb::open()?;
            let pending: Vec<_> = store
                .load_critical()?
                .into_iter()
                .filter(|entry| !entry.acknowledged)
                .collect();
            if pending.is_empty() {
                println!("✅ No critical removals awaiting acknowledgement");
            }
            for entry in pending {
                println!("🚨 {}", entry.repository);
                if let Some(reason) = &entry.reason {
                    println!("   📝 {}", reason);
                }
                if let Some(link) = &entry.link {
                    println!("   🔗 {}", link);
                }
            }
        }
        CriticalCommands::Ack { full_name } => {
            let orchestrator = open_orchestrator(config)?;
            if orchestrator.acknowledge_critical(&full_name)? {
                println!("✅ Acknowledged {}", full_name);
            } else {
                println!("⚠️  {} is not a recorded critical removal", full_name);
            }
        }
        CriticalCommands::Sweep => {
            let orchestrator = open_orchestrator(config)?;
            let report = orchestrator.run_critical_sweep().await?;
            println!("🔍 {} repositories on the critical list", report.listed);
            for name in &report.forced {
                println!("   🗑️  Removed {}", name);
            }
            for name in &report.failed {
                println!("   ❌ Could not remove {}", name);
            }
            if report.restart_required {
                println!("   🔄 Restart the host application");
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn start_background(config: &Config) -> Result<()> {
    println!("🚀 Starting RepoKeeper daemon...");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    daemon::daemonize(config)
}

#[cfg(not(unix))]
fn start_background(_config: &Config) -> Result<()> {
    Err(anyhow!(
        "Background daemon mode not supported on this platform, use --foreground"
    ))
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                if is_daemon_running(&config)? {
                    println!("⚠️  Daemon is already running!");
                    return Ok(());
                }
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }
            let orchestrator = open_orchestrator(config)?;
            Daemon::new(orchestrator)?.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping RepoKeeper daemon...");

            if !is_daemon_running(&config)? {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }

            if stop_daemon(&config)? {
                println!("✅ Daemon stop signal sent");
            }
        }

        DaemonCommands::Status => {
            println!("📊 RepoKeeper Daemon Status");

            if is_daemon_running(&config)? {
                let schedule = daemon::Schedule::from_config(&config.scheduling)?;
                println!("   🟢 Status: Running");
                println!("   🔄 Queue interval: {:?}", schedule.process_queue);
                println!("   📦 Installed updates every: {:?}", schedule.update_installed);
                println!("   🚨 Critical sweep every: {:?}", schedule.critical);
                if !config.daemon.log_file.is_empty() {
                    println!("   📄 Log file: {}", config.daemon.log_file);
                }
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Use 'repokeeper daemon start' to start the daemon");
            }
        }
    }

    Ok(())
}
