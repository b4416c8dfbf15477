//! Daemon Infrastructure - Background service for scheduled repository maintenance
//!
//! Runs the orchestrator's startup sequence and then its periodic flows (queue
//! processing, rate-limit re-probing, critical sweeps, installed updates and
//! discovery) on independent intervals, with PID file management and graceful
//! shutdown handling.

use crate::config::{Config, SchedulingConfig};
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Parse duration strings like "30s", "10m", "6h", "2d"; bare numbers are seconds.
pub fn parse_daemon_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let seconds = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?
    };

    if seconds == 0 {
        anyhow::bail!("Interval must be greater than zero");
    }
    Ok(Duration::from_secs(seconds))
}

/// Parsed periodic task intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub process_queue: Duration,
    pub rate_limit: Duration,
    pub critical: Duration,
    pub update_installed: Duration,
    pub discovery: Duration,
}

impl Schedule {
    pub fn from_config(config: &SchedulingConfig) -> Result<Self> {
        let parse = |name: &str, value: &str| {
            parse_daemon_duration(value)
                .with_context(|| format!("Invalid scheduling.{} interval '{}'", name, value))
        };
        Ok(Self {
            process_queue: parse("process_queue", &config.process_queue)?,
            rate_limit: parse("rate_limit", &config.rate_limit)?,
            critical: parse("critical", &config.critical)?,
            update_installed: parse("update_installed", &config.update_installed)?,
            discovery: parse("discovery", &config.discovery)?,
        })
    }
}

/// Daemon state and control
pub struct Daemon {
    orchestrator: Orchestrator,
    schedule: Schedule,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    pub fn new(orchestrator: Orchestrator) -> Result<Self> {
        let schedule = Schedule::from_config(&orchestrator.config().scheduling)?;
        let pid_file_path = pid_file_path(orchestrator.config())?;
        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            orchestrator,
            schedule,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Handle that stops the daemon loop when sent to
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Run startup and the periodic flows until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        info!("Starting RepoKeeper daemon");

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let is_running = self.is_running.clone();
        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            is_running.store(false, Ordering::SeqCst);
            let _ = shutdown_sender.send(());
        });

        let result = match self.orchestrator.startup().await {
            Ok(()) => self.daemon_loop(shutdown_receiver).await,
            Err(e) => Err(anyhow::Error::new(e).context("Startup failed")),
        };

        self.cleanup().context("Failed to cleanup daemon")?;
        result
    }

    /// Main daemon loop
    async fn daemon_loop(&self, mut shutdown_receiver: broadcast::Receiver<()>) -> Result<()> {
        let mut process_queue = ticker(self.schedule.process_queue).await;
        let mut rate_limit = ticker(self.schedule.rate_limit).await;
        let mut critical = ticker(self.schedule.critical).await;
        let mut update_installed = ticker(self.schedule.update_installed).await;
        let mut discovery = ticker(self.schedule.discovery).await;

        info!("Daemon loop started with schedule: {:?}", self.schedule);

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                _ = process_queue.tick() => {
                    if let Err(e) = self.orchestrator.process_queue().await {
                        error!("Queue processing failed: {}", e);
                    }
                }

                _ = rate_limit.tick() => {
                    match self.orchestrator.check_rate_limit().await {
                        Ok(true) => info!("API quota recovered, background processing resumed"),
                        Ok(false) => {}
                        Err(e) => error!("Rate limit check failed: {}", e),
                    }
                }

                _ = critical.tick() => {
                    if let Err(e) = self.orchestrator.run_critical_sweep().await {
                        error!("Critical sweep failed: {}", e);
                    }
                }

                _ = update_installed.tick() => {
                    debug!("Scheduling updates for installed repositories");
                    self.orchestrator.schedule_installed_updates();
                    if let Err(e) = self.orchestrator.process_queue().await {
                        error!("Queue processing failed: {}", e);
                    }
                }

                _ = discovery.tick() => {
                    self.refresh_all().await;
                }
            }

            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }
        }

        info!("Daemon loop exiting");
        Ok(())
    }

    /// Removed list, default index and a refresh of every known repository
    async fn refresh_all(&self) {
        debug!("Starting recurring refresh of all repositories");
        if let Err(e) = self.orchestrator.handle_removed().await {
            warn!("Could not apply the removed list: {}", e);
        }
        if let Err(e) = self.orchestrator.discover().await {
            warn!("Discovery failed: {}", e);
        }
        self.orchestrator.schedule_all_updates();
        if let Err(e) = self.orchestrator.process_queue().await {
            error!("Queue processing failed: {}", e);
        }
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Interval with its immediate first tick consumed
async fn ticker(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;
    timer
}

/// Wait for SIGTERM or Ctrl+C
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = terminate.recv() => debug!("SIGTERM received"),
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for Ctrl+C: {}", e);
                        }
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}

fn pid_file_path(config: &Config) -> Result<Option<PathBuf>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }
    let expanded_path =
        shellexpand::full(&config.daemon.pid_file).context("Failed to expand PID file path")?;
    Ok(Some(PathBuf::from(expanded_path.as_ref())))
}

/// Detach from the terminal. Must run before the async runtime is built.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let mut daemonize = Daemonize::new().working_directory(std::env::temp_dir());

    if !config.daemon.log_file.is_empty() {
        let expanded_path = shellexpand::full(&config.daemon.log_file)
            .context("Failed to expand log file path")?;
        let log_path = PathBuf::from(expanded_path.as_ref());
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open log file")?;
        daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;
    Ok(())
}

/// Send SIGTERM to a running daemon. Returns false if none was running.
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(config)? else {
        warn!("No PID file configured, cannot stop daemon");
        return Ok(false);
    };
    let Some(pid) = read_pid(&pid_file)? else {
        warn!("PID file not found, daemon may not be running");
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform");
    }

    info!("Shutdown signal sent to daemon process {}", pid);
    Ok(true)
}

fn read_pid(pid_file: &PathBuf) -> Result<Option<u32>> {
    if !pid_file.exists() {
        return Ok(None);
    }
    let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
    let pid = pid_str.trim().parse().context("Invalid PID in PID file")?;
    Ok(Some(pid))
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(config)? else {
        return Ok(false);
    };
    let Some(pid) = read_pid(&pid_file)? else {
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(true),
            Err(Errno::ESRCH) => {
                // Stale PID file
                let _ = fs::remove_file(&pid_file);
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(true)
    }
}
