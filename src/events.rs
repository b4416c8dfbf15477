//! Change notifications for repository state transitions
//!
//! Events are fanned out over a tokio broadcast channel. Emitting never blocks
//! and never fails: with no subscribers the event is dropped.

use crate::repository::{InstallOutcome, RepositoryState};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Why background processing stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    /// Remote quota exhausted; re-probed periodically
    RateLimit,
    /// The quota probe itself failed, usually bad credentials
    InvalidToken,
}

impl DisabledReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisabledReason::RateLimit => "rate_limit",
            DisabledReason::InvalidToken => "invalid_token",
        }
    }
}

/// Events emitted on repository and orchestrator state changes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RepositoryEvent {
    Registered {
        id: u64,
        full_name: String,
    },
    StateChanged {
        id: u64,
        full_name: String,
        state: RepositoryState,
    },
    /// Percentage of files written during an install
    DownloadProgress {
        id: u64,
        progress: u8,
    },
    Installed {
        id: u64,
        full_name: String,
        outcome: InstallOutcome,
    },
    Updated {
        id: u64,
        full_name: String,
    },
    Uninstalled {
        id: u64,
        full_name: String,
    },
    /// A dependent service should reload to pick up changed content
    ReloadRequested {
        target: String,
    },
    /// The host application must restart to load or unload content
    RestartRequired {
        reason: String,
    },
    /// Critical repositories were removed and await acknowledgement
    CriticalPending {
        repositories: Vec<String>,
    },
    Status {
        startup: bool,
        background_task_running: bool,
        pending_task_count: usize,
    },
    Disabled {
        reason: DisabledReason,
    },
    Enabled,
}

/// Broadcast hub for [`RepositoryEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RepositoryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RepositoryEvent) {
        trace!("Event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

/// Drain everything currently buffered in a receiver.
pub fn drain(receiver: &mut broadcast::Receiver<RepositoryEvent>) -> Vec<RepositoryEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
