//! RepoKeeper - Community content repository manager
//!
//! RepoKeeper registers, installs, updates and removes third-party content
//! repositories hosted on GitHub into a host application's configuration
//! directory, while staying within the remote API quota and never leaving a
//! half-written install behind.
//!
//! ## Core Features
//!
//! - **Task Queue**: grouped background work, bounded by the API quota
//! - **Version Resolution**: pinned tags, latest releases or the default branch
//! - **Safe Installs**: snapshot before writing, restore on failure
//! - **Critical Sweeps**: forced removal of repositories flagged unsafe
//! - **Persistence**: SQLite store for records, sets and lifecycle events
//!
//! ## Modules
//!
//! - [`orchestrator`]: startup, scheduling and the public API
//! - [`repository`]: records, categories, download planning and the state machine
//! - [`host`] / [`github`]: the remote content host
//! - [`config`]: configuration management and parsing

pub mod backup;
pub mod config;
pub mod critical;
pub mod daemon;
pub mod error;
pub mod events;
pub mod github;
pub mod host;
pub mod orchestrator;
pub mod paths;
pub mod queue;
pub mod ratelimit;
pub mod registry;
pub mod repository;
pub mod state;
pub mod version;

pub use config::Config;
pub use critical::{CriticalEntry, CriticalRepositoryMonitor, SweepReport};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use events::{DisabledReason, EventBus, RepositoryEvent};
pub use github::GitHubClient;
pub use host::ContentHost;
pub use orchestrator::{Orchestrator, Status};
pub use queue::TaskQueue;
pub use ratelimit::Governor;
pub use registry::{Registry, RemovedRepository};
pub use repository::category::Category;
pub use repository::machine::RepositoryStateMachine;
pub use repository::{InstallOutcome, Repository, RepositoryState};
pub use state::StateDb;
