//! State Management - SQLite-based persistence for repository records and events
//!
//! This module provides persistent storage for:
//! - Repository records (JSON-serialized, keyed by id)
//! - Critical-list acknowledgement records
//! - Registry bookkeeping: skip/archived sets, removed entries, renames
//! - Lifecycle events (installs, removals, validation failures)
//!
//! The database is stored in XDG_DATA_HOME/repokeeper/state.db

use crate::critical::CriticalEntry;
use crate::registry::{RegistrySet, RemovedRepository};
use crate::repository::Repository;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Repository was added to the registry
    Registered,
    /// Content was written for the first time or reinstalled
    Installed,
    /// Remote metadata was refreshed
    Updated,
    /// Content was removed
    Uninstalled,
    /// Repository was rejected during registration
    ValidationFailed,
    /// Install failed and was rolled back
    InstallFailed,
    /// Repository was force-removed from the critical list
    CriticalRemoval,
    /// Background processing stopped for lack of API quota
    RateLimited,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Registered => "registered",
            EventType::Installed => "installed",
            EventType::Updated => "updated",
            EventType::Uninstalled => "uninstalled",
            EventType::ValidationFailed => "validation_failed",
            EventType::InstallFailed => "install_failed",
            EventType::CriticalRemoval => "critical_removal",
            EventType::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(EventType::Registered),
            "installed" => Some(EventType::Installed),
            "updated" => Some(EventType::Updated),
            "uninstalled" => Some(EventType::Uninstalled),
            "validation_failed" => Some(EventType::ValidationFailed),
            "install_failed" => Some(EventType::InstallFailed),
            "critical_removal" => Some(EventType::CriticalRemoval),
            "rate_limited" => Some(EventType::RateLimited),
            _ => None,
        }
    }

    /// Get the severity level for this event type
    pub fn severity(&self) -> Severity {
        match self {
            EventType::Registered | EventType::Installed | EventType::Updated => Severity::Info,
            EventType::Uninstalled => Severity::Info,
            EventType::ValidationFailed | EventType::RateLimited => Severity::Warning,
            EventType::InstallFailed | EventType::CriticalRemoval => Severity::Error,
        }
    }
}

/// Severity levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// A lifecycle event record
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub repo_full_name: Option<String>,
    pub event_type: EventType,
    pub severity: Severity,
    pub summary: String,
    pub details: Option<String>,
    pub acknowledged: bool,
}

/// Builder for creating new lifecycle events
#[derive(Debug)]
pub struct LifecycleEventBuilder {
    repo_full_name: Option<String>,
    event_type: EventType,
    summary: String,
    details: Option<String>,
}

impl LifecycleEventBuilder {
    pub fn new(event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            repo_full_name: None,
            event_type,
            summary: summary.into(),
            details: None,
        }
    }

    pub fn repo(mut self, full_name: impl Into<String>) -> Self {
        self.repo_full_name = Some(full_name.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn details_json<T: serde::Serialize>(mut self, details: &T) -> Self {
        if let Ok(json) = serde_json::to_string(details) {
            self.details = Some(json);
        }
        self
    }
}

/// Everything the registry persists, saved in one transaction
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub repositories: Vec<Repository>,
    pub skip: Vec<String>,
    pub archived: Vec<String>,
    pub removed: Vec<RemovedRepository>,
    pub renamed: HashMap<String, String>,
}

/// State database manager
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open or create the state database
    pub fn open() -> Result<Self> {
        let db_path = Self::get_db_path()?;
        Self::open_at(db_path)
    }

    /// Open or create the state database at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self { conn };
        db.initialize()?;

        info!("State database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Get the default database path
    pub fn get_db_path() -> Result<PathBuf> {
        let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local/share")
        } else {
            PathBuf::from("/tmp")
        };

        Ok(data_dir.join("repokeeper").join("state.db"))
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                -- Repository records
                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY,
                    full_name TEXT NOT NULL,
                    category TEXT NOT NULL,
                    installed INTEGER NOT NULL DEFAULT 0,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                -- Critical list acknowledgements
                CREATE TABLE IF NOT EXISTS critical (
                    repository TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );

                -- Removed list entries
                CREATE TABLE IF NOT EXISTS removed (
                    repository TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );

                -- Skip and archived sets
                CREATE TABLE IF NOT EXISTS registry_sets (
                    kind TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (kind, value)
                );

                -- Renamed repositories
                CREATE TABLE IF NOT EXISTS renamed (
                    old_name TEXT PRIMARY KEY,
                    new_name TEXT NOT NULL
                );

                -- Event log table
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    repo_full_name TEXT,
                    event_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    details TEXT,
                    acknowledged INTEGER DEFAULT 0,
                    created_at TEXT DEFAULT CURRENT_TIMESTAMP
                );

                CREATE INDEX IF NOT EXISTS idx_repos_full_name ON repositories(full_name);
                CREATE INDEX IF NOT EXISTS idx_repos_installed ON repositories(installed);
                CREATE INDEX IF NOT EXISTS idx_events_unack ON events(acknowledged, timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_repo ON events(repo_full_name, timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, timestamp);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Repository Record Operations
    // =========================================================================

    pub fn load_repositories(&self) -> Result<Vec<Repository>> {
        let mut stmt = self
            .conn
            .prepare("SELECT full_name, data FROM repositories ORDER BY full_name")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query repositories")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect repositories")?;

        rows.into_iter()
            .map(|(full_name, data)| {
                serde_json::from_str(&data)
                    .with_context(|| format!("Corrupt record for {}", full_name))
            })
            .collect()
    }

    // =========================================================================
    // Critical Records
    // =========================================================================

    /// Replace all critical records in one transaction
    pub fn save_critical(&self, records: &[CriticalEntry]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;
        tx.execute("DELETE FROM critical", [])?;
        for record in records {
            tx.execute(
                "INSERT OR REPLACE INTO critical (repository, data) VALUES (?1, ?2)",
                params![record.repository.to_lowercase(), serde_json::to_string(record)?],
            )
            .with_context(|| format!("Failed to store critical record {}", record.repository))?;
        }
        tx.commit().context("Failed to commit critical records")?;
        Ok(())
    }

    pub fn load_critical(&self) -> Result<Vec<CriticalEntry>> {
        load_json_column(&self.conn, "SELECT data FROM critical ORDER BY repository")
    }

    // =========================================================================
    // Registry Bookkeeping
    // =========================================================================

    /// Save records and bookkeeping together
    pub fn save_snapshot(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;

        write_repositories(&tx, &snapshot.repositories)?;

        tx.execute("DELETE FROM registry_sets", [])?;
        for (kind, values) in [
            (RegistrySet::Skip, &snapshot.skip),
            (RegistrySet::Archived, &snapshot.archived),
        ] {
            for value in values {
                tx.execute(
                    "INSERT OR IGNORE INTO registry_sets (kind, value) VALUES (?1, ?2)",
                    params![kind.as_str(), value],
                )?;
            }
        }

        tx.execute("DELETE FROM removed", [])?;
        for entry in &snapshot.removed {
            tx.execute(
                "INSERT OR REPLACE INTO removed (repository, data) VALUES (?1, ?2)",
                params![entry.repository.to_lowercase(), serde_json::to_string(entry)?],
            )?;
        }

        tx.execute("DELETE FROM renamed", [])?;
        for (old_name, new_name) in &snapshot.renamed {
            tx.execute(
                "INSERT OR REPLACE INTO renamed (old_name, new_name) VALUES (?1, ?2)",
                params![old_name, new_name],
            )?;
        }

        tx.commit().context("Failed to commit registry snapshot")?;
        debug!(
            "Saved registry snapshot ({} repositories)",
            snapshot.repositories.len()
        );
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<RegistrySnapshot> {
        let mut stmt = self.conn.prepare("SELECT old_name, new_name FROM renamed")?;
        let renamed = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()
            .context("Failed to collect renamed repositories")?;

        Ok(RegistrySnapshot {
            repositories: self.load_repositories()?,
            skip: self.load_set(RegistrySet::Skip)?,
            archived: self.load_set(RegistrySet::Archived)?,
            removed: load_json_column(&self.conn, "SELECT data FROM removed ORDER BY repository")?,
            renamed,
        })
    }

    pub fn load_set(&self, kind: RegistrySet) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM registry_sets WHERE kind = ?1 ORDER BY value")?;
        let values = stmt
            .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))
            .context("Failed to query registry set")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect registry set")?;
        Ok(values)
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Record a new lifecycle event
    pub fn record_event(&self, builder: LifecycleEventBuilder) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let severity = builder.event_type.severity();

        self.conn
            .execute(
                r#"
                INSERT INTO events
                    (timestamp, repo_full_name, event_type, severity, summary, details)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    now,
                    builder.repo_full_name,
                    builder.event_type.as_str(),
                    severity.as_str(),
                    builder.summary,
                    builder.details,
                ],
            )
            .context("Failed to record event")?;

        let id = self.conn.last_insert_rowid();
        debug!(
            "Recorded event: {} - {}",
            builder.event_type.as_str(),
            builder.summary
        );
        Ok(id)
    }

    /// Get unacknowledged events
    pub fn get_unacknowledged_events(&self) -> Result<Vec<LifecycleEvent>> {
        self.get_events_with_filter(Some(false), None, None)
    }

    /// Get recent events with optional filters
    pub fn get_events_with_filter(
        &self,
        acknowledged: Option<bool>,
        event_type: Option<EventType>,
        limit: Option<u32>,
    ) -> Result<Vec<LifecycleEvent>> {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ack) = acknowledged {
            conditions.push(format!("acknowledged = ?{}", param_values.len() + 1));
            param_values.push(Box::new(if ack { 1i32 } else { 0i32 }));
        }
        if let Some(et) = event_type {
            conditions.push(format!("event_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(et.as_str().to_string()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit_clause = limit.map(|l| format!(" LIMIT {}", l)).unwrap_or_default();

        let sql = format!(
            r#"
            SELECT id, timestamp, repo_full_name, event_type, severity, summary, details,
                acknowledged
            FROM events
            {}
            ORDER BY timestamp DESC, id DESC
            {}
            "#,
            where_clause, limit_clause
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let events = stmt
            .query_map(param_refs.as_slice(), event_from_row)
            .context("Failed to query events")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect events")?;

        Ok(events)
    }

    /// Get events for a specific repository
    pub fn get_events_for_repo(
        &self,
        repo_full_name: &str,
        limit: Option<u32>,
    ) -> Result<Vec<LifecycleEvent>> {
        let limit_clause = limit.map(|l| format!(" LIMIT {}", l)).unwrap_or_default();
        let sql = format!(
            r#"
            SELECT id, timestamp, repo_full_name, event_type, severity, summary, details,
                acknowledged
            FROM events
            WHERE repo_full_name = ?1
            ORDER BY timestamp DESC, id DESC
            {}
            "#,
            limit_clause
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![repo_full_name], event_from_row)
            .context("Failed to query events for repo")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect events")?;

        Ok(events)
    }

    /// Acknowledge all events
    pub fn acknowledge_all_events(&self) -> Result<u64> {
        let count = self
            .conn
            .execute(
                "UPDATE events SET acknowledged = 1 WHERE acknowledged = 0",
                [],
            )
            .context("Failed to acknowledge all events")?;
        Ok(count as u64)
    }

    /// Clean up old events (keep last N days)
    pub fn cleanup_old_events(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let count = self
            .conn
            .execute(
                "DELETE FROM events WHERE timestamp < ?1 AND acknowledged = 1",
                params![cutoff.to_rfc3339()],
            )
            .context("Failed to cleanup old events")?;
        Ok(count as u64)
    }
}

fn write_repositories(tx: &Transaction<'_>, repositories: &[Repository]) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    tx.execute("DELETE FROM repositories", [])
        .context("Failed to clear repositories")?;

    for repository in repositories {
        let data = serde_json::to_string(repository)
            .with_context(|| format!("Failed to serialize {}", repository.full_name))?;
        tx.execute(
            r#"
            INSERT INTO repositories (id, full_name, category, installed, data, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                repository.id as i64,
                repository.full_name,
                repository.category.as_str(),
                repository.installed,
                data,
                now,
            ],
        )
        .with_context(|| format!("Failed to store {}", repository.full_name))?;
    }
    Ok(repositories.len())
}

fn load_json_column<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect stored records")?;

    rows.iter()
        .map(|data| serde_json::from_str(data).context("Corrupt stored record"))
        .collect()
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LifecycleEvent> {
    Ok(LifecycleEvent {
        id: row.get(0)?,
        timestamp: row
            .get::<_, String>(1)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        repo_full_name: row.get(2)?,
        event_type: EventType::parse(&row.get::<_, String>(3)?).unwrap_or(EventType::InstallFailed),
        severity: Severity::parse(&row.get::<_, String>(4)?).unwrap_or(Severity::Info),
        summary: row.get(5)?,
        details: row.get(6)?,
        acknowledged: row.get::<_, i32>(7)? != 0,
    })
}
