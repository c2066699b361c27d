//! SQLite datastore shared by the gap repository, lifecycle manager and dependency graph
//!
//! One connection per invocation. Overlapping short-lived processes are
//! tolerated through WAL journaling and a bounded busy wait; every multi-row
//! write goes through [`Database::immediate`] so the write lock is taken up front.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::types::format_timestamp;

/// Default bounded wait for the write lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Observation ids already run through detection
    CREATE TABLE IF NOT EXISTS processed_observations (
        observation_id TEXT PRIMARY KEY,
        processed_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gaps (
        id TEXT PRIMARY KEY,
        gap_type TEXT NOT NULL,
        domain TEXT,
        confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        recommended_scope TEXT NOT NULL,
        project_path TEXT,
        desired_capability TEXT NOT NULL,
        evidence_summary TEXT NOT NULL DEFAULT '',
        detector_rule_id TEXT NOT NULL,
        detector_rule_version INTEGER NOT NULL DEFAULT 1,
        fingerprint TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'proposed', 'resolved', 'dismissed')),
        dismissed_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS gap_observations (
        gap_id TEXT NOT NULL REFERENCES gaps(id) ON DELETE CASCADE,
        observation_id TEXT NOT NULL,
        PRIMARY KEY (gap_id, observation_id)
    );

    CREATE TABLE IF NOT EXISTS proposals (
        id TEXT PRIMARY KEY,
        gap_id TEXT NOT NULL REFERENCES gaps(id),
        capability_type TEXT NOT NULL,
        capability_name TEXT NOT NULL,
        capability_summary TEXT NOT NULL DEFAULT '',
        scope TEXT NOT NULL,
        confidence REAL NOT NULL,
        reasoning TEXT NOT NULL DEFAULT '',
        files_json TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'installed', 'rejected', 'rolled_back')),
        rejection_reason TEXT,
        created_at TEXT NOT NULL,
        reviewed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS capabilities (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        capability_type TEXT NOT NULL,
        scope TEXT NOT NULL,
        source_proposal_id TEXT REFERENCES proposals(id),
        source_gap_id TEXT REFERENCES gaps(id),
        installed_files_json TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'rolled_back', 'deprecated')),
        installed_at TEXT NOT NULL,
        rolled_back_at TEXT
    );

    -- File effects of an install, replayed in reverse on rollback
    CREATE TABLE IF NOT EXISTS capability_journal (
        capability_id TEXT NOT NULL REFERENCES capabilities(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('dir_created', 'created', 'replaced')),
        path TEXT NOT NULL,
        backup_path TEXT,
        PRIMARY KEY (capability_id, seq)
    );

    CREATE TABLE IF NOT EXISTS capability_dependencies (
        capability_id TEXT NOT NULL REFERENCES capabilities(id),
        depends_on_id TEXT NOT NULL REFERENCES capabilities(id),
        dependency_type TEXT NOT NULL
            CHECK (dependency_type IN ('required', 'optional', 'suggested')),
        notes TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (capability_id, depends_on_id)
    );

    CREATE TABLE IF NOT EXISTS capability_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        capability_id TEXT NOT NULL REFERENCES capabilities(id),
        session_id TEXT,
        observation_id TEXT,
        context TEXT,
        used_at TEXT NOT NULL,
        UNIQUE (capability_id, observation_id)
    );

    CREATE INDEX IF NOT EXISTS idx_gaps_type_status ON gaps(gap_type, status);
    CREATE INDEX IF NOT EXISTS idx_gaps_fingerprint ON gaps(fingerprint);
    CREATE INDEX IF NOT EXISTS idx_proposals_gap ON proposals(gap_id);
    CREATE INDEX IF NOT EXISTS idx_dependencies_target ON capability_dependencies(depends_on_id);
    CREATE INDEX IF NOT EXISTS idx_usage_capability ON capability_usage(capability_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_capabilities_active_name
        ON capabilities(name) WHERE status = 'active';
"#;

/// Handle on the capsmith database
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (creating if needed) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        debug!("Opened database at {}", path.display());
        Self::configure(conn, lock_timeout)
    }

    /// Private in-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?, DEFAULT_LOCK_TIMEOUT)
    }

    fn configure(conn: Connection, lock_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(lock_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `operation` inside a `BEGIN IMMEDIATE` transaction.
    /// Commits on `Ok`; any `Err` rolls back when the transaction drops.
    pub fn immediate<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = operation(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, format_timestamp(&chrono::Utc::now())],
        )?;
        Ok(())
    }

    /// Whether an observation has already been through detection
    pub fn is_processed(&self, observation_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_observations WHERE observation_id = ?1",
                [observation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Row counts per table and status
    pub fn summary(&self) -> Result<StoreSummary> {
        Ok(StoreSummary {
            processed_observations: self.count("SELECT COUNT(*) FROM processed_observations")?,
            gaps: self.group_counts("SELECT status, COUNT(*) FROM gaps GROUP BY status ORDER BY status")?,
            proposals: self
                .group_counts("SELECT status, COUNT(*) FROM proposals GROUP BY status ORDER BY status")?,
            capabilities: self.group_counts(
                "SELECT status, COUNT(*) FROM capabilities GROUP BY status ORDER BY status",
            )?,
            dependencies: self.count("SELECT COUNT(*) FROM capability_dependencies")?,
            usage_events: self.count("SELECT COUNT(*) FROM capability_usage")?,
            last_detection: self.get_metadata(crate::gaps::schedule::LAST_SUCCESS_KEY)?,
            last_detection_attempt: self.get_metadata(crate::gaps::schedule::LAST_ATTEMPT_KEY)?,
        })
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn group_counts(&self, sql: &str) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let n: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, n.max(0) as u64))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// Snapshot of store contents for `status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSummary {
    pub processed_observations: u64,
    pub gaps: Vec<(String, u64)>,
    pub proposals: Vec<(String, u64)>,
    pub capabilities: Vec<(String, u64)>,
    pub dependencies: u64,
    pub usage_events: u64,
    pub last_detection: Option<String>,
    pub last_detection_attempt: Option<String>,
}

impl StoreSummary {
    pub fn total(counts: &[(String, u64)]) -> u64 {
        counts.iter().map(|(_, n)| n).sum()
    }
}
