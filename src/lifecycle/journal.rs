//! Append-only record of the file effects of an installation
//!
//! Every directory created, file created and file replaced is recorded in
//! order. Reversal replays the entries backwards, which restores the exact
//! pre-install state even when one proposal touches the same path twice.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    DirCreated { path: PathBuf },
    Created { path: PathBuf },
    Replaced { path: PathBuf, backup: PathBuf },
}

impl JournalEntry {
    fn kind(&self) -> &'static str {
        match self {
            JournalEntry::DirCreated { .. } => "dir_created",
            JournalEntry::Created { .. } => "created",
            JournalEntry::Replaced { .. } => "replaced",
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            JournalEntry::DirCreated { path }
            | JournalEntry::Created { path }
            | JournalEntry::Replaced { path, .. } => path,
        }
    }
}

/// Files put back by [`Journal::reverse`] and files it could not put back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reversal {
    pub restored: Vec<String>,
    pub failed: Vec<String>,
}

impl Reversal {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: JournalEntry) {
        debug!("journal: {:?}", entry);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create `dir` and any missing parents, journalling each one created
    pub fn create_dir_all(&mut self, dir: &Path) -> std::io::Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }

        for path in missing.into_iter().rev() {
            std::fs::create_dir(&path)?;
            self.push(JournalEntry::DirCreated { path });
        }
        Ok(())
    }

    /// Undo every entry in reverse order. A failing entry does not stop the
    /// rest; it is reported in [`Reversal::failed`].
    pub fn reverse(&self) -> Reversal {
        let mut reversal = Reversal::default();

        for entry in self.entries.iter().rev() {
            match entry {
                JournalEntry::Replaced { path, backup } => {
                    if !backup.exists() {
                        warn!("Backup {} is missing; cannot restore {}", backup.display(), path.display());
                        reversal.failed.push(path.display().to_string());
                        continue;
                    }
                    match std::fs::copy(backup, path).and_then(|_| std::fs::remove_file(backup)) {
                        Ok(()) => reversal.restored.push(path.display().to_string()),
                        Err(e) => {
                            warn!("Failed to restore {}: {}", path.display(), e);
                            reversal.failed.push(path.display().to_string());
                        }
                    }
                }
                JournalEntry::Created { path } => {
                    if path.exists() {
                        match std::fs::remove_file(path) {
                            Ok(()) => reversal.restored.push(path.display().to_string()),
                            Err(e) => {
                                warn!("Failed to remove {}: {}", path.display(), e);
                                reversal.failed.push(path.display().to_string());
                            }
                        }
                    }
                }
                JournalEntry::DirCreated { path } => {
                    // only removed when empty
                    if let Err(e) = std::fs::remove_dir(path) {
                        debug!("Leaving directory {}: {}", path.display(), e);
                    }
                }
            }
        }

        reversal
    }

    /// Write the entries for a capability inside an existing transaction
    pub fn persist(&self, conn: &Connection, capability_id: &str) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO capability_journal (capability_id, seq, kind, path, backup_path) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (seq, entry) in self.entries.iter().enumerate() {
            let backup = match entry {
                JournalEntry::Replaced { backup, .. } => Some(backup.display().to_string()),
                _ => None,
            };
            stmt.execute(params![
                capability_id,
                seq as i64,
                entry.kind(),
                entry.path().display().to_string(),
                backup
            ])?;
        }
        Ok(())
    }

    /// Read back the entries recorded for a capability, in order
    pub fn load(conn: &Connection, capability_id: &str) -> Result<Self> {
        let mut stmt = conn.prepare_cached(
            "SELECT kind, path, backup_path FROM capability_journal WHERE capability_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([capability_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut journal = Journal::new();
        for (kind, path, backup) in rows {
            let path = PathBuf::from(path);
            let entry = match (kind.as_str(), backup) {
                ("dir_created", _) => JournalEntry::DirCreated { path },
                ("created", _) => JournalEntry::Created { path },
                ("replaced", Some(backup)) => JournalEntry::Replaced { path, backup: PathBuf::from(backup) },
                (other, _) => {
                    warn!("Ignoring malformed journal entry '{}' for {}", other, capability_id);
                    continue;
                }
            };
            journal.entries.push(entry);
        }
        Ok(journal)
    }
}
