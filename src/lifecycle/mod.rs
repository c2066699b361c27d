//! Capability lifecycle: install, reject, rollback, export and import
//!
//! Installation is all-or-nothing. Every file effect is journalled as it
//! happens; a validation, I/O or store failure part way through replays the
//! journal backwards before the error is reported. The journal is committed in
//! the same transaction as the capability row and is replayed again on rollback.
//!
//! Expected failures (unknown ids, wrong status, path rejections, dependency
//! blocks, declined confirmations) come back as an unsuccessful
//! [`LifecycleOutcome`]. Only store and I/O faults surface as `Err`, except a
//! rollback whose files could not all be restored: the capability is already
//! marked rolled back by then, so the outcome carries `FailureKind::Io` and
//! the paths left behind.

pub mod capabilities;
pub mod confirm;
pub mod content;
pub mod journal;
pub mod paths;
pub mod transfer;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::dependencies::{resolve_capability, DependencyGraph};
use crate::error::{EvolveError, FailureKind, Result};
use crate::gaps::repository as gap_store;
use crate::proposals::{self, ProposalRepository};
use crate::types::{format_timestamp, generate_id, CapabilityStatus, GapStatus, Proposal, ProposalStatus};

pub use capabilities::CapabilityRepository;
pub use confirm::{AutoConfirm, Confirm, StdinConfirm};
pub use journal::{Journal, JournalEntry, Reversal};
pub use paths::{InstallRoot, ALLOWED_INSTALL_DIRS};
pub use transfer::{CapabilityExport, ImportOutcome};

/// Structured result of a lifecycle operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleOutcome {
    pub success: bool,
    pub message: String,
    pub capability_id: Option<String>,
    pub proposal_id: Option<String>,
    /// Paths relative to the instance root
    pub files_affected: Vec<String>,
    pub warnings: Vec<String>,
    pub dependents: Vec<String>,
    pub failure: Option<FailureKind>,
}

impl LifecycleOutcome {
    fn failed(err: &EvolveError) -> Self {
        let dependents = match err {
            EvolveError::DependencyBlocked { dependents } => dependents.clone(),
            _ => Vec::new(),
        };
        Self {
            message: err.to_string(),
            dependents,
            failure: Some(err.kind()),
            ..Default::default()
        }
    }

    fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure: Some(FailureKind::Cancelled),
            ..Default::default()
        }
    }
}

/// Fold expected failures into an outcome, propagate faults
fn report(operation: &str, result: Result<LifecycleOutcome>) -> Result<LifecycleOutcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.kind().is_expected() => {
            match err.kind() {
                FailureKind::NotFound | FailureKind::InvalidState => info!("{} refused: {}", operation, err),
                _ => warn!("{} refused: {}", operation, err),
            }
            Ok(LifecycleOutcome::failed(&err))
        }
        Err(err) => Err(err),
    }
}

/// Up to 8 characters of the random part of a record id
fn short_id(id: &str) -> String {
    let tail = id.rsplit('-').next().unwrap_or(id);
    tail.chars().take(8).collect()
}

/// `<file>.<tag>.backup`, or `<file>.<tag>.<n>.backup` when that is taken
fn backup_path(path: &Path, tag: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut candidate = path.with_file_name(format!("{}.{}.backup", file_name, tag));
    let mut counter = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{}.{}.{}.backup", file_name, tag, counter));
        counter += 1;
    }
    candidate
}

fn write_owner_only(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub struct LifecycleManager<'a> {
    db: &'a Database,
    root: InstallRoot,
    confirm: &'a dyn Confirm,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(db: &'a Database, root: InstallRoot, confirm: &'a dyn Confirm) -> Self {
        Self { db, root, confirm }
    }

    pub fn root(&self) -> &InstallRoot {
        &self.root
    }

    /// Install a pending proposal's files and record the capability
    pub fn install(&self, proposal_id: &str) -> Result<LifecycleOutcome> {
        report("install", self.try_install(proposal_id))
    }

    /// Reject a pending proposal and reopen its gap for resynthesis
    pub fn reject(&self, proposal_id: &str, reason: &str) -> Result<LifecycleOutcome> {
        report("reject", self.try_reject(proposal_id, reason))
    }

    /// Reverse an active capability's file effects
    pub fn rollback(&self, capability: &str, force: bool) -> Result<LifecycleOutcome> {
        report("rollback", self.try_rollback(capability, force))
    }

    fn try_install(&self, proposal_id: &str) -> Result<LifecycleOutcome> {
        let proposal = ProposalRepository::new(self.db).get(proposal_id)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(EvolveError::InvalidState(format!(
                "proposal {} is not pending (status: {})",
                proposal.id, proposal.status
            )));
        }
        if proposal.files.is_empty() {
            return Err(EvolveError::InvalidState(format!("proposal {} has no files", proposal.id)));
        }
        let active: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT id FROM capabilities WHERE name = ?1 AND status = 'active'",
                [&proposal.capability_name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = active {
            return Err(EvolveError::InvalidState(format!(
                "capability '{}' is already active ({})",
                proposal.capability_name, existing
            )));
        }

        // validate everything before touching the filesystem
        let mut targets = Vec::with_capacity(proposal.files.len());
        for file in &proposal.files {
            targets.push(self.root.validate(&file.path)?);
        }

        let overwrites = targets.iter().filter(|p| p.exists()).count();
        if overwrites > 0 {
            let prompt = format!(
                "Installing '{}' overwrites {} existing file(s). Continue?",
                proposal.capability_name, overwrites
            );
            if !self.confirm.confirm(&prompt) {
                return Ok(LifecycleOutcome {
                    proposal_id: Some(proposal.id.clone()),
                    ..LifecycleOutcome::cancelled("Installation cancelled")
                });
            }
        }

        let mut warnings = Vec::new();
        for file in &proposal.files {
            for warning in content::scan(&file.content) {
                warn!("{}: {}", file.path, warning);
                warnings.push(format!("{}: {}", file.path, warning));
            }
        }

        let mut journal = Journal::new();
        if let Err(err) = self.write_files(&proposal, &mut journal) {
            warn!("Install of {} failed, reversing partial writes: {}", proposal.id, err);
            self.reverse_after_failure(&proposal.id, &journal);
            return Err(err);
        }

        let capability_id = generate_id("cap");
        let mut seen = HashSet::new();
        let installed: Vec<String> = proposal
            .files
            .iter()
            .filter(|f| seen.insert(f.path.clone()))
            .map(|f| f.path.clone())
            .collect();

        let committed = self.db.immediate(|tx| {
            let status: String =
                tx.query_row("SELECT status FROM proposals WHERE id = ?1", [&proposal.id], |row| row.get(0))?;
            if status != ProposalStatus::Pending.as_str() {
                return Err(EvolveError::InvalidState(format!(
                    "proposal {} changed to {} during install",
                    proposal.id, status
                )));
            }

            let now = Utc::now();
            tx.execute(
                "INSERT INTO capabilities (id, name, capability_type, scope, source_proposal_id, source_gap_id,
                     installed_files_json, status, installed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8)",
                params![
                    capability_id,
                    proposal.capability_name,
                    proposal.capability_type,
                    proposal.scope,
                    proposal.id,
                    proposal.gap_id,
                    serde_json::to_string(&installed)?,
                    format_timestamp(&now),
                ],
            )?;
            journal.persist(tx, &capability_id)?;
            proposals::set_status(tx, &proposal.id, ProposalStatus::Installed, None)?;
            gap_store::set_status(tx, &proposal.gap_id, GapStatus::Resolved, &now)?;
            Ok(())
        });
        if let Err(err) = committed {
            warn!("Recording install of {} failed, reversing files: {}", proposal.id, err);
            self.reverse_after_failure(&proposal.id, &journal);
            return Err(err);
        }

        info!(
            "Installed capability {} ({}) from proposal {}",
            proposal.capability_name, capability_id, proposal.id
        );
        Ok(LifecycleOutcome {
            success: true,
            message: format!("Installed capability: {}", proposal.capability_name),
            capability_id: Some(capability_id),
            proposal_id: Some(proposal.id.clone()),
            files_affected: installed,
            warnings,
            ..Default::default()
        })
    }

    fn relative_all(&self, paths: &[String]) -> Vec<String> {
        paths.iter().map(|p| self.root.relative(Path::new(p))).collect()
    }

    fn reverse_after_failure(&self, proposal_id: &str, journal: &Journal) {
        let reversal = journal.reverse();
        if !reversal.is_complete() {
            error!(
                "Could not undo every write of proposal {}; left behind: {}",
                proposal_id,
                reversal.failed.join(", ")
            );
        }
    }

    /// Write phase; every effect lands in `journal` before the next one starts
    fn write_files(&self, proposal: &Proposal, journal: &mut Journal) -> Result<()> {
        let tag = short_id(&proposal.id);

        for file in &proposal.files {
            let path = self.root.validate(&file.path)?;
            if let Some(parent) = path.parent() {
                journal.create_dir_all(parent)?;
            }

            if path.exists() {
                let backup = backup_path(&path, &tag);
                fs::copy(&path, &backup)?;
                debug!("Backed up {} to {}", path.display(), backup.display());
                journal.push(JournalEntry::Replaced { path: path.clone(), backup });
            } else {
                journal.push(JournalEntry::Created { path: path.clone() });
            }
            write_owner_only(&path, &file.content)?;
        }
        Ok(())
    }

    fn try_reject(&self, proposal_id: &str, reason: &str) -> Result<LifecycleOutcome> {
        let proposal = ProposalRepository::new(self.db).get(proposal_id)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(EvolveError::InvalidState(format!(
                "proposal {} is not pending (status: {})",
                proposal.id, proposal.status
            )));
        }

        self.db.immediate(|tx| {
            proposals::set_status(tx, &proposal.id, ProposalStatus::Rejected, Some(reason))?;
            tx.execute(
                "UPDATE gaps SET status = 'pending', updated_at = ?1 WHERE id = ?2 AND status = 'proposed'",
                params![format_timestamp(&Utc::now()), proposal.gap_id],
            )?;
            Ok(())
        })?;

        info!("Rejected proposal {} ({})", proposal.id, reason);
        Ok(LifecycleOutcome {
            success: true,
            message: format!("Rejected proposal: {}", proposal.capability_name),
            proposal_id: Some(proposal.id),
            ..Default::default()
        })
    }

    fn try_rollback(&self, key: &str, force: bool) -> Result<LifecycleOutcome> {
        let id = resolve_capability(self.db.conn(), key)?;
        let capability = capabilities::load(self.db.conn(), &id)?;
        if capability.status != CapabilityStatus::Active {
            return Err(EvolveError::InvalidState(format!(
                "capability {} is not active (status: {})",
                capability.name, capability.status
            )));
        }

        let check = DependencyGraph::new(self.db).check_rollback(&capability.id)?;
        if check.is_blocked() {
            return Err(EvolveError::DependencyBlocked {
                dependents: check.required.iter().map(|e| e.capability_name.clone()).collect(),
            });
        }

        let optional: Vec<String> = check.optional.iter().map(|e| e.capability_name.clone()).collect();
        if !optional.is_empty() && !force {
            info!("Rollback of {} needs --force: optional dependents {:?}", capability.name, optional);
            return Ok(LifecycleOutcome {
                message: format!(
                    "Has optional dependents: {}. Use --force to rollback anyway.",
                    optional.join(", ")
                ),
                capability_id: Some(capability.id),
                dependents: optional,
                failure: Some(FailureKind::DependencyBlocked),
                ..Default::default()
            });
        }

        let prompt = if optional.is_empty() {
            format!("Roll back capability '{}'?", capability.name)
        } else {
            format!(
                "Force rollback of '{}' although {} depend on it?",
                capability.name,
                optional.join(", ")
            )
        };
        if !self.confirm.confirm(&prompt) {
            return Ok(LifecycleOutcome {
                capability_id: Some(capability.id),
                ..LifecycleOutcome::cancelled("Rollback cancelled")
            });
        }

        let journal = self.db.immediate(|tx| {
            let updated = tx.execute(
                "UPDATE capabilities SET status = 'rolled_back', rolled_back_at = ?1 WHERE id = ?2 AND status = 'active'",
                params![format_timestamp(&Utc::now()), capability.id],
            )?;
            if updated == 0 {
                return Err(EvolveError::InvalidState(format!(
                    "capability {} is no longer active",
                    capability.name
                )));
            }
            if let Some(proposal_id) = &capability.source_proposal_id {
                proposals::set_status(tx, proposal_id, ProposalStatus::RolledBack, None)?;
            }
            Journal::load(tx, &capability.id)
        })?;

        let reversal = journal.reverse();
        let files_affected = self.relative_all(&reversal.restored);

        if !reversal.is_complete() {
            let failed = self.relative_all(&reversal.failed);
            error!(
                "Rolled back capability {} but could not restore: {}",
                capability.name,
                failed.join(", ")
            );
            return Ok(LifecycleOutcome {
                message: format!(
                    "Rolled back {} but could not restore: {}",
                    capability.name,
                    failed.join(", ")
                ),
                capability_id: Some(capability.id),
                proposal_id: capability.source_proposal_id,
                files_affected,
                warnings: failed.iter().map(|p| format!("{}: not restored", p)).collect(),
                dependents: optional,
                failure: Some(FailureKind::Io),
                ..Default::default()
            });
        }

        info!(
            "Rolled back capability {} ({} files)",
            capability.name,
            files_affected.len()
        );
        Ok(LifecycleOutcome {
            success: true,
            message: format!("Rolled back capability: {}", capability.name),
            capability_id: Some(capability.id),
            proposal_id: capability.source_proposal_id,
            files_affected,
            dependents: optional,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::confirm::MockConfirm;
    use super::*;
    use crate::types::FileInstruction;

    fn seed_proposal(db: &Database, files: Vec<FileInstruction>) -> String {
        db.conn()
            .execute(
                "INSERT INTO gaps (id, gap_type, confidence, recommended_scope, desired_capability,
                     detector_rule_id, fingerprint, status, created_at, updated_at)
                 VALUES ('gap-1', 'tool', 0.7, 'global', 'read pdf', 'r', 'fp', 'proposed',
                     '2026-10-01T00:00:00Z', '2026-10-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let proposal = Proposal {
            id: "prop-0123456789ab".into(),
            gap_id: "gap-1".into(),
            capability_type: "skill".into(),
            capability_name: "pdf-reader".into(),
            capability_summary: String::new(),
            scope: "global".into(),
            confidence: 0.7,
            reasoning: String::new(),
            files,
            status: ProposalStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            reviewed_at: None,
        };
        proposals::insert(db.conn(), &proposal).unwrap();
        proposal.id
    }

    #[test]
    fn test_short_id_and_backup_naming() {
        assert_eq!(short_id("prop-0123456789ab"), "01234567");

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("SKILL.md");
        assert_eq!(backup_path(&file, "abc"), dir.path().join("SKILL.md.abc.backup"));
        fs::write(dir.path().join("SKILL.md.abc.backup"), "old").unwrap();
        assert_eq!(backup_path(&file, "abc"), dir.path().join("SKILL.md.abc.1.backup"));
    }

    #[test]
    fn test_declined_overwrite_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let existing = dir.path().join("evolved/skills/pdf/SKILL.md");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "mine").unwrap();
        let id = seed_proposal(&db, vec![FileInstruction::create("evolved/skills/pdf/SKILL.md", "theirs")]);

        let mut confirm = MockConfirm::new();
        confirm.expect_confirm().times(1).return_const(false);
        let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);

        let outcome = manager.install(&id).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Cancelled));
        assert_eq!(fs::read_to_string(&existing).unwrap(), "mine");
        assert_eq!(
            ProposalRepository::new(&db).get(&id).unwrap().status,
            ProposalStatus::Pending
        );
    }

    #[test]
    fn test_fresh_install_does_not_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let id = seed_proposal(&db, vec![FileInstruction::create("evolved/skills/pdf/SKILL.md", "# PDF\n")]);

        let mut confirm = MockConfirm::new();
        confirm.expect_confirm().times(0);
        let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);

        let outcome = manager.install(&id[..9]).unwrap();
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.files_affected, vec!["evolved/skills/pdf/SKILL.md".to_string()]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("evolved/skills/pdf/SKILL.md"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_same_path_twice_reverses_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let target = dir.path().join("evolved/hooks/h.md");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "original").unwrap();
        let id = seed_proposal(
            &db,
            vec![
                FileInstruction::create("evolved/hooks/h.md", "first"),
                FileInstruction::create("evolved/hooks/h.md", "second"),
            ],
        );

        let confirm = AutoConfirm(true);
        let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);
        let installed = manager.install(&id).unwrap();
        assert!(installed.success);
        assert_eq!(fs::read_to_string(&target).unwrap(), "second");

        let rolled = manager.rollback("pdf-reader", false).unwrap();
        assert!(rolled.success, "{}", rolled.message);
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_reject_reopens_proposed_gap() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let id = seed_proposal(&db, vec![FileInstruction::create("evolved/skills/pdf/SKILL.md", "x")]);
        let confirm = AutoConfirm(true);
        let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);

        assert!(manager.reject(&id, "too vague").unwrap().success);
        let proposal = ProposalRepository::new(&db).get(&id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Rejected);
        assert_eq!(proposal.rejection_reason.as_deref(), Some("too vague"));
        let gap = crate::gaps::GapRepository::new(&db).get("gap-1").unwrap();
        assert_eq!(gap.status, GapStatus::Pending);

        let again = manager.reject(&id, "twice").unwrap();
        assert_eq!(again.failure, Some(FailureKind::InvalidState));
    }
}
