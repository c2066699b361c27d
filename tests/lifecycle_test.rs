//! Install, rollback and dependency behaviour against a real instance root

use anyhow::Result;
use capsmith::db::Database;
use capsmith::dependencies::DependencyGraph;
use capsmith::detection::DetectedGap;
use capsmith::error::FailureKind;
use capsmith::gaps::GapRepository;
use capsmith::lifecycle::{transfer, AutoConfirm, CapabilityRepository, InstallRoot, LifecycleManager};
use capsmith::proposals::ProposalRepository;
use capsmith::synthesis::{GeneratedArtifacts, ProposalGenerator, Synthesizer};
use capsmith::types::{CapabilityStatus, DependencyType, FileInstruction, Gap, GapStatus, ProposalStatus};
use std::fs;
use std::path::Path;

/// Generator that always proposes the same files
struct FixedGenerator {
    name: String,
    files: Vec<FileInstruction>,
}

impl FixedGenerator {
    fn new(name: &str, files: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            files: files.iter().map(|(p, c)| FileInstruction::create(*p, *c)).collect(),
        }
    }
}

impl ProposalGenerator for FixedGenerator {
    fn generate(&self, gap: &Gap) -> Result<GeneratedArtifacts> {
        Ok(GeneratedArtifacts {
            capability_type: "skill".into(),
            capability_name: self.name.clone(),
            summary: gap.desired_capability.clone(),
            reasoning: "fixed".into(),
            files: self.files.clone(),
        })
    }
}

fn seed_gap(db: &Database, desired: &str) -> String {
    let gap = DetectedGap {
        gap_type: "tool".into(),
        domain: None,
        confidence: 0.7,
        recommended_scope: "global".into(),
        project_path: None,
        desired_capability: desired.into(),
        evidence_summary: format!("[2026-10-01] Bash: {}", desired),
        detector_rule_id: "tool-errors".into(),
        detector_rule_version: 1,
        observation_ids: vec![format!("obs-{}", desired.len())],
    };
    GapRepository::new(db).save(&gap).unwrap().gap_id
}

fn propose(db: &Database, desired: &str, generator: &FixedGenerator) -> String {
    let gap_id = seed_gap(db, desired);
    Synthesizer::new(db, generator).synthesize(&gap_id).unwrap().id
}

fn install(db: &Database, root: &Path, generator: &FixedGenerator, desired: &str) -> String {
    let proposal_id = propose(db, desired, generator);
    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(db, InstallRoot::new(root).unwrap(), &confirm);
    let outcome = manager.install(&proposal_id).unwrap();
    assert!(outcome.success, "{}", outcome.message);
    outcome.capability_id.unwrap()
}

fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[test]
fn test_disallowed_path_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let generator = FixedGenerator::new(
        "mixed",
        &[
            ("evolved/skills/mixed/SKILL.md", "# Mixed\n"),
            ("scripts/setup.sh", "echo setup\n"),
        ],
    );
    let proposal_id = propose(&db, "set up the build toolchain", &generator);

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);
    let outcome = manager.install(&proposal_id).unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::PathNotAllowed));
    assert!(snapshot(dir.path()).is_empty());
    assert_eq!(
        ProposalRepository::new(&db).get(&proposal_id).unwrap().status,
        ProposalStatus::Pending
    );
    assert!(CapabilityRepository::new(&db).list(None).unwrap().is_empty());
}

#[test]
fn test_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let generator = FixedGenerator::new("escape", &[("evolved/skills/../../outside.md", "x")]);
    let proposal_id = propose(&db, "escape the instance root", &generator);

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);
    let outcome = manager.install(&proposal_id).unwrap();

    assert_eq!(outcome.failure, Some(FailureKind::PathTraversal));
    assert!(!dir.path().parent().unwrap().join("outside.md").exists());
}

#[test]
fn test_install_then_rollback_restores_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let db = Database::open_in_memory().unwrap();

    fs::create_dir_all(root.join("evolved/hooks")).unwrap();
    fs::write(root.join("evolved/hooks/pre-commit.md"), b"user hook\n").unwrap();
    fs::write(root.join("notes.txt"), b"untouched\n").unwrap();
    let before = snapshot(root);

    let generator = FixedGenerator::new(
        "commit-guard",
        &[
            ("evolved/skills/commit-guard/SKILL.md", "# Commit guard\n"),
            ("evolved/skills/commit-guard/reference/checks.md", "- lint\n"),
            ("evolved/hooks/pre-commit.md", "generated hook\n"),
        ],
    );
    let cap_id = install(&db, root, &generator, "guard commits against lint failures");
    assert_eq!(
        fs::read_to_string(root.join("evolved/hooks/pre-commit.md")).unwrap(),
        "generated hook\n"
    );

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(root).unwrap(), &confirm);
    let outcome = manager.rollback(&cap_id, false).unwrap();
    assert!(outcome.success, "{}", outcome.message);

    assert_eq!(snapshot(root), before);
    assert!(!root.join("evolved/skills/commit-guard").exists());

    let capability = CapabilityRepository::new(&db).get(&cap_id).unwrap();
    assert_eq!(capability.status, CapabilityStatus::RolledBack);
    assert!(capability.rolled_back_at.is_some());
    let proposal = ProposalRepository::new(&db)
        .get(capability.source_proposal_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::RolledBack);

    // a second rollback is refused
    let again = manager.rollback(&cap_id, false).unwrap();
    assert_eq!(again.failure, Some(FailureKind::InvalidState));
}

#[test]
fn test_required_dependent_blocks_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let a = install(
        &db,
        dir.path(),
        &FixedGenerator::new("alpha", &[("evolved/skills/alpha/SKILL.md", "# A\n")]),
        "alpha capability for parsing",
    );
    let b = install(
        &db,
        dir.path(),
        &FixedGenerator::new("beta", &[("evolved/skills/beta/SKILL.md", "# B\n")]),
        "beta capability for rendering",
    );

    let graph = DependencyGraph::new(&db);
    graph.add("beta", "alpha", DependencyType::Required, None).unwrap();
    assert!(graph.add("alpha", "beta", DependencyType::Required, None).is_err());

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);

    let blocked = manager.rollback("alpha", true).unwrap();
    assert!(!blocked.success);
    assert_eq!(blocked.failure, Some(FailureKind::DependencyBlocked));
    assert_eq!(blocked.dependents, vec!["beta".to_string()]);
    assert!(dir.path().join("evolved/skills/alpha/SKILL.md").exists());

    assert!(manager.rollback(&b, false).unwrap().success);
    assert!(manager.rollback(&a, false).unwrap().success);
    assert!(!dir.path().join("evolved/skills/alpha/SKILL.md").exists());
}

#[test]
fn test_optional_dependent_needs_force() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    install(
        &db,
        dir.path(),
        &FixedGenerator::new("alpha", &[("evolved/skills/alpha/SKILL.md", "# A\n")]),
        "alpha capability for parsing",
    );
    install(
        &db,
        dir.path(),
        &FixedGenerator::new("beta", &[("evolved/skills/beta/SKILL.md", "# B\n")]),
        "beta capability for rendering",
    );
    DependencyGraph::new(&db)
        .add("beta", "alpha", DependencyType::Optional, Some("nicer output"))
        .unwrap();

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);

    let held = manager.rollback("alpha", false).unwrap();
    assert!(!held.success);
    assert_eq!(held.failure, Some(FailureKind::DependencyBlocked));
    assert!(held.message.contains("Use --force"));
    assert!(dir.path().join("evolved/skills/alpha/SKILL.md").exists());

    let forced = manager.rollback("alpha", true).unwrap();
    assert!(forced.success, "{}", forced.message);
    assert_eq!(forced.dependents, vec!["beta".to_string()]);
    assert!(!dir.path().join("evolved/skills/alpha/SKILL.md").exists());
}

#[test]
fn test_declined_rollback_keeps_capability() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let cap_id = install(
        &db,
        dir.path(),
        &FixedGenerator::new("alpha", &[("evolved/skills/alpha/SKILL.md", "# A\n")]),
        "alpha capability for parsing",
    );

    let decline = AutoConfirm(false);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &decline);
    let outcome = manager.rollback(&cap_id, false).unwrap();
    assert_eq!(outcome.failure, Some(FailureKind::Cancelled));
    assert_eq!(
        CapabilityRepository::new(&db).get(&cap_id).unwrap().status,
        CapabilityStatus::Active
    );
}

#[test]
fn test_reject_then_resynthesize() {
    let db = Database::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let generator = FixedGenerator::new("gamma", &[("evolved/skills/gamma/SKILL.md", "# G\n")]);
    let proposal_id = propose(&db, "gamma capability for exports", &generator);

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);
    assert!(manager.reject(&proposal_id, "too broad").unwrap().success);

    let proposal = ProposalRepository::new(&db).get(&proposal_id).unwrap();
    assert_eq!(proposal.status, ProposalStatus::Rejected);
    assert_eq!(proposal.rejection_reason.as_deref(), Some("too broad"));
    let gap = GapRepository::new(&db).get(&proposal.gap_id).unwrap();
    assert_eq!(gap.status, GapStatus::Pending);

    let second = Synthesizer::new(&db, &generator).synthesize(&gap.id).unwrap();
    assert_ne!(second.id, proposal_id);
    assert_eq!(ProposalRepository::new(&db).for_gap(&gap.id).unwrap().len(), 2);

    // installing the rejected proposal is refused
    assert_eq!(
        manager.install(&proposal_id).unwrap().failure,
        Some(FailureKind::InvalidState)
    );
}

#[test]
fn test_ambiguous_capability_prefix_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    install(
        &db,
        dir.path(),
        &FixedGenerator::new("alpha", &[("evolved/skills/alpha/SKILL.md", "# A\n")]),
        "alpha capability for parsing",
    );
    install(
        &db,
        dir.path(),
        &FixedGenerator::new("beta", &[("evolved/skills/beta/SKILL.md", "# B\n")]),
        "beta capability for rendering",
    );

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(dir.path()).unwrap(), &confirm);
    let outcome = manager.rollback("cap", false).unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::InvalidState));
    assert!(outcome.message.contains("ambiguous"));

    assert_eq!(
        manager.rollback("cap-zzzz", false).unwrap().failure,
        Some(FailureKind::NotFound)
    );
    assert!(dir.path().join("evolved/skills/alpha/SKILL.md").exists());
    assert!(dir.path().join("evolved/skills/beta/SKILL.md").exists());
    assert_eq!(
        CapabilityRepository::new(&db).list(Some(CapabilityStatus::Active)).unwrap().len(),
        2
    );
}

#[test]
fn test_rollback_with_missing_backup_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let db = Database::open_in_memory().unwrap();
    let hooks = root.join("evolved/hooks");
    fs::create_dir_all(&hooks).unwrap();
    fs::write(hooks.join("h.md"), "user hook\n").unwrap();

    let cap_id = install(
        &db,
        root,
        &FixedGenerator::new("hooker", &[("evolved/hooks/h.md", "generated")]),
        "hook into session start",
    );
    let backup = fs::read_dir(&hooks)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.to_string_lossy().ends_with(".backup"))
        .unwrap();
    fs::remove_file(&backup).unwrap();

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(root).unwrap(), &confirm);
    let outcome = manager.rollback(&cap_id, false).unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::Io));
    assert!(outcome.message.contains("evolved/hooks/h.md"), "{}", outcome.message);
    assert_eq!(outcome.warnings, vec!["evolved/hooks/h.md: not restored".to_string()]);
    assert!(outcome.files_affected.is_empty());
    assert_eq!(fs::read_to_string(hooks.join("h.md")).unwrap(), "generated");
    assert_eq!(
        CapabilityRepository::new(&db).get(&cap_id).unwrap().status,
        CapabilityStatus::RolledBack
    );
}

#[test]
fn test_write_failure_midway_reverses_earlier_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let db = Database::open_in_memory().unwrap();
    fs::create_dir_all(root.join("evolved")).unwrap();
    // a plain file where a directory is needed
    fs::write(root.join("evolved/hooks"), "not a directory").unwrap();

    let generator = FixedGenerator::new(
        "stage",
        &[
            ("evolved/skills/stage/SKILL.md", "# Stage\n"),
            ("evolved/hooks/h.md", "hook\n"),
        ],
    );
    let proposal_id = propose(&db, "stage deployments behind a hook", &generator);

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(root).unwrap(), &confirm);
    assert!(manager.install(&proposal_id).is_err());

    assert!(!root.join("evolved/skills").exists());
    assert_eq!(fs::read_to_string(root.join("evolved/hooks")).unwrap(), "not a directory");
    assert_eq!(
        ProposalRepository::new(&db).get(&proposal_id).unwrap().status,
        ProposalStatus::Pending
    );
    assert!(CapabilityRepository::new(&db).list(None).unwrap().is_empty());
}

#[test]
fn test_store_failure_after_writes_reverses_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let db = Database::open_in_memory().unwrap();
    let generator = FixedGenerator::new("ledger", &[("evolved/skills/ledger/SKILL.md", "# Ledger\n")]);
    let proposal_id = propose(&db, "ledger of expense receipts", &generator);
    db.conn().execute_batch("DROP TABLE capability_journal;").unwrap();

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&db, InstallRoot::new(root).unwrap(), &confirm);
    assert!(manager.install(&proposal_id).is_err());

    assert!(!root.join("evolved/skills/ledger/SKILL.md").exists());
    assert!(snapshot(root).is_empty());
    assert_eq!(
        ProposalRepository::new(&db).get(&proposal_id).unwrap().status,
        ProposalStatus::Pending
    );
}

#[test]
fn test_export_then_import_into_another_instance() {
    let source_dir = tempfile::tempdir().unwrap();
    let source_db = Database::open_in_memory().unwrap();
    install(
        &source_db,
        source_dir.path(),
        &FixedGenerator::new(
            "pdf-reader",
            &[
                ("evolved/skills/pdf-reader/SKILL.md", "# PDF reader\n"),
                ("evolved/skills/pdf-reader/reference/tools.md", "- pdftotext\n"),
            ],
        ),
        "read pdf documents",
    );

    let export_path = source_dir.path().join("pdf-reader.json");
    let written = transfer::export_to_file(
        &source_db,
        &InstallRoot::new(source_dir.path()).unwrap(),
        "pdf-reader",
        Some(&export_path),
    )
    .unwrap();
    assert_eq!(written, export_path);

    let target_dir = tempfile::tempdir().unwrap();
    let target_db = Database::open_in_memory().unwrap();
    let target_root = InstallRoot::new(target_dir.path()).unwrap();
    let imported = transfer::import_from_file(&target_db, &target_root, &export_path, false).unwrap();
    assert_eq!(imported.proposal.status, ProposalStatus::Pending);
    assert_eq!(imported.proposal.files.len(), 2);
    assert!(snapshot(target_dir.path()).is_empty());

    let confirm = AutoConfirm(true);
    let manager = LifecycleManager::new(&target_db, target_root, &confirm);
    let outcome = manager.install(&imported.proposal.id).unwrap();
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(
        fs::read_to_string(target_dir.path().join("evolved/skills/pdf-reader/reference/tools.md")).unwrap(),
        "- pdftotext\n"
    );

    // importing over an active capability is refused
    let again = transfer::import_from_file(&target_db, manager.root(), &export_path, false);
    assert!(matches!(again, Err(capsmith::EvolveError::InvalidState(_))));
}
