//! Proposal synthesis
//!
//! A [`ProposalGenerator`] turns a gap into capability metadata plus an
//! ordered list of file instructions. The [`Synthesizer`] persists the result
//! as a pending proposal and moves the gap to `proposed` in one transaction.

pub mod review;
pub mod templates;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::EvolveError;
use crate::gaps::GapRepository;
use crate::proposals;
use crate::types::{format_timestamp, generate_id, FileInstruction, Gap, GapStatus, Proposal, ProposalStatus};

pub use review::ProposalReview;
pub use templates::TemplateGenerator;

/// What a generator produces for one gap
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifacts {
    pub capability_type: String,
    pub capability_name: String,
    pub summary: String,
    pub reasoning: String,
    pub files: Vec<FileInstruction>,
}

/// Content generation boundary
#[cfg_attr(test, mockall::automock)]
pub trait ProposalGenerator {
    fn generate(&self, gap: &Gap) -> Result<GeneratedArtifacts>;
}

pub struct Synthesizer<'a> {
    db: &'a Database,
    generator: &'a dyn ProposalGenerator,
}

impl<'a> Synthesizer<'a> {
    pub fn new(db: &'a Database, generator: &'a dyn ProposalGenerator) -> Self {
        Self { db, generator }
    }

    /// Generate and store a proposal for one pending gap
    pub fn synthesize(&self, gap_id: &str) -> Result<Proposal> {
        let gap = GapRepository::new(self.db).get(gap_id)?;
        if gap.status != GapStatus::Pending {
            return Err(EvolveError::InvalidState(format!(
                "gap {} is {} and cannot be synthesized",
                gap.id, gap.status
            ))
            .into());
        }

        let artifacts = self
            .generator
            .generate(&gap)
            .with_context(|| format!("Failed to generate artifacts for gap {}", gap.id))?;
        if artifacts.files.is_empty() {
            anyhow::bail!("Generator produced no files for gap {}", gap.id);
        }

        let proposal = Proposal {
            id: generate_id("prop"),
            gap_id: gap.id.clone(),
            capability_type: artifacts.capability_type,
            capability_name: artifacts.capability_name,
            capability_summary: artifacts.summary,
            scope: gap.recommended_scope.clone(),
            confidence: gap.confidence,
            reasoning: artifacts.reasoning,
            files: artifacts.files,
            status: ProposalStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            reviewed_at: None,
        };

        self.db.immediate(|tx| {
            let moved = tx.execute(
                "UPDATE gaps SET status = 'proposed', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![format_timestamp(&proposal.created_at), proposal.gap_id],
            )?;
            if moved == 0 {
                return Err(EvolveError::InvalidState(format!(
                    "gap {} is no longer pending",
                    proposal.gap_id
                )));
            }
            proposals::insert(tx, &proposal)
        })?;

        info!(
            "Proposed {} '{}' ({}) for gap {}",
            proposal.capability_type, proposal.capability_name, proposal.id, proposal.gap_id
        );
        Ok(proposal)
    }

    /// Synthesize the highest-confidence pending gaps; failures are logged and skipped
    pub fn synthesize_pending(&self, limit: usize) -> Result<Vec<Proposal>> {
        let gaps = GapRepository::new(self.db).list(Some(GapStatus::Pending), limit)?;
        let mut created = Vec::new();
        for gap in gaps {
            match self.synthesize(&gap.id) {
                Ok(proposal) => created.push(proposal),
                Err(e) => warn!("Skipping gap {}: {:#}", gap.id, e),
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectedGap;

    fn pending_gap(db: &Database) -> String {
        let detected = DetectedGap {
            gap_type: "tool".into(),
            domain: Some("pdf".into()),
            confidence: 0.7,
            recommended_scope: "global".into(),
            project_path: None,
            desired_capability: "read pdf files".into(),
            evidence_summary: "[2026-10-01] Read: cannot read pdf".into(),
            detector_rule_id: "tool-errors".into(),
            detector_rule_version: 1,
            observation_ids: vec!["obs-1".into()],
        };
        GapRepository::new(db).save(&detected).unwrap().gap_id
    }

    #[test]
    fn test_synthesize_moves_gap_to_proposed() {
        let db = Database::open_in_memory().unwrap();
        let gap_id = pending_gap(&db);

        let mut generator = MockProposalGenerator::new();
        generator.expect_generate().times(1).returning(|gap| {
            Ok(GeneratedArtifacts {
                capability_type: "skill".into(),
                capability_name: "pdf-reader".into(),
                summary: gap.desired_capability.clone(),
                reasoning: "test".into(),
                files: vec![FileInstruction::create("evolved/skills/pdf-reader/SKILL.md", "# PDF")],
            })
        });

        let proposal = Synthesizer::new(&db, &generator).synthesize(&gap_id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.confidence, 0.7);
        assert_eq!(GapRepository::new(&db).get(&gap_id).unwrap().status, GapStatus::Proposed);
        assert_eq!(
            proposals::ProposalRepository::new(&db).for_gap(&gap_id).unwrap().len(),
            1
        );

        // a proposed gap is not synthesized twice
        assert!(Synthesizer::new(&db, &generator).synthesize(&gap_id).is_err());
    }

    #[test]
    fn test_generator_failure_leaves_gap_pending() {
        let db = Database::open_in_memory().unwrap();
        let gap_id = pending_gap(&db);

        let mut generator = MockProposalGenerator::new();
        generator
            .expect_generate()
            .returning(|_| Err(anyhow::anyhow!("template missing")));

        let created = Synthesizer::new(&db, &generator).synthesize_pending(5).unwrap();
        assert!(created.is_empty());
        assert_eq!(GapRepository::new(&db).get(&gap_id).unwrap().status, GapStatus::Pending);
    }
}
