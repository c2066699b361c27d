//! Gap detection: rule loading, condition evaluation and the detection pass
//!
//! A pass takes the unprocessed observations, evaluates every enabled rule
//! against them, collapses duplicates within the batch and hands each gap to
//! the repository for cross-run deduplication.

pub mod condition;
pub mod domain;
pub mod engine;
pub mod gap_types;
pub mod rules;

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::gaps::{dedup_batch, GapRepository};
use crate::observations::Observation;
use crate::types::format_timestamp;
use crate::usage::UsageTracker;

pub use condition::Condition;
pub use engine::{DetectedGap, RuleEngine};
pub use rules::{DetectorRule, RuleSet};

/// Summary of one detection pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
    pub observations_considered: usize,
    pub gaps_detected: usize,
    pub new_gap_ids: Vec<String>,
    pub merged: usize,
    pub usage_recorded: usize,
}

/// Run one detection pass over `observations`.
///
/// Observations already marked processed (in the record or the store) are
/// skipped, so re-running over the same log is idempotent per observation id.
/// At most `limit` observations are considered.
pub fn run_detection(
    db: &Database,
    rules: &RuleSet,
    observations: &[Observation],
    limit: usize,
) -> Result<DetectionReport> {
    let mut batch = Vec::new();
    for obs in observations {
        if batch.len() >= limit {
            break;
        }
        if obs.processed || obs.id.is_empty() || db.is_processed(&obs.id)? {
            continue;
        }
        batch.push(obs.clone());
    }

    let mut report = DetectionReport {
        observations_considered: batch.len(),
        ..Default::default()
    };
    if batch.is_empty() {
        return Ok(report);
    }
    if rules.is_empty() {
        warn!("No detector rules loaded; leaving {} observations unprocessed", batch.len());
        return Ok(report);
    }

    let gaps = dedup_batch(RuleEngine::new(rules).evaluate(&batch));
    report.gaps_detected = gaps.len();

    let repo = GapRepository::new(db);
    for gap in &gaps {
        let outcome = repo.save(gap)?;
        if outcome.is_new {
            report.new_gap_ids.push(outcome.gap_id);
        } else {
            report.merged += 1;
        }
    }

    let tracker = UsageTracker::new(db);
    for obs in &batch {
        report.usage_recorded += tracker.detect_usage(obs)?.len();
    }

    let now = format_timestamp(&Utc::now());
    db.immediate(|tx| {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO processed_observations (observation_id, processed_at) VALUES (?1, ?2)",
        )?;
        for obs in &batch {
            stmt.execute(params![obs.id, now])?;
        }
        Ok(())
    })?;

    info!(
        "Detection pass over {} observations: {} gaps ({} new, {} merged)",
        report.observations_considered,
        report.gaps_detected,
        report.new_gap_ids.len(),
        report.merged
    );
    Ok(report)
}
