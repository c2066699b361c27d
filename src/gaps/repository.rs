//! Gap persistence with two-tier deduplication and time decay

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use super::fingerprint::{fingerprint, similarity};
use crate::db::Database;
use crate::detection::DetectedGap;
use crate::error::{EvolveError, Result};
use crate::types::{format_timestamp, generate_id, parse_timestamp, truncate_chars, Gap, GapStatus};

pub const MAX_EVIDENCE_CHARS: usize = 500;
pub const SIMILARITY_THRESHOLD: f64 = 0.5;
pub const DOMAIN_MATCH_BOOST: f64 = 0.15;

pub const DECAY_FACTOR: f64 = 0.95;
pub const DECAY_FLOOR: f64 = 0.1;
pub const DECAY_AFTER_HOURS: i64 = 24;

const GAP_COLUMNS: &str = "id, gap_type, domain, confidence, recommended_scope, project_path, \
     desired_capability, evidence_summary, detector_rule_id, detector_rule_version, status, \
     dismissed_reason, created_at, updated_at";

/// Result of [`GapRepository::save`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    pub gap_id: String,
    pub is_new: bool,
}

/// Existing gap chosen as the merge target for a new detection
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarGap {
    pub gap_id: String,
    pub similarity: f64,
}

fn row_to_gap(row: &Row<'_>) -> rusqlite::Result<Gap> {
    let status: String = row.get(10)?;
    let version: i64 = row.get(9)?;
    Ok(Gap {
        id: row.get(0)?,
        gap_type: row.get(1)?,
        domain: row.get(2)?,
        confidence: row.get(3)?,
        recommended_scope: row.get(4)?,
        project_path: row.get(5)?,
        desired_capability: row.get(6)?,
        evidence_summary: row.get(7)?,
        detector_rule_id: row.get(8)?,
        detector_rule_version: version.max(0) as u32,
        status: GapStatus::parse(&status).unwrap_or(GapStatus::Pending),
        observation_ids: Vec::new(),
        dismissed_reason: row.get(11)?,
        created_at: parse_timestamp(&row.get::<_, String>(12)?),
        updated_at: parse_timestamp(&row.get::<_, String>(13)?),
    })
}

fn link_observations(conn: &Connection, gap_id: &str, observation_ids: &[String]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO gap_observations (gap_id, observation_id) VALUES (?1, ?2)",
    )?;
    for obs_id in observation_ids.iter().filter(|id| !id.is_empty()) {
        stmt.execute(params![gap_id, obs_id])?;
    }
    Ok(())
}

/// Combined evidence after a merge, capped at 500 characters
fn merge_evidence(old: &str, new: &str) -> String {
    let combined = match (old.is_empty(), new.is_empty()) {
        (false, false) => format!("{}; {}", old, new),
        (true, _) => new.to_string(),
        (false, true) => old.to_string(),
    };
    truncate_chars(&combined, MAX_EVIDENCE_CHARS)
}

/// Find the best non-terminal gap of the same type to merge `gap` into.
/// An exact fingerprint match wins outright; otherwise the most similar
/// candidate at or above the threshold, with a boost for matching domains.
pub fn find_similar(conn: &Connection, gap: &DetectedGap) -> Result<Option<SimilarGap>> {
    let new_fingerprint = fingerprint(&gap.gap_type, &gap.desired_capability);

    let mut stmt = conn.prepare_cached(
        "SELECT id, desired_capability, domain, fingerprint FROM gaps
         WHERE gap_type = ?1 AND status NOT IN ('resolved', 'dismissed')
         ORDER BY created_at, id",
    )?;
    let candidates = stmt
        .query_map([&gap.gap_type], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut best: Option<SimilarGap> = None;
    for (id, text, domain, existing_fingerprint) in candidates {
        if existing_fingerprint == new_fingerprint {
            return Ok(Some(SimilarGap { gap_id: id, similarity: 1.0 }));
        }

        let mut sim = similarity(&gap.desired_capability, &text);
        if let (Some(a), Some(b)) = (gap.domain.as_deref(), domain.as_deref()) {
            if a == b {
                sim = (sim + DOMAIN_MATCH_BOOST).min(1.0);
            }
        }

        let better = best.as_ref().map(|b| sim > b.similarity).unwrap_or(true);
        if sim >= SIMILARITY_THRESHOLD && better {
            best = Some(SimilarGap { gap_id: id, similarity: sim });
        }
    }

    Ok(best)
}

/// Update a gap's status inside an existing transaction
/// Insert a new gap row with its observation links; returns the generated id
pub(crate) fn insert(conn: &Connection, gap: &DetectedGap, status: GapStatus, now: &str) -> Result<String> {
    let id = generate_id("gap");
    conn.execute(
        "INSERT INTO gaps (id, gap_type, domain, confidence, recommended_scope, project_path,
            desired_capability, evidence_summary, detector_rule_id, detector_rule_version,
            fingerprint, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            id,
            gap.gap_type,
            gap.domain,
            gap.confidence.clamp(0.0, 1.0),
            gap.recommended_scope,
            gap.project_path,
            gap.desired_capability,
            truncate_chars(&gap.evidence_summary, MAX_EVIDENCE_CHARS),
            gap.detector_rule_id,
            gap.detector_rule_version,
            fingerprint(&gap.gap_type, &gap.desired_capability),
            status.as_str(),
            now,
        ],
    )?;
    link_observations(conn, &id, &gap.observation_ids)?;
    Ok(id)
}

pub(crate) fn set_status(conn: &Connection, gap_id: &str, status: GapStatus, now: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE gaps SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), format_timestamp(now), gap_id],
    )?;
    Ok(())
}

/// Resolve an exact id or unique id prefix against `table`
pub(crate) fn resolve_id(conn: &Connection, table: &'static str, entity: &'static str, id: &str) -> Result<String> {
    let exact: Option<String> = conn
        .query_row(&format!("SELECT id FROM {} WHERE id = ?1", table), [id], |row| row.get(0))
        .optional()?;
    if let Some(found) = exact {
        return Ok(found);
    }

    let pattern = format!("{}%", id.replace('%', "").replace('_', "\\_"));
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE id LIKE ?1 ESCAPE '\\' ORDER BY id LIMIT 2",
        table
    ))?;
    let matches = stmt
        .query_map([pattern], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    match matches.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(EvolveError::not_found(entity, id)),
        _ => Err(EvolveError::InvalidState(format!("ambiguous {} id prefix: {}", entity, id))),
    }
}

/// Repository for persisted gaps
pub struct GapRepository<'a> {
    db: &'a Database,
}

impl<'a> GapRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Persist a detected gap, merging into a matching non-terminal gap if one exists
    pub fn save(&self, gap: &DetectedGap) -> Result<SaveOutcome> {
        let now = format_timestamp(&Utc::now());

        self.db.immediate(|tx| {
            if let Some(similar) = find_similar(tx, gap)? {
                let (old_confidence, old_evidence): (f64, String) = tx.query_row(
                    "SELECT confidence, evidence_summary FROM gaps WHERE id = ?1",
                    [&similar.gap_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;

                tx.execute(
                    "UPDATE gaps SET confidence = ?1, evidence_summary = ?2, updated_at = ?3 WHERE id = ?4",
                    params![
                        old_confidence.max(gap.confidence),
                        merge_evidence(&old_evidence, &gap.evidence_summary),
                        now,
                        similar.gap_id
                    ],
                )?;
                link_observations(tx, &similar.gap_id, &gap.observation_ids)?;

                debug!(
                    "Merged {} gap into {} (similarity {:.2})",
                    gap.gap_type, similar.gap_id, similar.similarity
                );
                return Ok(SaveOutcome { gap_id: similar.gap_id, is_new: false });
            }

            let id = insert(tx, gap, GapStatus::Pending, &now)?;
            info!("New {} gap {}: {}", gap.gap_type, id, gap.desired_capability);
            Ok(SaveOutcome { gap_id: id, is_new: true })
        })
    }

    /// Fetch by exact id or unique prefix
    pub fn get(&self, id: &str) -> Result<Gap> {
        let conn = self.db.conn();
        let id = resolve_id(conn, "gaps", "gap", id)?;
        let mut gap = conn.query_row(
            &format!("SELECT {} FROM gaps WHERE id = ?1", GAP_COLUMNS),
            [&id],
            row_to_gap,
        )?;
        gap.observation_ids = self.observation_ids(&gap.id)?;
        Ok(gap)
    }

    pub fn observation_ids(&self, gap_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.db.conn().prepare_cached(
            "SELECT observation_id FROM gap_observations WHERE gap_id = ?1 ORDER BY observation_id",
        )?;
        let ids = stmt
            .query_map([gap_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Gaps ordered by confidence, optionally filtered by status
    pub fn list(&self, status: Option<GapStatus>, limit: usize) -> Result<Vec<Gap>> {
        let conn = self.db.conn();
        let limit = limit.min(i64::MAX as usize) as i64;
        let mut gaps = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM gaps WHERE status = ?1 ORDER BY confidence DESC, updated_at DESC LIMIT ?2",
                    GAP_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit], row_to_gap)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM gaps ORDER BY confidence DESC, updated_at DESC LIMIT ?1",
                    GAP_COLUMNS
                ))?;
                let rows = stmt.query_map([limit], row_to_gap)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        for gap in &mut gaps {
            gap.observation_ids = self.observation_ids(&gap.id)?;
        }
        Ok(gaps)
    }

    /// Mark a pending or proposed gap as dismissed (terminal)
    pub fn dismiss(&self, id: &str, reason: &str) -> Result<Gap> {
        let gap = self.get(id)?;
        if !matches!(gap.status, GapStatus::Pending | GapStatus::Proposed) {
            return Err(EvolveError::InvalidState(format!(
                "gap {} is {} and cannot be dismissed",
                gap.id, gap.status
            )));
        }

        self.db.conn().execute(
            "UPDATE gaps SET status = 'dismissed', dismissed_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, format_timestamp(&Utc::now()), gap.id],
        )?;
        info!("Dismissed gap {}: {}", gap.id, reason);
        self.get(&gap.id)
    }

    /// Decay every pending gap untouched for 24h; returns the number of rows touched.
    /// Confidence never rises and never drops below the floor through decay.
    pub fn decay(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_timestamp(&(now - Duration::hours(DECAY_AFTER_HOURS)));
        let updated = self.db.immediate(|tx| {
            Ok(tx.execute(
                "UPDATE gaps
                 SET confidence = CASE WHEN confidence > ?1 THEN MAX(?1, confidence * ?2) ELSE confidence END,
                     updated_at = ?3
                 WHERE status = 'pending' AND updated_at <= ?4",
                params![DECAY_FLOOR, DECAY_FACTOR, format_timestamp(&now), cutoff],
            )?)
        })?;

        if updated > 0 {
            info!("Decayed confidence of {} stale gaps", updated);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected(text: &str, confidence: f64, domain: Option<&str>, obs: &[&str]) -> DetectedGap {
        DetectedGap {
            gap_type: "tool".into(),
            domain: domain.map(String::from),
            confidence,
            recommended_scope: "global".into(),
            project_path: None,
            desired_capability: text.into(),
            evidence_summary: format!("[2026-10-01] Read: {}", text),
            detector_rule_id: "rule".into(),
            detector_rule_version: 1,
            observation_ids: obs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_exact_fingerprint_merges() {
        let db = Database::open_in_memory().unwrap();
        let repo = GapRepository::new(&db);

        let first = repo.save(&detected("Cannot read PDF files", 0.5, Some("pdf"), &["o1"])).unwrap();
        let second = repo.save(&detected("cannot read pdf files!", 0.7, None, &["o1", "o2"])).unwrap();
        let third = repo.save(&detected("Cannot read PDF files", 0.4, None, &["o3"])).unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(second.gap_id, first.gap_id);
        assert_eq!(third.gap_id, first.gap_id);

        let gaps = repo.list(None, 10).unwrap();
        assert_eq!(gaps.len(), 1);
        assert!((gaps[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(gaps[0].observation_ids, vec!["o1", "o2", "o3"]);
        assert!(gaps[0].evidence_summary.chars().count() <= MAX_EVIDENCE_CHARS);
    }

    #[test]
    fn test_fuzzy_match_with_domain_boost() {
        let db = Database::open_in_memory().unwrap();
        let repo = GapRepository::new(&db);
        let base = repo.save(&detected("extract tables from pdf reports", 0.5, Some("pdf"), &[])).unwrap();

        // 2 shared of 9 words: 0.22, not enough even with the boost
        let unrelated = repo.save(&detected("render charts into pdf reports quickly", 0.5, Some("pdf"), &[])).unwrap();
        assert!(unrelated.is_new);

        // 4 shared of 6 words: 0.67
        let similar = repo.save(&detected("extract tables from pdf invoices", 0.6, None, &[])).unwrap();
        assert_eq!(similar.gap_id, base.gap_id);

        // 3 shared of 7 words: 0.43 + 0.15 with matching domains
        let boosted = repo.save(&detected("extract charts from pdf slides", 0.6, Some("pdf"), &[])).unwrap();
        assert_eq!(boosted.gap_id, base.gap_id);
    }

    #[test]
    fn test_terminal_gaps_are_not_merge_targets() {
        let db = Database::open_in_memory().unwrap();
        let repo = GapRepository::new(&db);
        let first = repo.save(&detected("Cannot read PDF files", 0.5, None, &[])).unwrap();
        repo.dismiss(&first.gap_id, "not needed").unwrap();

        let again = repo.save(&detected("Cannot read PDF files", 0.5, None, &[])).unwrap();
        assert!(again.is_new);
        assert!(repo.dismiss(&first.gap_id, "twice").is_err());
    }

    #[test]
    fn test_merge_evidence_is_bounded() {
        let long = "x".repeat(400);
        assert_eq!(merge_evidence(&long, &long).chars().count(), MAX_EVIDENCE_CHARS);
        assert_eq!(merge_evidence("", "new"), "new");
        assert_eq!(merge_evidence("old", ""), "old");
    }

    #[test]
    fn test_prefix_lookup() {
        let db = Database::open_in_memory().unwrap();
        let repo = GapRepository::new(&db);
        let saved = repo.save(&detected("Cannot read PDF files", 0.5, None, &[])).unwrap();
        let gap = repo.get(&saved.gap_id[..8]).unwrap();
        assert_eq!(gap.id, saved.gap_id);
        assert!(matches!(repo.get("gap-zzzz"), Err(EvolveError::NotFound { .. })));
    }
}
