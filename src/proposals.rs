//! Proposal persistence

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::db::Database;
use crate::error::Result;
use crate::gaps::repository::resolve_id;
use crate::types::{format_timestamp, parse_timestamp, FileInstruction, Proposal, ProposalStatus};

const PROPOSAL_COLUMNS: &str = "id, gap_id, capability_type, capability_name, capability_summary, scope, \
     confidence, reasoning, files_json, status, rejection_reason, created_at, reviewed_at";

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    let files_json: String = row.get(8)?;
    let status: String = row.get(9)?;
    let reviewed_at: Option<String> = row.get(12)?;
    Ok(Proposal {
        id: row.get(0)?,
        gap_id: row.get(1)?,
        capability_type: row.get(2)?,
        capability_name: row.get(3)?,
        capability_summary: row.get(4)?,
        scope: row.get(5)?,
        confidence: row.get(6)?,
        reasoning: row.get(7)?,
        files: serde_json::from_str::<Vec<FileInstruction>>(&files_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
        status: ProposalStatus::parse(&status).unwrap_or(ProposalStatus::Pending),
        rejection_reason: row.get(10)?,
        created_at: parse_timestamp(&row.get::<_, String>(11)?),
        reviewed_at: reviewed_at.as_deref().map(parse_timestamp),
    })
}

/// Insert a proposal inside an existing transaction
pub(crate) fn insert(conn: &Connection, proposal: &Proposal) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO proposals ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            PROPOSAL_COLUMNS
        ),
        params![
            proposal.id,
            proposal.gap_id,
            proposal.capability_type,
            proposal.capability_name,
            proposal.capability_summary,
            proposal.scope,
            proposal.confidence,
            proposal.reasoning,
            serde_json::to_string(&proposal.files)?,
            proposal.status.as_str(),
            proposal.rejection_reason,
            format_timestamp(&proposal.created_at),
            proposal.reviewed_at.as_ref().map(format_timestamp),
        ],
    )?;
    Ok(())
}

/// Move a proposal to a reviewed status inside an existing transaction
pub(crate) fn set_status(
    conn: &Connection,
    proposal_id: &str,
    status: ProposalStatus,
    rejection_reason: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE proposals SET status = ?1, rejection_reason = COALESCE(?2, rejection_reason), reviewed_at = ?3
         WHERE id = ?4",
        params![status.as_str(), rejection_reason, format_timestamp(&Utc::now()), proposal_id],
    )?;
    Ok(())
}

pub struct ProposalRepository<'a> {
    db: &'a Database,
}

impl<'a> ProposalRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Fetch by exact id or unique prefix
    pub fn get(&self, id: &str) -> Result<Proposal> {
        let conn = self.db.conn();
        let id = resolve_id(conn, "proposals", "proposal", id)?;
        Ok(conn.query_row(
            &format!("SELECT {} FROM proposals WHERE id = ?1", PROPOSAL_COLUMNS),
            [&id],
            row_to_proposal,
        )?)
    }

    /// Newest first, optionally filtered by status
    pub fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>> {
        let conn = self.db.conn();
        let sql = format!(
            "SELECT {} FROM proposals WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, id",
            PROPOSAL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([status.map(|s| s.as_str())], row_to_proposal)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Proposals generated for one gap
    pub fn for_gap(&self, gap_id: &str) -> Result<Vec<Proposal>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM proposals WHERE gap_id = ?1 ORDER BY created_at, id",
            PROPOSAL_COLUMNS
        ))?;
        let rows = stmt.query_map([gap_id], row_to_proposal)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
