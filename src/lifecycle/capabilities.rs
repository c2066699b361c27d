//! Installed capability queries

use rusqlite::{Connection, Row};

use crate::db::Database;
use crate::dependencies::resolve_capability;
use crate::error::Result;
use crate::types::{parse_timestamp, Capability, CapabilityStatus};

const CAPABILITY_COLUMNS: &str = "id, name, capability_type, scope, source_proposal_id, source_gap_id, \
     installed_files_json, status, installed_at, rolled_back_at";

fn row_to_capability(row: &Row<'_>) -> rusqlite::Result<Capability> {
    let files_json: String = row.get(6)?;
    let status: String = row.get(7)?;
    let rolled_back_at: Option<String> = row.get(9)?;
    Ok(Capability {
        id: row.get(0)?,
        name: row.get(1)?,
        capability_type: row.get(2)?,
        scope: row.get(3)?,
        source_proposal_id: row.get(4)?,
        source_gap_id: row.get(5)?,
        installed_files: serde_json::from_str(&files_json).unwrap_or_default(),
        status: CapabilityStatus::parse(&status).unwrap_or(CapabilityStatus::Active),
        installed_at: parse_timestamp(&row.get::<_, String>(8)?),
        rolled_back_at: rolled_back_at.as_deref().map(parse_timestamp),
    })
}

pub(crate) fn load(conn: &Connection, id: &str) -> Result<Capability> {
    Ok(conn.query_row(
        &format!("SELECT {} FROM capabilities WHERE id = ?1", CAPABILITY_COLUMNS),
        [id],
        row_to_capability,
    )?)
}

pub struct CapabilityRepository<'a> {
    db: &'a Database,
}

impl<'a> CapabilityRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Look up by name, id or id prefix
    pub fn get(&self, key: &str) -> Result<Capability> {
        let conn = self.db.conn();
        let id = resolve_capability(conn, key)?;
        load(conn, &id)
    }

    /// Most recently installed first
    pub fn list(&self, status: Option<CapabilityStatus>) -> Result<Vec<Capability>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM capabilities WHERE (?1 IS NULL OR status = ?1) ORDER BY installed_at DESC, name",
            CAPABILITY_COLUMNS
        ))?;
        let rows = stmt.query_map([status.map(|s| s.as_str())], row_to_capability)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
