//! Capability usage tracking
//!
//! Usage is recorded explicitly, or inferred heuristically from observations
//! that mention an active capability's name or skill path.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::debug;

use crate::db::Database;
use crate::dependencies::resolve_capability;
use crate::error::Result;
use crate::observations::Observation;
use crate::types::format_timestamp;

/// Aggregated usage for one capability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub capability_id: String,
    pub name: String,
    pub capability_type: String,
    pub usage_count: u64,
    pub first_used: Option<String>,
    pub last_used: Option<String>,
}

pub struct UsageTracker<'a> {
    db: &'a Database,
}

impl<'a> UsageTracker<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Record one use of a capability; returns the capability id
    pub fn record_usage(&self, capability: &str, session_id: Option<&str>, context: Option<&str>) -> Result<String> {
        let capability_id = resolve_capability(self.db.conn(), capability)?;
        self.db.conn().execute(
            "INSERT INTO capability_usage (capability_id, session_id, context, used_at) VALUES (?1, ?2, ?3, ?4)",
            params![capability_id, session_id, context, format_timestamp(&Utc::now())],
        )?;
        Ok(capability_id)
    }

    /// Record usage for every active capability the observation refers to.
    /// Idempotent per observation; returns the capability names recorded.
    pub fn detect_usage(&self, observation: &Observation) -> Result<Vec<String>> {
        let raw = observation.raw_json.to_lowercase();
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .db
            .conn()
            .prepare_cached("SELECT id, name, capability_type FROM capabilities WHERE status = 'active' ORDER BY name")?;
        let capabilities = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut recorded = Vec::new();
        for (id, name, capability_type) in capabilities {
            let lower = name.to_lowercase();
            let context = if raw.contains(&lower) {
                format!("Detected in {}", observation.tool_name.as_deref().unwrap_or("observation"))
            } else if capability_type == "skill" && raw.contains(&format!("evolved/skills/{}", lower)) {
                "Skill referenced".to_string()
            } else {
                continue;
            };

            let inserted = self.db.conn().execute(
                "INSERT OR IGNORE INTO capability_usage (capability_id, session_id, observation_id, context, used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    observation.session_id,
                    observation.id,
                    context,
                    format_timestamp(&Utc::now())
                ],
            )?;
            if inserted > 0 {
                debug!("Recorded usage of {} from observation {}", name, observation.id);
                recorded.push(name);
            }
        }

        Ok(recorded)
    }

    /// Usage per capability, most used first. Without a filter only active
    /// capabilities are listed.
    pub fn usage_stats(&self, capability: Option<&str>) -> Result<Vec<UsageStats>> {
        let conn = self.db.conn();
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<UsageStats> {
            let count: i64 = row.get(3)?;
            Ok(UsageStats {
                capability_id: row.get(0)?,
                name: row.get(1)?,
                capability_type: row.get(2)?,
                usage_count: count.max(0) as u64,
                first_used: row.get(4)?,
                last_used: row.get(5)?,
            })
        };

        let stats = match capability {
            Some(key) => {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.name, c.capability_type, COUNT(u.id), MIN(u.used_at), MAX(u.used_at)
                     FROM capabilities c LEFT JOIN capability_usage u ON c.id = u.capability_id
                     WHERE c.name = ?1 OR c.id LIKE ?2
                     GROUP BY c.id ORDER BY COUNT(u.id) DESC, c.name",
                )?;
                let rows = stmt.query_map(params![key, format!("{}%", key)], map)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.name, c.capability_type, COUNT(u.id), MIN(u.used_at), MAX(u.used_at)
                     FROM capabilities c LEFT JOIN capability_usage u ON c.id = u.capability_id
                     WHERE c.status = 'active'
                     GROUP BY c.id ORDER BY COUNT(u.id) DESC, c.name",
                )?;
                let rows = stmt.query_map([], map)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(stats)
    }
}
