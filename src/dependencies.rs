//! Directed dependency edges between installed capabilities
//!
//! The graph is consulted only when rolling back: a capability that an active
//! capability *requires* cannot be removed. Required edges may not form a
//! cycle, since neither end of such a cycle could ever be rolled back.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{EvolveError, Result};
use crate::gaps::repository::resolve_id;
use crate::types::{format_timestamp, DependencyType};

/// One edge joined with the names of both ends
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyEdge {
    pub capability_id: String,
    pub capability_name: String,
    pub depends_on_id: String,
    pub depends_on_name: String,
    pub dependency_type: DependencyType,
    pub notes: Option<String>,
}

/// Active dependents of a capability, split by strength
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackCheck {
    pub required: Vec<DependencyEdge>,
    pub optional: Vec<DependencyEdge>,
}

impl RollbackCheck {
    pub fn is_blocked(&self) -> bool {
        !self.required.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.required.iter().chain(self.optional.iter())
    }
}

/// Resolve a capability by exact name (active first), then exact id or a
/// unique id prefix. A prefix shared by several ids is an error.
pub(crate) fn resolve_capability(conn: &Connection, key: &str) -> Result<String> {
    let by_name: Option<String> = conn
        .query_row(
            "SELECT id FROM capabilities WHERE name = ?1
             ORDER BY (status = 'active') DESC, installed_at DESC LIMIT 1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    match by_name {
        Some(id) => Ok(id),
        None => resolve_id(conn, "capabilities", "capability", key),
    }
}

const EDGE_SELECT: &str = "SELECT d.capability_id, c.name, d.depends_on_id, t.name, d.dependency_type, d.notes
     FROM capability_dependencies d
     JOIN capabilities c ON c.id = d.capability_id
     JOIN capabilities t ON t.id = d.depends_on_id";

fn query_edges(conn: &Connection, sql: &str, id: &str) -> Result<Vec<DependencyEdge>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let edges = stmt
        .query_map([id], |row| {
            let kind: String = row.get(4)?;
            Ok(DependencyEdge {
                capability_id: row.get(0)?,
                capability_name: row.get(1)?,
                depends_on_id: row.get(2)?,
                depends_on_name: row.get(3)?,
                dependency_type: DependencyType::parse(&kind).unwrap_or(DependencyType::Required),
                notes: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Whether `from` can reach `to` over required edges between active capabilities
fn required_path_exists(conn: &Connection, from: &str, to: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.depends_on_id FROM capability_dependencies d
         JOIN capabilities t ON t.id = d.depends_on_id
         WHERE d.capability_id = ?1 AND d.dependency_type = 'required' AND t.status = 'active'",
    )?;

    let mut stack = vec![from.to_string()];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return Ok(true);
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        let next = stmt
            .query_map([&node], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        stack.extend(next);
    }
    Ok(false)
}

pub struct DependencyGraph<'a> {
    db: &'a Database,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Add or update the edge `capability -> depends_on`
    pub fn add(
        &self,
        capability: &str,
        depends_on: &str,
        dependency_type: DependencyType,
        notes: Option<&str>,
    ) -> Result<DependencyEdge> {
        let (from, to) = self.db.immediate(|tx| {
            let from = resolve_capability(tx, capability)?;
            let to = resolve_capability(tx, depends_on)?;
            if from == to {
                return Err(EvolveError::CyclicDependency(format!("{} cannot depend on itself", capability)));
            }
            if dependency_type == DependencyType::Required && required_path_exists(tx, &to, &from)? {
                return Err(EvolveError::CyclicDependency(format!(
                    "{} already requires {}",
                    depends_on, capability
                )));
            }

            tx.execute(
                "INSERT INTO capability_dependencies (capability_id, depends_on_id, dependency_type, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(capability_id, depends_on_id)
                 DO UPDATE SET dependency_type = excluded.dependency_type, notes = excluded.notes",
                params![from, to, dependency_type.as_str(), notes, format_timestamp(&Utc::now())],
            )?;
            Ok((from, to))
        })?;

        info!("Added {} dependency {} -> {}", dependency_type, from, to);
        let edge = query_edges(
            self.db.conn(),
            &format!("{} WHERE d.capability_id = ?1", EDGE_SELECT),
            &from,
        )?
        .into_iter()
        .find(|e| e.depends_on_id == to);
        edge.ok_or_else(|| EvolveError::not_found("dependency", format!("{} -> {}", from, to)))
    }

    /// Remove the edge; returns whether one existed
    pub fn remove(&self, capability: &str, depends_on: &str) -> Result<bool> {
        let conn = self.db.conn();
        let from = resolve_capability(conn, capability)?;
        let to = resolve_capability(conn, depends_on)?;
        let removed = conn.execute(
            "DELETE FROM capability_dependencies WHERE capability_id = ?1 AND depends_on_id = ?2",
            params![from, to],
        )?;
        debug!("Removed dependency {} -> {} ({} rows)", from, to, removed);
        Ok(removed > 0)
    }

    /// Active capabilities this capability depends on
    pub fn dependencies(&self, capability: &str) -> Result<Vec<DependencyEdge>> {
        let conn = self.db.conn();
        let id = resolve_capability(conn, capability)?;
        query_edges(
            conn,
            &format!("{} WHERE d.capability_id = ?1 AND t.status = 'active' ORDER BY t.name", EDGE_SELECT),
            &id,
        )
    }

    /// Active capabilities that depend on this capability
    pub fn dependents(&self, capability: &str) -> Result<Vec<DependencyEdge>> {
        let conn = self.db.conn();
        let id = resolve_capability(conn, capability)?;
        query_edges(
            conn,
            &format!("{} WHERE d.depends_on_id = ?1 AND c.status = 'active' ORDER BY c.name", EDGE_SELECT),
            &id,
        )
    }

    /// Classify active dependents for a rollback decision
    pub fn check_rollback(&self, capability: &str) -> Result<RollbackCheck> {
        let (required, optional) = self
            .dependents(capability)?
            .into_iter()
            .partition(|e| e.dependency_type == DependencyType::Required);
        Ok(RollbackCheck { required, optional })
    }
}
