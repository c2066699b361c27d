//! Static gap taxonomy: default scope, priority and recommended capability types

use crate::types::Priority;

/// Static description of one gap type
#[derive(Debug, Clone, Copy)]
pub struct GapTypeInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub default_scope: &'static str,
    pub priority: Priority,
    pub capability_types: &'static [&'static str],
}

const fn info(
    name: &'static str,
    description: &'static str,
    default_scope: &'static str,
    priority: Priority,
    capability_types: &'static [&'static str],
) -> GapTypeInfo {
    GapTypeInfo { name, description, default_scope, priority, capability_types }
}

pub const GAP_TYPES: &[GapTypeInfo] = &[
    info("tool", "Missing tool or integration capability", "global", Priority::High, &["skill", "mcp_server", "hook"]),
    info("knowledge", "Missing codebase or domain knowledge", "project", Priority::Medium, &["skill"]),
    info("workflow", "Inefficient multi-step process", "global", Priority::Medium, &["command", "skill", "agent"]),
    info("integration", "Two systems don't connect properly", "project", Priority::Medium, &["mcp_server", "skill"]),
    info("context", "Lost context between sessions or tasks", "project", Priority::Medium, &["skill", "hook"]),
    info("permission", "Blocked by approval or permission requirements", "global", Priority::Low, &["hook"]),
    info("quality", "Repeated mistakes or quality issues", "global", Priority::High, &["hook", "skill"]),
    info("speed", "Task takes too long or too many turns", "global", Priority::Medium, &["agent", "skill"]),
    info("communication", "Misunderstandings or unclear communication", "session", Priority::Low, &["skill"]),
    info("recovery", "Can't recover from errors or failures", "global", Priority::High, &["skill", "hook"]),
    info("reasoning", "Struggles with specific problem types", "global", Priority::Medium, &["agent", "skill"]),
    info("verification", "Can't verify if solution works", "project", Priority::Medium, &["skill", "hook"]),
    info("discovery", "Didn't know a capability existed", "global", Priority::Low, &["skill"]),
    info("learning", "Not capturing useful patterns", "global", Priority::Low, &["hook", "skill"]),
    info("evolution", "Evolution system itself needs improvement", "global", Priority::Medium, &["skill"]),
    info("self_awareness", "Unknown unknowns - gaps in self-knowledge", "global", Priority::Low, &["skill", "agent"]),
];

pub fn lookup(gap_type: &str) -> Option<&'static GapTypeInfo> {
    GAP_TYPES.iter().find(|t| t.name == gap_type)
}

/// Scope used when no scope-inference rule matches
pub fn default_scope(gap_type: &str) -> &'static str {
    lookup(gap_type).map(|t| t.default_scope).unwrap_or("global")
}

pub fn priority(gap_type: &str) -> Priority {
    lookup(gap_type).map(|t| t.priority).unwrap_or_default()
}

/// Preferred capability type for addressing a gap (first recommendation)
pub fn primary_capability_type(gap_type: &str) -> &'static str {
    lookup(gap_type)
        .and_then(|t| t.capability_types.first().copied())
        .unwrap_or("skill")
}
