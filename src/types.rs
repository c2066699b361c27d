//! Shared types used across modules
//!
//! This module contains the persisted records of the gap/proposal/capability
//! lifecycle so that detection, synthesis and installation can share them
//! without circular dependencies.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Pending,
    Proposed,
    Resolved,
    Dismissed,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Pending => "pending",
            GapStatus::Proposed => "proposed",
            GapStatus::Resolved => "resolved",
            GapStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GapStatus::Pending),
            "proposed" => Some(GapStatus::Proposed),
            "resolved" => Some(GapStatus::Resolved),
            "dismissed" => Some(GapStatus::Dismissed),
            _ => None,
        }
    }

    /// Resolved and dismissed gaps never take part in deduplication again
    pub fn is_terminal(&self) -> bool {
        matches!(self, GapStatus::Resolved | GapStatus::Dismissed)
    }
}

impl std::fmt::Display for GapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted capability gap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub id: String,
    pub gap_type: String,
    pub domain: Option<String>,
    pub confidence: f64,
    pub recommended_scope: String,
    pub project_path: Option<String>,
    pub desired_capability: String,
    pub evidence_summary: String,
    pub detector_rule_id: String,
    pub detector_rule_version: u32,
    pub status: GapStatus,
    pub observation_ids: Vec<String>,
    pub dismissed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Installed,
    Rejected,
    RolledBack,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Installed => "installed",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProposalStatus::Pending),
            "installed" => Some(ProposalStatus::Installed),
            "rejected" => Some(ProposalStatus::Rejected),
            "rolled_back" => Some(ProposalStatus::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an installation does with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    #[default]
    Create,
    Modify,
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAction::Create => write!(f, "create"),
            FileAction::Modify => write!(f, "modify"),
        }
    }
}

/// One file a proposal wants written, relative to the instance root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInstruction {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub action: FileAction,
}

impl FileInstruction {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            action: FileAction::Create,
        }
    }
}

/// A generated artifact set addressing one gap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub gap_id: String,
    pub capability_type: String,
    pub capability_name: String,
    pub capability_summary: String,
    pub scope: String,
    pub confidence: f64,
    pub reasoning: String,
    pub files: Vec<FileInstruction>,
    pub status: ProposalStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of an installed capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Active,
    RolledBack,
    Deprecated,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Active => "active",
            CapabilityStatus::RolledBack => "rolled_back",
            CapabilityStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CapabilityStatus::Active),
            "rolled_back" => Some(CapabilityStatus::RolledBack),
            "deprecated" => Some(CapabilityStatus::Deprecated),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An installed artifact set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub capability_type: String,
    pub scope: String,
    pub source_proposal_id: Option<String>,
    pub source_gap_id: Option<String>,
    pub installed_files: Vec<String>,
    pub status: CapabilityStatus,
    pub installed_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// Strength of a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Required,
    Optional,
    Suggested,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Required => "required",
            DependencyType::Optional => "optional",
            DependencyType::Suggested => "suggested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "required" => Some(DependencyType::Required),
            "optional" => Some(DependencyType::Optional),
            "suggested" => Some(DependencyType::Suggested),
            _ => None,
        }
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority level of a detector rule or gap type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Generate a unique record ID with a prefix, e.g. `gap-3f9a1c0b7d2e`
pub fn generate_id(prefix: &str) -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &unique[..12])
}

/// Fixed-width UTC timestamp so stored values sort lexically
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp, falling back to now for unreadable values
pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Truncate to at most `max_chars` characters without splitting a code point
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
