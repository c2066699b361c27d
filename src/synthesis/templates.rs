//! Built-in markdown templates for generated capabilities
//!
//! Each artefact is a markdown document with YAML frontmatter, written into
//! the installation directory for its capability type.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::{GeneratedArtifacts, ProposalGenerator};
use crate::detection::gap_types;
use crate::types::{format_timestamp, truncate_chars, FileInstruction, Gap};

/// Capability types the built-in templates can render
pub const SUPPORTED_TYPES: &[&str] = &["skill", "hook", "agent", "command"];

const NAME_PREFIXES: &[&str] = &["cannot ", "can't ", "unable to ", "don't have ", "no way to "];
const NAME_STOP_WORDS: &[&str] = &["the", "and", "for", "with"];
const MAX_SLUG_CHARS: usize = 50;

static SLUG_INVALID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9-]").expect("valid regex"));
static SLUG_DASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("valid regex"));

/// Short dashed name derived from the desired capability text
pub fn capability_name(desired: &str, domain: Option<&str>) -> String {
    let mut text = desired.to_lowercase();
    if let Some(prefix) = NAME_PREFIXES.iter().find(|p| text.starts_with(*p)) {
        text = text[prefix.len()..].to_string();
    }

    let mut words: Vec<String> = text
        .split_whitespace()
        .take(4)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.chars().count() > 2 && !NAME_STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect();

    if let Some(domain) = domain.filter(|d| !d.is_empty()) {
        if !words.join(" ").contains(domain) {
            words.insert(0, domain.to_string());
        }
    }

    if words.is_empty() {
        return "capability".to_string();
    }
    words.truncate(3);
    words.join("-")
}

/// Lowercase, dash-separated, at most 50 characters
pub fn slugify(name: &str) -> String {
    let slug = name.to_lowercase().replace(' ', "-");
    let slug = SLUG_INVALID.replace_all(&slug, "");
    let slug = SLUG_DASHES.replace_all(&slug, "-");
    let slug: String = slug.trim_matches('-').chars().take(MAX_SLUG_CHARS).collect();
    if slug.is_empty() {
        "capability".to_string()
    } else {
        slug
    }
}

/// One-line summary capped at 80 characters
pub fn summary(desired: &str) -> String {
    if desired.chars().count() > 80 {
        format!("{}...", truncate_chars(desired, 77))
    } else {
        desired.to_string()
    }
}

fn title_case(name: &str) -> String {
    name.split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pick the first recommended type for the gap that a template exists for
pub fn capability_type_for(gap_type: &str) -> &'static str {
    gap_types::lookup(gap_type)
        .and_then(|info| {
            info.capability_types
                .iter()
                .copied()
                .find(|t| SUPPORTED_TYPES.contains(t))
        })
        .unwrap_or("skill")
}

/// Install location for an artefact, relative to the instance root
pub fn output_path(capability_type: &str, slug: &str) -> String {
    match capability_type {
        "hook" => format!("evolved/hooks/{}.md", slug),
        "agent" => format!("evolved/agents/{}.md", slug),
        "command" => format!("evolved/commands/{}.md", slug),
        _ => format!("evolved/skills/{}/SKILL.md", slug),
    }
}

#[derive(Debug, Serialize)]
struct EvolvedFrom<'a> {
    gap_id: &'a str,
    gap_type: &'a str,
    created: String,
}

#[derive(Debug, Serialize)]
struct Frontmatter<'a> {
    name: &'a str,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hook_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matcher: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<bool>,
    evolved_from: EvolvedFrom<'a>,
}

/// Renders gap-specific markdown without any external service
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator {
    created_at: Option<DateTime<Utc>>,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the generation timestamp, for reproducible output
    pub fn at(created_at: DateTime<Utc>) -> Self {
        Self { created_at: Some(created_at) }
    }

    fn render(&self, capability_type: &str, gap: &Gap, name: &str, slug: &str) -> Result<String> {
        let created = format_timestamp(&self.created_at.unwrap_or_else(Utc::now));
        let desired = gap.desired_capability.as_str();
        let domain = gap.domain.as_deref().unwrap_or("general");
        let title = title_case(name);

        let mut frontmatter = Frontmatter {
            name: slug,
            description: truncate_chars(desired, 100),
            hook_type: None,
            matcher: None,
            model: None,
            tools: Vec::new(),
            command: None,
            evolved_from: EvolvedFrom {
                gap_id: &gap.id,
                gap_type: &gap.gap_type,
                created: created.clone(),
            },
        };

        let body = match capability_type {
            "hook" => {
                frontmatter.hook_type = Some("PostToolUse");
                frontmatter.matcher = Some("*");
                format!(
                    "# Hook: {title}\n\n## Purpose\n{desired}\n\n## Configuration\n\
                     Register under `hooks.PostToolUse` with matcher `*` and a command that\n\
                     handles the event for `{slug}`.\n\n## Implementation Notes\n\
                     Triggered after every tool call; keep the handler fast and side-effect free.\n"
                )
            }
            "agent" => {
                frontmatter.model = Some("haiku");
                frontmatter.tools = vec!["Read", "Grep", "Glob", "Bash"];
                format!(
                    "# {title} Agent\n\n## Purpose\n{desired}\n\n## When to Dispatch\n\
                     - Working in the {domain} domain\n- The main task matches: {short}\n\n\
                     ## Agent Instructions\nYou are a specialized agent for {domain} tasks.\n\n\
                     Your goal: {desired}\n\nSteps:\n1. Analyze the current situation\n\
                     2. Gather necessary context\n3. Execute the required actions\n4. Report results\n\n\
                     ## Expected Outputs\n- Summary of actions taken\n- Any errors encountered\n\
                     - Recommendations for follow-up\n",
                    short = truncate_chars(desired, 50)
                )
            }
            "command" => {
                frontmatter.command = Some(true);
                format!(
                    "# /{slug} Command\n\n## Usage\n```\n/{slug} [options]\n```\n\n\
                     ## Description\n{desired}\n\n## Steps\nWhen invoked:\n\
                     1. Parse any provided arguments\n2. Execute the required actions\n\
                     3. Report results to the user\n"
                )
            }
            _ => format!(
                "# {title}\n\n## When to Use\nUse this skill when you need to {lower}.\n\n\
                 Domain: {domain}\n\n## What This Skill Does\n\
                 Addresses a detected capability gap:\n- Gap: {desired}\n- Evidence: {evidence}\n\n\
                 ## Instructions\n1. Identify when this capability is needed\n\
                 2. Apply the appropriate solution\n3. Verify the result\n",
                lower = desired.to_lowercase(),
                evidence = gap.evidence_summary
            ),
        };

        let yaml = serde_yaml::to_string(&frontmatter).context("Failed to render frontmatter")?;
        Ok(format!(
            "---\n{}---\n\n{}\n---\n*Generated by capsmith on {}*\n",
            yaml, body, created
        ))
    }
}

impl ProposalGenerator for TemplateGenerator {
    fn generate(&self, gap: &Gap) -> Result<GeneratedArtifacts> {
        let capability_type = capability_type_for(&gap.gap_type);
        let name = capability_name(&gap.desired_capability, gap.domain.as_deref());
        let slug = slugify(&name);
        let content = self.render(capability_type, gap, &name, &slug)?;

        Ok(GeneratedArtifacts {
            capability_type: capability_type.to_string(),
            capability_name: name,
            summary: summary(&gap.desired_capability),
            reasoning: format!("Generated to address: {}", gap.desired_capability),
            files: vec![FileInstruction::create(output_path(capability_type, &slug), content)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GapStatus;
    use chrono::TimeZone;

    fn gap(gap_type: &str, desired: &str, domain: Option<&str>) -> Gap {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        Gap {
            id: "gap-0123456789ab".into(),
            gap_type: gap_type.into(),
            domain: domain.map(str::to_string),
            confidence: 0.7,
            recommended_scope: "global".into(),
            project_path: None,
            desired_capability: desired.into(),
            evidence_summary: "[2026-10-01] Read: cannot parse pdf".into(),
            detector_rule_id: "tool-errors".into(),
            detector_rule_version: 1,
            status: GapStatus::Pending,
            observation_ids: vec![],
            dismissed_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_capability_name() {
        assert_eq!(capability_name("Unable to read the PDF files", Some("pdf")), "read-pdf-files");
        assert_eq!(capability_name("Approve pushes: now", None), "approve-pushes-now");
        assert_eq!(capability_name("Cannot parse yaml configs quickly", Some("file")), "file-parse-yaml");
        assert_eq!(capability_name("a b", None), "capability");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Skill: v2!"), "my-skill-v2");
        assert_eq!(slugify("--a---b--"), "a-b");
        assert_eq!(slugify(&"x".repeat(80)).len(), 50);
        assert_eq!(slugify("!!!"), "capability");
    }

    #[test]
    fn test_summary_truncates() {
        let long = "y".repeat(100);
        let s = summary(&long);
        assert_eq!(s.chars().count(), 80);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn test_type_selection_falls_back_to_supported() {
        assert_eq!(capability_type_for("tool"), "skill");
        assert_eq!(capability_type_for("permission"), "hook");
        assert_eq!(capability_type_for("no-such-type"), "skill");
    }

    #[test]
    fn test_skill_artifact() {
        let generator = TemplateGenerator::at(Utc.with_ymd_and_hms(2026, 10, 2, 0, 0, 0).unwrap());
        let artifacts = generator
            .generate(&gap("tool", "Unable to read the PDF files", Some("pdf")))
            .unwrap();

        assert_eq!(artifacts.capability_type, "skill");
        assert_eq!(artifacts.capability_name, "read-pdf-files");
        assert_eq!(artifacts.files.len(), 1);
        let file = &artifacts.files[0];
        assert_eq!(file.path, "evolved/skills/read-pdf-files/SKILL.md");
        assert!(file.content.starts_with("---\nname: read-pdf-files\n"));
        assert!(file.content.contains("gap_id: gap-0123456789ab"));
        assert!(file.content.contains("# Read Pdf Files"));
        assert!(crate::lifecycle::paths::is_allowed(&file.path));
    }

    #[test]
    fn test_hook_frontmatter() {
        let artifacts = TemplateGenerator::new()
            .generate(&gap("permission", "Approve git pushes: automatically", None))
            .unwrap();
        let content = &artifacts.files[0].content;
        assert_eq!(artifacts.files[0].path, "evolved/hooks/approve-git-pushes.md");
        assert!(content.contains("hook_type: PostToolUse"));
        // colon in the description must stay valid yaml
        let yaml = content.split("---\n").nth(1).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed["description"].as_str(), Some("Approve git pushes: automatically"));
    }
}
