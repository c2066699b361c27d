//! Detector rule definitions and the compiled, immutable rule set

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::condition::Condition;
use super::engine::Extractor;
use crate::types::Priority;

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_boost() -> f64 {
    0.2
}

/// How the desired-capability text is extracted from matched observations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractSpec {
    /// `regex:<pattern>`, `field:<path>`, or a literal template
    #[serde(default)]
    pub desired_capability: Option<String>,
}

/// One trigger of a detector rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub condition: String,
    #[serde(default = "default_boost")]
    pub confidence_boost: f64,
    #[serde(default)]
    pub extract: ExtractSpec,
}

/// `{if, then}` scope-inference entry; `if: default` always matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRule {
    #[serde(rename = "if", default)]
    pub condition: String,
    #[serde(rename = "then", default)]
    pub scope: String,
}

/// A versioned detector rule as written in a YAML rule file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorRule {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub gap_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub scope_inference: Vec<ScopeRule>,
}

impl DetectorRule {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let rule: DetectorRule = serde_yaml::from_str(text).context("Invalid detector rule")?;
        if rule.id.trim().is_empty() {
            anyhow::bail!("Detector rule has no id");
        }
        Ok(rule)
    }
}

/// A trigger with its condition compiled
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    pub trigger: Trigger,
    pub condition: Condition,
    pub extractor: Extractor,
}

/// A rule ready for evaluation
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: DetectorRule,
    pub triggers: Vec<CompiledTrigger>,
}

impl CompiledRule {
    pub fn compile(rule: DetectorRule) -> Self {
        let triggers = rule
            .triggers
            .iter()
            .map(|t| CompiledTrigger {
                trigger: t.clone(),
                condition: Condition::parse(&t.condition),
                extractor: Extractor::compile(&t.extract),
            })
            .collect();
        Self { rule, triggers }
    }
}

/// Immutable set of enabled rules, ordered by id, constructed once per run
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Build from already-parsed rules; disabled rules are dropped
    pub fn new(rules: impl IntoIterator<Item = DetectorRule>) -> Self {
        let mut rules: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|r| r.enabled)
            .map(CompiledRule::compile)
            .collect();
        rules.sort_by(|a, b| a.rule.id.cmp(&b.rule.id));
        rules.dedup_by(|a, b| a.rule.id == b.rule.id);
        Self { rules }
    }

    /// Load every `*.yaml` / `*.yml` rule under `dir`.
    /// A file that fails to read or parse is logged and skipped.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            debug!("Rules directory {} does not exist", dir.display());
            return Ok(Self::default());
        }

        let mut rules = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !entry.file_type().is_file() || !is_yaml {
                continue;
            }

            let loaded = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))
                .and_then(|text| DetectorRule::from_yaml(&text));
            match loaded {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping detector rule {}: {:#}", path.display(), e),
            }
        }

        let set = Self::new(rules);
        info!("Loaded {} detector rules from {}", set.len(), dir.display());
        Ok(set)
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
