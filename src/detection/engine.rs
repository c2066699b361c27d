//! Rule evaluation over an observation batch

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::domain::infer_domain;
use super::gap_types;
use super::rules::{CompiledRule, ExtractSpec, RuleSet};
use crate::observations::{is_truthy, value_text, Observation, ObservationView};
use crate::types::truncate_chars;

pub const BASE_CONFIDENCE: f64 = 0.3;
pub const MAX_CONFIDENCE: f64 = 0.95;
pub const MAX_CAPABILITY_CHARS: usize = 200;
pub const MAX_EVIDENCE_ITEMS: usize = 5;

const GENERIC_CAPABILITY: &str = "Detected capability gap";

/// A gap as produced by evaluation, before it has an id or timestamps
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedGap {
    pub gap_type: String,
    pub domain: Option<String>,
    pub confidence: f64,
    pub recommended_scope: String,
    pub project_path: Option<String>,
    pub desired_capability: String,
    pub evidence_summary: String,
    pub detector_rule_id: String,
    pub detector_rule_version: u32,
    pub observation_ids: Vec<String>,
}

/// Compiled form of an extraction rule
#[derive(Debug, Clone)]
pub enum Extractor {
    Default,
    Regex(Regex),
    Field(String),
    Literal(String),
}

impl Extractor {
    pub fn compile(spec: &ExtractSpec) -> Self {
        let Some(rule) = spec.desired_capability.as_deref().map(str::trim) else {
            return Extractor::Default;
        };
        if rule.is_empty() {
            return Extractor::Default;
        }

        if let Some(pattern) = rule.strip_prefix("regex:") {
            return match RegexBuilder::new(pattern.trim()).case_insensitive(true).build() {
                Ok(re) => Extractor::Regex(re),
                Err(e) => {
                    warn!("Invalid extraction regex '{}': {}", pattern.trim(), e);
                    Extractor::Default
                }
            };
        }
        if let Some(field) = rule.strip_prefix("field:") {
            return Extractor::Field(field.trim().to_string());
        }
        Extractor::Literal(rule.to_string())
    }

    /// Desired-capability text for the matched observations
    pub fn extract(&self, matched: &[&ObservationView<'_>]) -> String {
        let found = match self {
            Extractor::Default => None,
            Extractor::Literal(text) => Some(text.clone()),
            Extractor::Regex(re) => matched.iter().find_map(|view| {
                let raw = &view.observation.raw_json;
                let haystack = if raw.is_empty() { view.record_text() } else { raw.clone() };
                re.captures(&haystack).map(|caps| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
            }),
            Extractor::Field(path) => matched.iter().find_map(|view| {
                view.resolve(path).filter(|v| is_truthy(v)).map(value_text)
            }),
        };

        let text = match found {
            Some(text) if !text.trim().is_empty() => text,
            _ => default_capability(matched),
        };
        truncate_chars(&text, MAX_CAPABILITY_CHARS)
    }
}

/// Error text, then an explicit missing-capability field, then a tool summary
fn default_capability(matched: &[&ObservationView<'_>]) -> String {
    for view in matched {
        for field in ["tool_error", "failure_missing_capability"] {
            if let Some(v) = view.resolve(field).filter(|v| is_truthy(v)) {
                return value_text(v);
            }
        }
    }

    let tools: BTreeSet<&str> = matched
        .iter()
        .filter_map(|v| v.observation.tool_name.as_deref())
        .filter(|t| !t.is_empty())
        .collect();
    if !tools.is_empty() {
        return format!("Issue with tools: {}", tools.into_iter().collect::<Vec<_>>().join(", "));
    }

    GENERIC_CAPABILITY.to_string()
}

/// Trigger confidence for a number of matching observations
pub fn trigger_confidence(match_count: usize, boost: f64) -> f64 {
    (BASE_CONFIDENCE + match_count as f64 * boost).min(MAX_CONFIDENCE)
}

/// `[date] tool: error`, `[date] event: tool` or `[date] event`, up to five entries
pub fn evidence_summary(matched: &[&ObservationView<'_>]) -> String {
    let entries: Vec<String> = matched
        .iter()
        .take(MAX_EVIDENCE_ITEMS)
        .map(|view| {
            let obs = view.observation;
            let event = if obs.event_type.is_empty() { "unknown" } else { obs.event_type.as_str() };
            let tool = obs.tool_name.as_deref().unwrap_or("");
            match obs.tool_error.as_deref().filter(|e| !e.is_empty()) {
                Some(error) => format!("[{}] {}: {}", obs.date(), tool, truncate_chars(error, 50)),
                None if !tool.is_empty() => format!("[{}] {}: {}", obs.date(), event, tool),
                None => format!("[{}] {}", obs.date(), event),
            }
        })
        .collect();

    if entries.is_empty() {
        "No specific evidence".to_string()
    } else {
        entries.join("; ")
    }
}

fn infer_scope(rule: &CompiledRule, matched: &[&ObservationView<'_>]) -> String {
    if !rule.rule.scope_inference.is_empty() {
        let all_text = matched
            .iter()
            .map(|v| v.record_text())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        for scope_rule in &rule.rule.scope_inference {
            if scope_rule.condition == "default"
                || all_text.contains(&scope_rule.condition.to_lowercase())
            {
                return scope_rule.scope.clone();
            }
        }
    }
    gap_types::default_scope(&rule.rule.gap_type).to_string()
}

/// Stateless evaluator over an immutable rule set
pub struct RuleEngine<'r> {
    rules: &'r RuleSet,
}

impl<'r> RuleEngine<'r> {
    pub fn new(rules: &'r RuleSet) -> Self {
        Self { rules }
    }

    /// Evaluate every enabled rule independently against the batch and
    /// return the union of detected gaps (not yet deduplicated)
    pub fn evaluate(&self, observations: &[Observation]) -> Vec<DetectedGap> {
        let views: Vec<ObservationView<'_>> = observations.iter().map(ObservationView::new).collect();
        let mut gaps = Vec::new();

        for rule in self.rules.rules() {
            for compiled in &rule.triggers {
                let matched: Vec<&ObservationView<'_>> =
                    views.iter().filter(|v| compiled.condition.matches(v)).collect();
                if matched.is_empty() {
                    continue;
                }

                let confidence = trigger_confidence(matched.len(), compiled.trigger.confidence_boost);
                if confidence < rule.rule.min_confidence {
                    debug!(
                        "Rule {} matched {} observations below min confidence ({:.2} < {:.2})",
                        rule.rule.id,
                        matched.len(),
                        confidence,
                        rule.rule.min_confidence
                    );
                    continue;
                }

                let gap = DetectedGap {
                    gap_type: rule.rule.gap_type.clone(),
                    domain: infer_domain(matched.iter().map(|v| v.domain_text())).map(String::from),
                    confidence,
                    recommended_scope: infer_scope(rule, &matched),
                    project_path: matched[0].observation.project_path.clone(),
                    desired_capability: compiled.extractor.extract(&matched),
                    evidence_summary: evidence_summary(&matched),
                    detector_rule_id: rule.rule.id.clone(),
                    detector_rule_version: rule.rule.version,
                    observation_ids: matched.iter().map(|v| v.observation.id.clone()).collect(),
                };
                debug!(
                    "Rule {} detected {} gap '{}' ({:.2})",
                    gap.detector_rule_id, gap.gap_type, gap.desired_capability, gap.confidence
                );
                gaps.push(gap);
            }
        }

        gaps
    }
}
