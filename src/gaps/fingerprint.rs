//! Text normalisation, fingerprints and word-set similarity for gap deduplication

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

use crate::detection::DetectedGap;

static DATE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[-/]\d{2}[-/]\d{2}\b").expect("valid date regex"));
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\s]").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

const FINGERPRINT_WORDS: usize = 10;
const FINGERPRINT_HEX_LEN: usize = 16;

/// Lowercase, drop date tokens, replace punctuation with spaces, collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    let without_dates = DATE_TOKEN.replace_all(&lower, " ");
    let words_only = NON_WORD.replace_all(&without_dates, " ");
    WHITESPACE.replace_all(&words_only, " ").trim().to_string()
}

/// Exact-match key for a gap: hash of the type and its first ten sorted keywords
pub fn fingerprint(gap_type: &str, desired_capability: &str) -> String {
    let normalized = normalize_text(desired_capability);
    let words: BTreeSet<&str> = normalized.split_whitespace().filter(|w| w.len() > 2).collect();
    let key = format!(
        "{}:{}",
        gap_type,
        words.into_iter().take(FINGERPRINT_WORDS).collect::<Vec<_>>().join(" ")
    );

    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}

/// Jaccard similarity of the normalised word sets
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let wa: BTreeSet<&str> = a.split_whitespace().collect();
    let wb: BTreeSet<&str> = b.split_whitespace().collect();
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Collapse gaps sharing a fingerprint, keeping the highest-confidence one in
/// the position of the first occurrence
pub fn dedup_batch(gaps: Vec<DetectedGap>) -> Vec<DetectedGap> {
    let mut unique: Vec<DetectedGap> = Vec::with_capacity(gaps.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for gap in gaps {
        let key = fingerprint(&gap.gap_type, &gap.desired_capability);
        match index.get(&key) {
            Some(&i) => {
                if gap.confidence > unique[i].confidence {
                    unique[i] = gap;
                }
            }
            None => {
                index.insert(key, unique.len());
                unique.push(gap);
            }
        }
    }

    unique
}
