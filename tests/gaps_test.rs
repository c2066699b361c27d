//! Cross-run gap deduplication, decay and the periodic schedule

use capsmith::db::Database;
use capsmith::detection::{run_detection, DetectedGap, DetectionReport, DetectorRule, RuleSet};
use capsmith::gaps::{fingerprint, DetectionSchedule, GapRepository};
use capsmith::observations::Observation;
use capsmith::types::GapStatus;
use chrono::{Duration, Utc};

fn detected(desired: &str, confidence: f64, evidence: &str, obs: &str) -> DetectedGap {
    DetectedGap {
        gap_type: "knowledge".into(),
        domain: Some("yaml".into()),
        confidence,
        recommended_scope: "project".into(),
        project_path: Some("/work/app".into()),
        desired_capability: desired.into(),
        evidence_summary: evidence.into(),
        detector_rule_id: "questions".into(),
        detector_rule_version: 1,
        observation_ids: vec![obs.into()],
    }
}

#[test]
fn test_fingerprint_ignores_dates_case_and_punctuation() {
    assert_eq!(
        fingerprint("tool", "Parse YAML configs (2026-10-01)!"),
        fingerprint("tool", "parse yaml CONFIGS 2026-09-30")
    );
    assert_ne!(fingerprint("tool", "parse yaml configs"), fingerprint("knowledge", "parse yaml configs"));
}

#[test]
fn test_merge_keeps_max_confidence_and_caps_evidence() {
    let db = Database::open_in_memory().unwrap();
    let repo = GapRepository::new(&db);

    let long = "x".repeat(400);
    let first = repo
        .save(&detected("validate yaml schema files", 0.8, &long, "obs-1"))
        .unwrap();
    assert!(first.is_new);

    let second = repo
        .save(&detected("Validate YAML schema files", 0.5, &long, "obs-2"))
        .unwrap();
    assert!(!second.is_new);
    assert_eq!(second.gap_id, first.gap_id);

    let gap = repo.get(&first.gap_id).unwrap();
    assert_eq!(gap.confidence, 0.8);
    assert!(gap.evidence_summary.chars().count() <= 500);
    assert_eq!(gap.observation_ids, vec!["obs-1", "obs-2"]);

    // dismissed gaps are never merged into
    repo.dismiss(&first.gap_id, "not needed").unwrap();
    let third = repo
        .save(&detected("validate yaml schema files", 0.6, "again", "obs-3"))
        .unwrap();
    assert!(third.is_new);
    assert_eq!(repo.get(&first.gap_id).unwrap().status, GapStatus::Dismissed);
}

#[test]
fn test_decay_only_touches_stale_pending_gaps() {
    let db = Database::open_in_memory().unwrap();
    let repo = GapRepository::new(&db);
    let stale = repo.save(&detected("convert yaml to json", 0.7, "e", "obs-1")).unwrap().gap_id;
    let floor = repo.save(&detected("lint markdown tables", 0.1, "e", "obs-2")).unwrap().gap_id;

    let now = Utc::now();
    assert_eq!(repo.decay(now).unwrap(), 0);

    let later = now + Duration::hours(25);
    assert_eq!(repo.decay(later).unwrap(), 2);
    assert!((repo.get(&stale).unwrap().confidence - 0.665).abs() < 1e-9);
    assert_eq!(repo.get(&floor).unwrap().confidence, 0.1);

    // decay refreshed updated_at, so nothing is stale an hour later
    assert_eq!(repo.decay(later + Duration::hours(1)).unwrap(), 0);
}

#[test]
fn test_periodic_detection_is_gated() {
    let db = Database::open_in_memory().unwrap();
    let rules = RuleSet::new([DetectorRule::from_yaml(
        "id: errors\ngap_type: recovery\ntriggers:\n  - condition: tool_error\n",
    )
    .unwrap()]);
    let observations = vec![Observation::tool_event(
        "obs-1",
        "s1",
        "2026-10-01T00:00:00Z",
        "Bash",
        Some("command timed out after 120s"),
    )];
    let schedule = DetectionSchedule::new(&db, 30);
    let now = Utc::now();

    let first = schedule
        .run_periodic(now, false, || Ok(run_detection(&db, &rules, &observations, 100)?))
        .unwrap();
    assert!(first.ran);
    assert_eq!(first.report.as_ref().map(|r| r.new_gap_ids.len()), Some(1));

    let skipped = schedule
        .run_periodic(now + Duration::minutes(5), false, || Ok(DetectionReport::default()))
        .unwrap();
    assert!(!skipped.ran);

    let forced = schedule
        .run_periodic(now + Duration::minutes(5), true, || Ok(run_detection(&db, &rules, &observations, 100)?))
        .unwrap();
    assert!(forced.ran);
    assert_eq!(forced.report.map(|r| r.observations_considered), Some(0));
}
