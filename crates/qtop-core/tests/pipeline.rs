use qtop_core::metrics::{Advisory, JobMetrics};
use qtop_core::parser::{self, ParseOptions, RecordFormat};
use qtop_core::reconcile::{promote_finished, reconcile};
use qtop_core::{JobState, Source, Thresholds};
use std::collections::HashSet;
use std::path::Path;

const NOW: i64 = 1_760_600_000;

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("{}: {err}", path.display()))
}

#[test]
fn malformed_and_interactive_blocks_are_skipped_and_counted() {
    let blob = fixture("active.txt");
    let mut stream = parser::parse(&blob, Source::Active, &ParseOptions::default());
    let ids: Vec<String> = stream.by_ref().map(|job| job.id).collect();
    assert_eq!(ids, vec!["500.pbs01", "501.pbs01", "505.pbs01"]);
    assert_eq!(stream.malformed(), 2);
    assert_eq!(stream.interactive(), 1);
    assert!(!stream.truncated());
}

#[test]
fn json_history_feeds_the_same_record_shape() {
    let blob = fixture("history.json");
    let batch = parser::parse(&blob, Source::History, &ParseOptions::default()).into_batch();
    assert_eq!(batch.records.len(), 2);
    let align = batch
        .records
        .iter()
        .find(|job| job.id == "501.pbs01")
        .expect("align");
    assert_eq!(align.state, JobState::Completed);
    assert_eq!(align.owning_user, "alice");
    assert_eq!(align.cpu_count_requested, Some(2));
    assert_eq!(align.memory_requested_kb, Some(8 * 1024 * 1024));
    assert_eq!(align.walltime_used, Some(14_340));
    assert_eq!(align.exit_status, Some(0));
}

#[test]
fn history_corrects_stale_active_state_and_flags_waste() {
    let active = fixture("active.txt");
    let history = fixture("history.json");
    let options = ParseOptions::default();
    let active_batch = parser::parse(&active, Source::Active, &options).into_batch();
    let history_batch = parser::parse(&history, Source::History, &options).into_batch();
    let active_ids = active_batch.ids();

    let mut merged = reconcile(vec![history_batch, active_batch]);
    assert_eq!(merged.len(), 4);

    let align = merged.get("501.pbs01").expect("merged align");
    assert_eq!(align.state, JobState::Completed);
    assert_eq!(align.source, Source::History);

    let metrics = JobMetrics::compute(align, NOW, &Thresholds::default());
    assert!(matches!(
        metrics.advisories.as_slice(),
        [Advisory::UnderUtilized { .. }]
    ));
    assert_eq!(metrics.age, Some(660));

    let still_running: HashSet<String> = active_ids
        .iter()
        .filter(|id| id.as_str() != "501.pbs01")
        .cloned()
        .collect();
    let promoted = promote_finished(&mut merged, &active_ids, &still_running);
    assert_eq!(promoted, vec!["501.pbs01".to_string()]);
    assert_eq!(
        merged.get("480.pbs01").map(|job| job.state),
        Some(JobState::Completed)
    );
}

#[test]
fn short_finished_jobs_get_no_advisory() {
    let blob = fixture("history.json");
    let batch = parser::parse(&blob, Source::History, &ParseOptions::default()).into_batch();
    let old = batch
        .records
        .iter()
        .find(|job| job.id == "480.pbs01")
        .expect("old run");
    let metrics = JobMetrics::compute(old, NOW, &Thresholds::default());
    assert_eq!(metrics.note(), None);
    assert_eq!(metrics.progress, Some(0.1));
}

#[test]
fn cap_and_sentinel_both_mark_truncation() {
    let blob = fixture("active.txt");
    let capped = parser::parse(
        &blob,
        Source::Active,
        &ParseOptions {
            format: RecordFormat::Text,
            max_records: Some(2),
        },
    )
    .into_batch();
    assert_eq!(capped.records.len(), 2);
    assert!(capped.truncated);

    let marked = format!("{blob}\n{}\n", parser::TRUNCATION_SENTINEL);
    let batch = parser::parse(&marked, Source::Active, &ParseOptions::default()).into_batch();
    assert_eq!(batch.records.len(), 3);
    assert!(batch.truncated);

    let merged = reconcile(vec![batch]);
    assert!(merged.active_truncated);
    assert!(!merged.history_truncated);
}

#[test]
fn running_job_near_limit_is_flagged() {
    let blob = fixture("active.txt");
    let merged = reconcile(vec![
        parser::parse(&blob, Source::Active, &ParseOptions::default()).into_batch(),
    ]);
    let thresholds = Thresholds::default();
    let align = JobMetrics::compute(merged.get("501.pbs01").expect("align"), NOW, &thresholds);
    assert!(align.near_walltime_limit);
    let assemble =
        JobMetrics::compute(merged.get("500.pbs01").expect("assemble"), NOW, &thresholds);
    assert!(!assemble.near_walltime_limit);
    assert_eq!(assemble.progress, Some(0.25));
    assert_eq!(assemble.cpu_percent, Some(50.0));
}
