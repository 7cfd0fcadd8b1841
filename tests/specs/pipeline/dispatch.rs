//! Dispatch: per-target retry, exhaustion, and offpeak deferral.

use crate::prelude::{ct_tags, Pipeline, QUIET};
use chrono::{DateTime, Utc};
use radroute_core::stage::StageKind;
use radroute_core::task::TaskStage;
use std::time::Duration;

const CT_TO_ARCHIVE: &str = r#"
    [rule.ct_archive]
    condition = 'Modality == "CT"'
    targets = ["archive"]

    [target.archive]
    protocol = "fake"
    [target.archive.params]
    name = "archive"
"#;

fn wall(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn sole_failing_target_exhausts_with_one_diagnostic_per_attempt() {
    let mut pipeline = Pipeline::new(CT_TO_ARCHIVE);
    pipeline.targets.fail_always("archive", "unreachable");
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    for _ in 0..5 {
        pipeline.tick().await;
        pipeline.clock.advance(Duration::from_secs(61));
    }

    let task = pipeline.load_task(StageKind::Error, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::TerminalError);
    assert_eq!(task.retry_count, 5);
    assert_eq!(task.diagnostics.len(), 5);
    assert_eq!(pipeline.targets.attempts_for("archive"), 5);
}

#[tokio::test]
async fn one_target_failing_never_blocks_the_other() {
    let mut pipeline = Pipeline::new(
        r#"
        [rule.ct_both]
        condition = 'Modality == "CT"'
        targets = ["archive", "pacs"]

        [target.archive]
        protocol = "fake"
        [target.archive.params]
        name = "archive"

        [target.pacs]
        protocol = "fake"
        [target.pacs.params]
        name = "pacs"
        "#,
    );
    pipeline.targets.push_failure("pacs", "busy");
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Outgoing, "1.2.3.4");
    let archive = task.targets.iter().find(|t| t.name == "archive").unwrap();
    let pacs = task.targets.iter().find(|t| t.name == "pacs").unwrap();
    assert!(archive.delivered);
    assert!(!pacs.delivered);
    assert_eq!(pacs.attempts, 1);

    pipeline.clock.advance(Duration::from_secs(61));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::Success);
    assert_eq!(pipeline.targets.attempts_for("archive"), 1);
    assert_eq!(pipeline.targets.attempts_for("pacs"), 2);
}

#[tokio::test]
async fn offpeak_selection_defers_dispatch_until_the_window() {
    let mut pipeline = Pipeline::new(
        r#"
        [rule.ct_overnight]
        condition = 'Modality == "CT"'
        priority = "offpeak"
        targets = ["archive"]

        [target.archive]
        protocol = "fake"
        [target.archive.params]
        name = "archive"
        "#,
    );
    pipeline.clock.set_wall(wall("2024-06-01T12:00:00Z"));
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    // Routed, but held outside the window
    assert!(pipeline.stage_has(StageKind::Outgoing, "1.2.3.4"));
    assert_eq!(pipeline.targets.attempts_for("archive"), 0);

    pipeline.clock.set_wall(wall("2024-06-01T23:00:00Z"));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::Success);
}
