//! Routing: completed groups become tasks and reach their selected targets.

use crate::prelude::{ct_tags, Pipeline, QUIET};
use radroute_core::stage::StageKind;
use radroute_core::task::TaskStage;
use std::time::Duration;

const CT_TO_ARCHIVE: &str = r#"
    [rule.ct_archive]
    condition = 'Modality == "CT" and FileCount >= 1'
    targets = ["archive"]

    [target.archive]
    protocol = "fake"
    [target.archive.params]
    name = "archive"
"#;

#[tokio::test]
async fn series_flows_from_intake_to_delivery() {
    let mut pipeline = Pipeline::new(CT_TO_ARCHIVE);
    pipeline.write_series("1.2.3.4", &["a.dcm", "b.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    assert!(pipeline.stage_has(StageKind::Intake, "1.2.3.4"));

    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::Success);
    assert_eq!(task.files.len(), 2);
    assert_eq!(pipeline.targets.attempts_for("archive"), 1);
    assert_eq!(pipeline.targets.calls()[0].files.len(), 2);

    let milestones = [
        "task:complete",
        "task:registered",
        "dispatch:delivered",
        "task:success",
    ];
    let order: Vec<&str> = pipeline
        .events
        .names()
        .into_iter()
        .filter(|n| milestones.contains(n))
        .collect();
    assert_eq!(order, milestones);
}

#[tokio::test]
async fn matching_rules_fan_out_and_shared_targets_deliver_once() {
    let mut pipeline = Pipeline::new(
        r#"
        [rule.first]
        condition = 'Modality == "CT"'
        targets = ["archive"]

        [rule.second]
        condition = 'FileCount >= 1'
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
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3.4");
    assert_eq!(task.matched_rules, vec!["first", "second"]);
    // Exactly {archive, pacs}: the shared target is deduplicated
    assert_eq!(task.targets.len(), 2);
    assert_eq!(pipeline.targets.attempts_for("archive"), 1);
    assert_eq!(pipeline.targets.attempts_for("pacs"), 1);
}

#[tokio::test]
async fn series_matching_no_rule_is_discarded() {
    let mut pipeline = Pipeline::new(
        r#"
        [rule.mr_only]
        condition = 'Modality == "MR"'
        targets = ["archive"]

        [target.archive]
        protocol = "fake"
        [target.archive.params]
        name = "archive"
        "#,
    );
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Discard, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::Discard);
    assert!(pipeline.targets.calls().is_empty());
    assert!(pipeline.events.names().contains(&"task:discard"));
}

#[tokio::test]
async fn study_scope_rules_collect_then_route_the_whole_study() {
    let mut pipeline = Pipeline::new(
        r#"
        [rule.ct_study]
        condition = 'Modality == "CT"'
        scope = "study"
        targets = ["archive"]

        [target.archive]
        protocol = "fake"
        [target.archive.params]
        name = "archive"
        "#,
    );
    pipeline.write_series("1.2.3.1", &["a.dcm"], &ct_tags("1.2.3.1"));
    pipeline.write_series("1.2.3.2", &["b.dcm"], &ct_tags("1.2.3.2"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;
    assert!(pipeline.stage_has(StageKind::Studies, "1.2.3"));

    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3");
    assert_eq!(task.files.len(), 2);
    assert_eq!(pipeline.targets.attempts_for("archive"), 1);
    let delivered = &pipeline.targets.calls()[0].files;
    assert_eq!(delivered.len(), 2);
}
