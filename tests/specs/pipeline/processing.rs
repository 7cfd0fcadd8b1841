//! Processing: module chains between completion and dispatch.

use crate::prelude::{ct_tags, Pipeline, QUIET};
use radroute_core::stage::StageKind;
use radroute_core::task::TaskStage;
use std::time::Duration;

const DENOISE_THEN_ARCHIVE: &str = r#"
    [rule.denoise_ct]
    condition = 'Modality == "CT"'
    modules = ["denoise"]
    targets = ["archive"]

    [module.denoise]
    image = "vendor/denoise:1.2"

    [target.archive]
    protocol = "fake"
    [target.archive.params]
    name = "archive"
"#;

#[tokio::test]
async fn module_output_is_what_gets_dispatched() {
    let mut pipeline = Pipeline::new(DENOISE_THEN_ARCHIVE);
    pipeline.runner.set_output_files(vec!["result.dcm".to_string()]);
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::Success);

    let delivered = &pipeline.targets.calls()[0].files;
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].ends_with("result.dcm"));
}

#[tokio::test]
async fn failed_module_retries_after_the_delay_and_recovers() {
    let mut pipeline = Pipeline::new(DENOISE_THEN_ARCHIVE);
    pipeline.runner.push_failure(1, "transient model error");
    pipeline.runner.set_output_files(vec!["result.dcm".to_string()]);
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Processing, "1.2.3.4");
    assert!(matches!(task.stage, TaskStage::RetryableError { .. }));
    assert_eq!(task.retry_count, 1);

    pipeline.clock.advance(Duration::from_secs(61));
    pipeline.tick().await;

    let task = pipeline.load_task(StageKind::Success, "1.2.3.4");
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.diagnostics.len(), 1);
}

#[tokio::test]
async fn retry_count_never_passes_the_maximum_before_terminal() {
    let mut pipeline = Pipeline::with_retry_max(DENOISE_THEN_ARCHIVE, 3);
    for _ in 0..5 {
        pipeline.runner.push_failure(1, "persistent model error");
    }
    pipeline.write_series("1.2.3.4", &["a.dcm"], &ct_tags("1.2.3.4"));

    pipeline.tick().await;
    pipeline.clock.advance(QUIET + Duration::from_secs(1));
    for _ in 0..6 {
        pipeline.tick().await;
        pipeline.clock.advance(Duration::from_secs(61));
    }

    let task = pipeline.load_task(StageKind::Error, "1.2.3.4");
    assert_eq!(task.stage, TaskStage::TerminalError);
    assert_eq!(task.retry_count, 3);
    assert_eq!(task.diagnostics.len(), 3);
    assert!(pipeline.events.names().contains(&"task:error"));
}
