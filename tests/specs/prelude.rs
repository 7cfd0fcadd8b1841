//! Shared fixture: the three daemon loops wired to fakes over one data dir.

use radroute_adapters::bookkeeper::{Bookkeeper, FakeBookkeeper};
use radroute_adapters::runner::{FakeRunner, RunnerBackend};
use radroute_adapters::target::{FakeTarget, TargetHandler, TargetRegistry};
use radroute_core::clock::FakeClock;
use radroute_core::completion::TriggerConfig;
use radroute_core::settings::{Settings, SettingsWatcher};
use radroute_core::stage::{StageKind, StageStore, TAGS_EXTENSION};
use radroute_core::task::TaskRecord;
use radroute_daemon::{DispatcherLoop, ProcessorLoop, RouterLoop};
use radroute_rules::{Catalog, CatalogWatcher};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const QUIET: Duration = Duration::from_secs(60);

pub struct Pipeline {
    _tmp: tempfile::TempDir,
    pub store: StageStore,
    pub clock: FakeClock,
    pub events: FakeBookkeeper,
    pub runner: FakeRunner,
    pub targets: FakeTarget,
    pub router: RouterLoop<FakeClock>,
    pub processor: ProcessorLoop<FakeClock>,
    pub dispatcher: DispatcherLoop<FakeClock>,
}

impl Pipeline {
    pub fn new(catalog: &str) -> Self {
        Self::with_retry_max(catalog, 5)
    }

    pub fn with_retry_max(catalog: &str, retry_max: u32) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            data_dir: tmp.path().to_path_buf(),
            retry_max,
            retry_delay: Duration::from_secs(60),
            ..Default::default()
        };
        settings.series = TriggerConfig {
            quiet_period: QUIET,
            max_wait: Duration::from_secs(3600),
            on_ceiling: Default::default(),
        };
        settings.study = TriggerConfig {
            quiet_period: QUIET,
            max_wait: Duration::from_secs(7200),
            on_ceiling: Default::default(),
        };

        let store = StageStore::new(tmp.path());
        store.ensure_layout().unwrap();
        let clock = FakeClock::new();
        let events = FakeBookkeeper::new();
        let runner = FakeRunner::new();
        let targets = FakeTarget::new();

        let settings = Arc::new(Mutex::new(SettingsWatcher::fixed(settings)));
        let catalog = Arc::new(Mutex::new(CatalogWatcher::fixed(
            Catalog::parse(catalog).unwrap(),
        )));
        let sink = Arc::new(Bookkeeper::Fake(events.clone()));
        let mut registry = TargetRegistry::default();
        registry.register("fake", TargetHandler::Fake(targets.clone()));

        let router = RouterLoop::new(
            Arc::clone(&settings),
            Arc::clone(&catalog),
            Arc::clone(&sink),
            clock.clone(),
        );
        let processor = ProcessorLoop::new(
            Arc::clone(&settings),
            Arc::clone(&catalog),
            Arc::clone(&sink),
            Arc::new(RunnerBackend::Fake(runner.clone())),
            clock.clone(),
        );
        let dispatcher = DispatcherLoop::new(
            settings,
            catalog,
            sink,
            Arc::new(registry),
            clock.clone(),
        );

        Pipeline {
            _tmp: tmp,
            store,
            clock,
            events,
            runner,
            targets,
            router,
            processor,
            dispatcher,
        }
    }

    /// One scheduling round: every loop scans once, router first
    pub async fn tick(&mut self) {
        self.router.cycle().await.unwrap();
        self.processor.cycle().await.unwrap();
        self.dispatcher.cycle().await.unwrap();
    }

    pub fn write_series(&self, uid: &str, names: &[&str], tags: &serde_json::Value) {
        let dir = self.store.root(StageKind::Intake).join(uid);
        std::fs::create_dir_all(&dir).unwrap();
        for name in names {
            std::fs::write(dir.join(name), b"dicom").unwrap();
            let sidecar = Path::new(name).with_extension(TAGS_EXTENSION);
            std::fs::write(dir.join(sidecar), tags.to_string()).unwrap();
        }
    }

    pub fn load_task(&self, stage: StageKind, uid: &str) -> TaskRecord {
        TaskRecord::load(&self.store.root(stage).join(uid)).unwrap()
    }

    pub fn stage_has(&self, stage: StageKind, uid: &str) -> bool {
        self.store.root(stage).join(uid).exists()
    }
}

pub fn ct_tags(series_uid: &str) -> serde_json::Value {
    serde_json::json!({
        "Modality": "CT",
        "SeriesInstanceUID": series_uid,
        "StudyInstanceUID": "1.2.3",
        "PatientID": "PAT-7",
        "SeriesDescription": "AXIAL",
    })
}
