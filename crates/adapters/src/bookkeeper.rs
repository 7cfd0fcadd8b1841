// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bookkeeper client
//!
//! Job events are fire-and-forget: the pipeline never waits on, or fails
//! because of, the audit trail. With no bookkeeper configured events go to a
//! local JSONL journal instead, so a deployment without the service still
//! keeps its history.

use radroute_core::effect::JobEvent;
use radroute_core::settings::Settings;
use std::io::Write;
use std::path::PathBuf;
#[cfg(any(test, feature = "test-support"))]
use std::sync::{Arc, Mutex};

/// Journal file under the data directory when no bookkeeper is configured
const JOURNAL_FILE: &str = "events.jsonl";

/// Submits job events to the configured sink
pub enum Bookkeeper {
    Http(HttpBookkeeper),
    Journal(JournalBookkeeper),
    #[cfg(any(test, feature = "test-support"))]
    Fake(FakeBookkeeper),
}

impl Bookkeeper {
    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.bookkeeper_url {
            Some(url) => Bookkeeper::Http(HttpBookkeeper::new(url.clone())),
            None => Bookkeeper::Journal(JournalBookkeeper::new(
                settings.data_dir.join(JOURNAL_FILE),
            )),
        }
    }

    /// Submit one event. Never fails; delivery problems are logged and the
    /// pipeline moves on.
    pub async fn submit(&self, event: &JobEvent) {
        match self {
            Bookkeeper::Http(sink) => sink.submit(event).await,
            Bookkeeper::Journal(sink) => sink.submit(event),
            #[cfg(any(test, feature = "test-support"))]
            Bookkeeper::Fake(sink) => sink.submit(event),
        }
    }
}

/// POSTs events to the bookkeeper service
pub struct HttpBookkeeper {
    url: String,
}

impl HttpBookkeeper {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn submit(&self, event: &JobEvent) {
        let url = self.url.clone();
        let task_id = event.task_id.clone();
        let event = event.clone();
        let result = tokio::task::spawn_blocking(move || {
            ureq::post(&url).send_json(&event).map(|_| ())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(url = %self.url, task_id = %task_id, error = %e,
                    "bookkeeper submission failed, event dropped");
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "bookkeeper worker failed");
            }
        }
    }
}

/// Appends events to a local JSONL journal
pub struct JournalBookkeeper {
    path: PathBuf,
}

impl JournalBookkeeper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn submit(&self, event: &JobEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "job event not serializable, dropped");
                return;
            }
        };
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = appended {
            tracing::warn!(journal = %self.path.display(), error = %e,
                "journal append failed, event dropped");
        }
    }
}

/// Records submitted events for assertions
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone, Default)]
pub struct FakeBookkeeper {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn submit(&self, event: &JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Event names in submission order, for compact assertions
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind.name()).collect()
    }
}
