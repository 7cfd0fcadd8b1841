// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Target protocol handlers
//!
//! The dispatcher is polymorphic over one capability: `push(files, target)`.
//! Handlers form a closed set resolved by protocol name through a registry,
//! so new protocols plug in without touching dispatcher logic. Per-protocol
//! DICOM network implementations are external collaborators behind the same
//! contract; the built-in set covers local folder destinations.

pub mod folder;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use async_trait::async_trait;
use radroute_rules::Target;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use folder::FolderTarget;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeTarget, PushCall};

/// Errors from delivering to a target
#[derive(Debug, Error)]
pub enum PushError {
    #[error("target is missing parameter '{0}'")]
    MissingParam(&'static str),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("target rejected the transfer: {0}")]
    Rejected(String),
}

/// The one capability every protocol handler implements
#[async_trait]
pub trait TargetChannel: Send + Sync {
    /// Deliver the given files to the target. Retry policy lives in the
    /// dispatcher; a handler attempts the transfer exactly once.
    async fn push(&self, files: &[PathBuf], target: &Target) -> Result<(), PushError>;
}

/// The closed set of built-in handlers
pub enum TargetHandler {
    Folder(FolderTarget),
    #[cfg(any(test, feature = "test-support"))]
    Fake(FakeTarget),
}

impl TargetHandler {
    fn inner(&self) -> &dyn TargetChannel {
        match self {
            TargetHandler::Folder(handler) => handler,
            #[cfg(any(test, feature = "test-support"))]
            TargetHandler::Fake(handler) => handler,
        }
    }
}

#[async_trait]
impl TargetChannel for TargetHandler {
    async fn push(&self, files: &[PathBuf], target: &Target) -> Result<(), PushError> {
        self.inner().push(files, target).await
    }
}

/// Maps protocol names to handlers
pub struct TargetRegistry {
    handlers: BTreeMap<String, TargetHandler>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
        };
        registry.register("folder", TargetHandler::Folder(FolderTarget::default()));
        registry
    }
}

impl TargetRegistry {
    pub fn register(&mut self, protocol: impl Into<String>, handler: TargetHandler) {
        self.handlers.insert(protocol.into(), handler);
    }

    /// The handler for a protocol name; `None` is a configuration problem
    /// the dispatcher reports loudly without consuming a retry attempt.
    pub fn get(&self, protocol: &str) -> Option<&TargetHandler> {
        self.handlers.get(protocol)
    }
}

/// Copy one file into place via a temp name so receivers polling the
/// destination never observe a partial file.
pub(crate) fn copy_atomic(file: &Path, dest_dir: &Path) -> Result<(), PushError> {
    let name = file
        .file_name()
        .ok_or(PushError::MissingParam("file name"))?;
    let tmp = dest_dir.join(format!(".{}.partial", name.to_string_lossy()));
    let dest = dest_dir.join(name);

    std::fs::copy(file, &tmp).map_err(|source| PushError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    std::fs::rename(&tmp, &dest).map_err(|source| PushError::Io {
        path: dest,
        source,
    })
}
