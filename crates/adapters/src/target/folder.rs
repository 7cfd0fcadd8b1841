// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Folder target: copy to a local (or mounted) destination directory

use super::{copy_atomic, PushError, TargetChannel};
use async_trait::async_trait;
use radroute_rules::Target;
use std::path::{Path, PathBuf};

/// Handler for the `folder` protocol.
///
/// Parameters: `path` (destination directory, required); `subfolder`
/// (optional template `uid` to file transfers per task directory name).
#[derive(Clone, Debug, Default)]
pub struct FolderTarget;

impl FolderTarget {
    fn destination(target: &Target, files: &[PathBuf]) -> Result<PathBuf, PushError> {
        let base = target
            .params
            .get("path")
            .filter(|p| !p.is_empty())
            .ok_or(PushError::MissingParam("path"))?;
        let mut dest = PathBuf::from(base);

        if target.params.get("subfolder").map(String::as_str) == Some("uid") {
            if let Some(task_dir) = files
                .first()
                .and_then(|p| Path::parent(p.as_path()))
                .and_then(Path::file_name)
            {
                dest.push(task_dir);
            }
        }
        Ok(dest)
    }
}

#[async_trait]
impl TargetChannel for FolderTarget {
    async fn push(&self, files: &[PathBuf], target: &Target) -> Result<(), PushError> {
        let dest = Self::destination(target, files)?;
        let files = files.to_vec();

        // Copies are plain blocking I/O
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest).map_err(|source| PushError::Io {
                path: dest.clone(),
                source,
            })?;
            for file in &files {
                copy_atomic(file, &dest)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| PushError::Rejected(format!("copy worker failed: {}", e)))?
    }
}
