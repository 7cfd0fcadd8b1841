// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tag sidecars extracted from received DICOM files
//!
//! The network receiver writes one `.tags` JSON document next to every
//! received file. The router only ever reads these snapshots; it never
//! modifies them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Tag names that rule conditions may reference.
///
/// The receiver extracts more fields than these, but only whitelisted names
/// resolve in the rule language. Everything else in a sidecar is carried
/// opaquely.
pub const KNOWN_TAGS: &[&str] = &[
    "SeriesInstanceUID",
    "StudyInstanceUID",
    "SOPInstanceUID",
    "PatientID",
    "PatientName",
    "Modality",
    "SeriesDescription",
    "StudyDescription",
    "AccessionNumber",
    "StationName",
    "BodyPartExamined",
    "InstitutionName",
    "Manufacturer",
];

/// Grouping scope for tasks and rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Series,
    Study,
    Patient,
}

impl Scope {
    /// The tag that identifies a group at this scope
    pub fn uid_tag(&self) -> &'static str {
        match self {
            Scope::Series => "SeriesInstanceUID",
            Scope::Study => "StudyInstanceUID",
            Scope::Patient => "PatientID",
        }
    }

    /// The scope whose groups nest directly under this one, if any
    pub fn child(&self) -> Option<Scope> {
        match self {
            Scope::Series => None,
            Scope::Study => Some(Scope::Series),
            Scope::Patient => Some(Scope::Study),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Series => write!(f, "series"),
            Scope::Study => write!(f, "study"),
            Scope::Patient => write!(f, "patient"),
        }
    }
}

/// Errors from reading tag sidecars
#[derive(Debug, Error)]
pub enum TagError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid sidecar {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("sidecar {path} is missing tag {tag}")]
    MissingTag { path: String, tag: &'static str },
}

/// Immutable per-file extraction of DICOM header fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSnapshot {
    fields: BTreeMap<String, serde_json::Value>,
}

impl TagSnapshot {
    /// Read a sidecar document from disk
    pub fn load(path: &Path) -> Result<Self, TagError> {
        let text = std::fs::read_to_string(path).map_err(|source| TagError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| TagError::Invalid {
            path: path.display().to_string(),
            source,
        })
    }

    /// Look up a tag value, rendered as a string.
    ///
    /// Numbers are stringified; missing tags and non-scalar values return
    /// `None` (the rule language maps that to the empty string).
    pub fn get(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The UID that identifies this file's group at the given scope
    pub fn uid_for(&self, scope: Scope) -> Option<String> {
        self.get(scope.uid_tag()).filter(|uid| !uid.is_empty())
    }

    pub fn modality(&self) -> Option<String> {
        self.get("Modality")
    }

    pub fn series_description(&self) -> Option<String> {
        self.get("SeriesDescription")
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a snapshot from string pairs (mainly for tests and fixtures)
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), serde_json::Value::String(v.into())))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TagSnapshot {
        TagSnapshot::from_pairs([
            ("Modality", "CT"),
            ("SeriesInstanceUID", "1.2.3.4"),
            ("StudyInstanceUID", "1.2.3"),
            ("PatientID", "PAT-7"),
        ])
    }

    #[test]
    fn uid_for_follows_scope() {
        let tags = snapshot();
        assert_eq!(tags.uid_for(Scope::Series).as_deref(), Some("1.2.3.4"));
        assert_eq!(tags.uid_for(Scope::Study).as_deref(), Some("1.2.3"));
        assert_eq!(tags.uid_for(Scope::Patient).as_deref(), Some("PAT-7"));
    }

    #[test]
    fn empty_uid_counts_as_missing() {
        let tags = TagSnapshot::from_pairs([("SeriesInstanceUID", "")]);
        assert_eq!(tags.uid_for(Scope::Series), None);
    }

    #[test]
    fn numbers_render_as_strings() {
        let json = r#"{"Modality": "MR", "SeriesNumber": 4}"#;
        let tags: TagSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(tags.get("SeriesNumber").as_deref(), Some("4"));
    }

    #[test]
    fn load_rejects_malformed_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.tags");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            TagSnapshot::load(&path),
            Err(TagError::Invalid { .. })
        ));
    }

    #[test]
    fn scope_nesting_chain() {
        assert_eq!(Scope::Patient.child(), Some(Scope::Study));
        assert_eq!(Scope::Study.child(), Some(Scope::Series));
        assert_eq!(Scope::Series.child(), None);
    }
}
