//! Core domain types for docpipe runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DocPipeError;

/// Suffix appended to a source file name to form its fingerprint sidecar.
pub const SIDECAR_SUFFIX: &str = ".metadata.json";

/// Marker carried by every conversion output (`report.pdf.converted.md`).
pub const CONVERTED_MARKER: &str = ".converted";

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// Name of one step in the fixed pipeline chain.
///
/// The declaration order is the canonical chain order:
/// convert → validate → analyze → embed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Convert,
    Validate,
    Analyze,
    Embed,
}

impl StageName {
    /// All stages in canonical chain order.
    pub const ALL: [StageName; 4] = [
        StageName::Convert,
        StageName::Validate,
        StageName::Analyze,
        StageName::Embed,
    ];

    /// Key used in sidecar `steps` maps and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Validate => "validate",
            Self::Analyze => "analyze",
            Self::Embed => "embed",
        }
    }

    /// The stage that must be complete before this one can run in the
    /// canonical chain.
    pub fn canonical_predecessor(&self) -> Option<StageName> {
        match self {
            Self::Convert => None,
            Self::Validate => Some(Self::Convert),
            Self::Analyze => Some(Self::Validate),
            Self::Embed => Some(Self::Analyze),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = DocPipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "convert" | "conversion" => Ok(Self::Convert),
            "validate" | "validation" => Ok(Self::Validate),
            "analyze" | "analysis" => Ok(Self::Analyze),
            "embed" | "embedding" => Ok(Self::Embed),
            other => Err(DocPipeError::config(format!(
                "unknown stage '{other}' (expected one of: convert, validate, analyze, embed)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A source document discovered under the run root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Document {
    /// Absolute (or root-joined) path to the source file.
    pub path: PathBuf,
    /// Root-relative path with forward slashes, used for ordering and display.
    pub rel_path: String,
}

impl Document {
    /// Build a document for `path` found under `root`.
    pub fn new(root: &Path, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let rel_path = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        Self { path, rel_path }
    }

    /// File name of the source, e.g. `report.pdf`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path of a derived file written next to the source:
    /// `<dir>/<file name><suffix>`.
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        self.path.with_file_name(format!("{}{suffix}", self.file_name()))
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rel_path)
    }
}
