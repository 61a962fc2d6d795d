//! The contract between the scheduler and the code that does a stage's work.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use docpipe_shared::{Document, StageError, StageName};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What an earlier, completed stage left behind for this document.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PriorOutput {
    /// Absolute paths of the artifacts the stage wrote.
    pub artifacts: Vec<PathBuf>,
    /// The structured result the executor returned.
    pub result: Value,
}

/// Outputs of every completed earlier stage, keyed by stage.
pub type PriorOutputs = BTreeMap<StageName, PriorOutput>;

/// Everything an executor receives for one `(document, stage)` work item.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub stage: StageName,
    pub document: &'a Document,
    pub prior: &'a PriorOutputs,
    /// Stage-specific options from configuration (a JSON object, possibly empty).
    pub options: &'a Value,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A derived file the scheduler writes next to the source document.
///
/// It lands at `<source file name><suffix>`, e.g. `report.pdf` with suffix
/// `.converted.md` becomes `report.pdf.converted.md`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub suffix: String,
    pub contents: Vec<u8>,
}

impl Artifact {
    pub fn new(suffix: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            suffix: suffix.into(),
            contents: contents.into(),
        }
    }
}

/// A successful stage result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub artifacts: Vec<Artifact>,
    pub result: Value,
}

impl StageOutput {
    /// An output with a result and no artifacts.
    pub fn result(result: Value) -> Self {
        Self {
            artifacts: Vec::new(),
            result,
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Performs one stage for one document.
///
/// Executors must not touch fingerprint sidecars; the scheduler persists
/// artifacts and flags after a successful return.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, input: StageInput<'_>) -> Result<StageOutput, StageError>;
}
