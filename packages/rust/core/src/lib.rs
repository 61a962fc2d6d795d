//! Core orchestration for docpipe.
//!
//! Ties discovery, the fingerprint store, and the stage registry together:
//! every discovered document is driven through the enabled stages by a
//! bounded pool of workers, and stages already done for the document's
//! current content are skipped.

pub mod command;
pub mod executor;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod summary;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;

use docpipe_shared::Result;

pub use command::{CommandExecutor, registry_from_config};
pub use executor::{Artifact, PriorOutput, PriorOutputs, StageExecutor, StageInput, StageOutput};
pub use policy::{SkipDecision, decide};
pub use registry::{Stage, StageRegistry, StageSelection};
pub use scheduler::{CancelHandle, Orchestrator, RunObserver, RunOptions, SilentObserver};
pub use summary::{DocumentReport, LaneState, RunCounts, RunSummary, StageOutcome};

/// Run `registry` over every document under `root` with no progress reporting.
pub async fn run(root: &Path, registry: StageRegistry, options: RunOptions) -> Result<RunSummary> {
    Orchestrator::new(registry, options)?.run(root).await
}
