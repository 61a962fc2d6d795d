//! Skip policy: decide whether a stage runs for a document.

use docpipe_fingerprint::FingerprintRecord;
use docpipe_shared::StageName;

/// What the scheduler should do with one `(document, stage)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// Run the executor.
    Execute,
    /// Already done for the current content.
    Skip,
    /// The predecessor has not completed and is not going to run first.
    Blocked { missing: StageName },
}

/// Decide what to do with `stage` given the document's current hash.
///
/// The record is reconciled with `current_hash` first: on mismatch all step
/// flags and metadata are dropped, so a changed document never skips.
pub fn decide(
    record: &mut FingerprintRecord,
    current_hash: &str,
    stage: StageName,
    predecessor: Option<StageName>,
    force: bool,
) -> SkipDecision {
    record.invalidate(current_hash);

    if let Some(pred) = predecessor.filter(|p| !record.is_step_done(*p)) {
        return SkipDecision::Blocked { missing: pred };
    }

    if record.is_step_done(stage) && !force {
        return SkipDecision::Skip;
    }

    SkipDecision::Execute
}
