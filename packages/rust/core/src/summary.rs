//! Lane states and the run summary.

use std::fmt;
use std::time::Duration;

use docpipe_shared::{Document, StageName};

/// Where a document's lane stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneState {
    /// Never dispatched.
    Pending,
    /// Every enabled stage executed or was already done.
    Done,
    /// `stage` could not run because `missing` is neither done nor enabled.
    Blocked {
        stage: StageName,
        missing: StageName,
    },
    /// A stage (or the lane's own bookkeeping, when `stage` is `None`) failed.
    Failed {
        stage: Option<StageName>,
        error: String,
    },
    /// Stopped at a stage boundary by fail-fast or an interrupt.
    Cancelled,
}

impl LaneState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { stage, missing } => {
                write!(f, "blocked at {stage} (needs {missing})")
            }
            Self::Failed {
                stage: Some(stage),
                error,
            } => write!(f, "failed at {stage}: {error}"),
            Self::Failed { stage: None, error } => write!(f, "failed: {error}"),
            other => f.write_str(other.label()),
        }
    }
}

/// What happened to one stage of one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Executed,
    Skipped,
    Blocked { missing: StageName },
    Failed { error: String },
}

/// Per-document result of a run.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub document: Document,
    pub state: LaneState,
    /// Stages the lane reached, in order.
    pub stages: Vec<(StageName, StageOutcome)>,
    pub elapsed: Duration,
}

impl DocumentReport {
    pub fn pending(document: Document) -> Self {
        Self {
            document,
            state: LaneState::Pending,
            stages: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Number of stages that actually ran their executor successfully.
    pub fn executed(&self) -> usize {
        self.stages
            .iter()
            .filter(|(_, o)| *o == StageOutcome::Executed)
            .count()
    }

    pub fn outcome(&self, stage: StageName) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, o)| o)
    }
}

/// Document counts by final lane state.
///
/// `processed` counts DONE lanes that executed at least one stage; `skipped`
/// counts DONE lanes where every enabled stage was already done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub pending: usize,
}

/// The outcome of a whole run, documents in discovery order.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub documents: Vec<DocumentReport>,
    /// Enabled stages, in registry order.
    pub stages: Vec<StageName>,
    /// Index into `documents` of the first lane to fail.
    pub first_failure: Option<usize>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts::default();
        for report in &self.documents {
            match report.state {
                LaneState::Done if report.executed() > 0 => counts.processed += 1,
                LaneState::Done => counts.skipped += 1,
                LaneState::Failed { .. } => counts.failed += 1,
                LaneState::Blocked { .. } => counts.blocked += 1,
                LaneState::Cancelled => counts.cancelled += 1,
                LaneState::Pending => counts.pending += 1,
            }
        }
        counts
    }

    /// Total executor calls that succeeded across all lanes.
    pub fn executed_stages(&self) -> usize {
        self.documents.iter().map(DocumentReport::executed).sum()
    }

    /// The first lane to fail, if any.
    pub fn first_failure(&self) -> Option<&DocumentReport> {
        self.first_failure.and_then(|i| self.documents.get(i))
    }

    pub fn report(&self, rel_path: &str) -> Option<&DocumentReport> {
        self.documents
            .iter()
            .find(|r| r.document.rel_path == rel_path)
    }

    /// True when no document failed.
    pub fn is_success(&self) -> bool {
        self.counts().failed == 0
    }
}
