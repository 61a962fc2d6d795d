//! Run orchestration: discovery, lane dispatch, and the bounded worker pool.
//!
//! Each discovered document gets one lane that walks the enabled stages in
//! registry order. `workers` tasks claim lanes in discovery order and drain
//! each one to a terminal state before claiming the next.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use docpipe_discovery::{DiscoveryOptions, is_generated_artifact};
use docpipe_fingerprint::{FingerprintRecord, FingerprintStore, write_atomic};
use docpipe_shared::{
    DocPipeError, Document, PipelineConfig, Result, StageError, StageName,
};

use crate::executor::{PriorOutput, PriorOutputs, StageInput, StageOutput};
use crate::policy::{self, SkipDecision};
use crate::registry::{Stage, StageRegistry, StageSelection};
use crate::summary::{DocumentReport, LaneState, RunSummary, StageOutcome};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of lanes processed concurrently.
    pub workers: usize,
    /// Re-run stages even when already done for the current content.
    pub force: bool,
    /// Stop dispatching after the first failed lane.
    pub fail_fast: bool,
    /// Which registered stages this run considers.
    pub selection: StageSelection,
    /// Default per-call timeout; a stage's own timeout takes precedence.
    pub stage_timeout: Option<Duration>,
    pub discovery: DiscoveryOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RunOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            workers: config.workers,
            force: config.force,
            fail_fast: config.fail_fast,
            selection: StageSelection::default(),
            stage_timeout: (config.stage_timeout_secs > 0)
                .then(|| Duration::from_secs(config.stage_timeout_secs)),
            discovery: DiscoveryOptions::from(config),
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared interrupt flag. Lanes observe it only between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives progress events while a run is in flight.
///
/// Callbacks are invoked from worker tasks and must not block.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, documents: usize, stages: &[StageName]);
    fn lane_started(&self, doc: &Document);
    fn stage_started(&self, doc: &Document, stage: StageName);
    fn stage_finished(&self, doc: &Document, stage: StageName, outcome: &StageOutcome);
    fn lane_finished(&self, report: &DocumentReport);
}

/// Observer that ignores every event.
pub struct SilentObserver;

impl RunObserver for SilentObserver {
    fn run_started(&self, _: usize, _: &[StageName]) {}
    fn lane_started(&self, _: &Document) {}
    fn stage_started(&self, _: &Document, _: StageName) {}
    fn stage_finished(&self, _: &Document, _: StageName, _: &StageOutcome) {}
    fn lane_finished(&self, _: &DocumentReport) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs a stage registry over a source tree.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    options: RunOptions,
    store: FingerprintStore,
    cancel: CancelHandle,
    observer: Arc<dyn RunObserver>,
}

impl Orchestrator {
    pub fn new(registry: StageRegistry, options: RunOptions) -> Result<Self> {
        if options.workers == 0 {
            return Err(DocPipeError::config("workers must be at least 1"));
        }
        Ok(Self {
            registry: Arc::new(registry),
            options,
            store: FingerprintStore::new(),
            cancel: CancelHandle::new(),
            observer: Arc::new(SilentObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Handle that interrupts this orchestrator's runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Discover documents under `root` and drive every lane to a final state.
    ///
    /// Only configuration and discovery problems are returned as errors;
    /// per-document failures are reported in the summary.
    #[instrument(skip_all, fields(root = %root.display(), run_id = %Uuid::now_v7()))]
    pub async fn run(&self, root: &Path) -> Result<RunSummary> {
        let started = Instant::now();
        let enabled = self.registry.select(&self.options.selection)?;
        if enabled.is_empty() {
            warn!("stage selection is empty, nothing will execute");
        }

        let documents = docpipe_discovery::discover(root, &self.options.discovery)?;
        let worker_count = self.options.workers.min(documents.len());
        info!(
            documents = documents.len(),
            stages = ?enabled,
            workers = worker_count,
            force = self.options.force,
            fail_fast = self.options.fail_fast,
            "starting run"
        );
        self.observer.run_started(documents.len(), &enabled);

        let ctx = Arc::new(RunContext {
            registry: Arc::clone(&self.registry),
            store: self.store.clone(),
            enabled: enabled.clone(),
            force: self.options.force,
            fail_fast: self.options.fail_fast,
            stage_timeout: self.options.stage_timeout,
            cancel: self.cancel.clone(),
            observer: Arc::clone(&self.observer),
            documents: documents.clone(),
            dispatch: Mutex::new(Dispatch::default()),
        });

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(Arc::clone(&ctx).worker(id));
        }

        let mut reports: Vec<DocumentReport> =
            documents.into_iter().map(DocumentReport::pending).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(finished) => {
                    for (idx, report) in finished {
                        reports[idx] = report;
                    }
                }
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }

        let first_failure = ctx.dispatch.lock().await.first_failure;
        let summary = RunSummary {
            documents: reports,
            stages: enabled,
            first_failure,
            elapsed: started.elapsed(),
        };

        let counts = summary.counts();
        info!(
            processed = counts.processed,
            skipped = counts.skipped,
            failed = counts.failed,
            blocked = counts.blocked,
            cancelled = counts.cancelled,
            pending = counts.pending,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run complete"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Run internals
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Dispatch {
    /// Index of the next lane to hand out.
    next: usize,
    /// Set by fail-fast; no lane is handed out afterwards.
    halted: bool,
    first_failure: Option<usize>,
}

struct RunContext {
    registry: Arc<StageRegistry>,
    store: FingerprintStore,
    enabled: Vec<StageName>,
    force: bool,
    fail_fast: bool,
    stage_timeout: Option<Duration>,
    cancel: CancelHandle,
    observer: Arc<dyn RunObserver>,
    documents: Vec<Document>,
    dispatch: Mutex<Dispatch>,
}

impl RunContext {
    async fn worker(self: Arc<Self>, id: usize) -> Vec<(usize, DocumentReport)> {
        let mut finished = Vec::new();
        while let Some(idx) = self.claim().await {
            let doc = self.documents[idx].clone();
            debug!(worker = id, doc = %doc, "lane claimed");

            // A panicking executor takes down only its own lane task.
            let report = match tokio::spawn(Arc::clone(&self).run_lane(idx)).await {
                Ok(report) => report,
                Err(e) => {
                    error!(worker = id, doc = %doc, error = %e, "lane task panicked");
                    self.note_failure(idx).await;
                    DocumentReport {
                        state: LaneState::Failed {
                            stage: None,
                            error: format!("lane task panicked: {e}"),
                        },
                        ..DocumentReport::pending(doc)
                    }
                }
            };
            self.observer.lane_finished(&report);
            finished.push((idx, report));
        }
        finished
    }

    /// Hand out the next lane in discovery order, unless the run is stopping.
    async fn claim(&self) -> Option<usize> {
        let mut dispatch = self.dispatch.lock().await;
        if dispatch.halted || self.cancel.is_cancelled() {
            return None;
        }
        let idx = dispatch.next;
        let doc = self.documents.get(idx)?;
        dispatch.next += 1;
        self.observer.lane_started(doc);
        Some(idx)
    }

    async fn note_failure(&self, idx: usize) {
        let mut dispatch = self.dispatch.lock().await;
        dispatch.first_failure.get_or_insert(idx);
        if self.fail_fast && !dispatch.halted {
            dispatch.halted = true;
            warn!(doc = %self.documents[idx], "fail-fast: no further lanes will be dispatched");
        }
    }

    async fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.dispatch.lock().await.halted
    }

    async fn run_lane(self: Arc<Self>, idx: usize) -> DocumentReport {
        let started = Instant::now();
        let doc = &self.documents[idx];
        let mut report = DocumentReport::pending(doc.clone());

        report.state = self.drive_lane(doc, &mut report.stages).await;
        report.elapsed = started.elapsed();

        if matches!(report.state, LaneState::Failed { .. }) {
            self.note_failure(idx).await;
        }

        match &report.state {
            LaneState::Failed { .. } => {
                warn!(doc = %doc, state = %report.state, "lane failed");
            }
            state => {
                info!(
                    doc = %doc,
                    state = %state,
                    executed = report.executed(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "lane finished"
                );
            }
        }
        report
    }

    /// Walk the enabled stages for one document and return its final state.
    async fn drive_lane(
        &self,
        doc: &Document,
        outcomes: &mut Vec<(StageName, StageOutcome)>,
    ) -> LaneState {
        let hash = match self.store.compute_hash(doc) {
            Ok(h) => h,
            Err(e) => {
                return LaneState::Failed {
                    stage: None,
                    error: e.to_string(),
                };
            }
        };

        let mut record = self.store.load(doc);
        let mut unsaved = record.invalidate(&hash);
        if unsaved {
            debug!(doc = %doc, "new or changed content, step flags reset");
        }

        let mut prior = PriorOutputs::new();
        let mut state = LaneState::Done;

        for stage in self.registry.stages() {
            if !self.enabled.contains(&stage.name) {
                if record.is_step_done(stage.name) {
                    prior.insert(stage.name, recorded_output(doc, &record, stage.name));
                }
                continue;
            }

            if self.should_stop().await {
                debug!(doc = %doc, stage = %stage.name, "stopping at stage boundary");
                state = LaneState::Cancelled;
                break;
            }

            match policy::decide(&mut record, &hash, stage.name, stage.predecessor, self.force) {
                SkipDecision::Skip => {
                    debug!(doc = %doc, stage = %stage.name, "already done, skipping");
                    prior.insert(stage.name, recorded_output(doc, &record, stage.name));
                    self.finish_stage(doc, stage.name, StageOutcome::Skipped, outcomes);
                    continue;
                }
                SkipDecision::Blocked { missing } => {
                    info!(doc = %doc, stage = %stage.name, missing = %missing, "stage blocked");
                    self.finish_stage(doc, stage.name, StageOutcome::Blocked { missing }, outcomes);
                    state = LaneState::Blocked {
                        stage: stage.name,
                        missing,
                    };
                    break;
                }
                SkipDecision::Execute => {}
            }

            self.observer.stage_started(doc, stage.name);
            debug!(doc = %doc, stage = %stage.name, "executing stage");
            let input = StageInput {
                stage: stage.name,
                document: doc,
                prior: &prior,
                options: &stage.options,
            };
            let result = self.execute(stage, input).await;

            let committed = match result {
                Ok(output) => self
                    .commit(doc, &mut record, stage.name, output)
                    .map_err(|e| (e.to_string(), true)),
                Err(e) => Err((e.to_string(), e.is_retryable())),
            };

            match committed {
                Ok(output) => {
                    unsaved = false;
                    prior.insert(stage.name, output);
                    self.finish_stage(doc, stage.name, StageOutcome::Executed, outcomes);
                }
                Err((error, retryable)) => {
                    warn!(doc = %doc, stage = %stage.name, error = %error, retryable, "stage failed");
                    self.finish_stage(
                        doc,
                        stage.name,
                        StageOutcome::Failed {
                            error: error.clone(),
                        },
                        outcomes,
                    );
                    state = LaneState::Failed {
                        stage: Some(stage.name),
                        error,
                    };
                    break;
                }
            }
        }

        if unsaved {
            if let Err(e) = self.store.save(doc, &record) {
                warn!(doc = %doc, error = %e, "could not persist reset fingerprint");
            }
        }
        state
    }

    fn finish_stage(
        &self,
        doc: &Document,
        stage: StageName,
        outcome: StageOutcome,
        outcomes: &mut Vec<(StageName, StageOutcome)>,
    ) {
        self.observer.stage_finished(doc, stage, &outcome);
        outcomes.push((stage, outcome));
    }

    async fn execute(
        &self,
        stage: &Stage,
        input: StageInput<'_>,
    ) -> std::result::Result<StageOutput, StageError> {
        match stage.timeout.or(self.stage_timeout) {
            Some(limit) => tokio::time::timeout(limit, stage.executor.execute(input))
                .await
                .unwrap_or_else(|_| Err(StageError::Timeout(limit))),
            None => stage.executor.execute(input).await,
        }
    }

    /// Reject artifact names that another lane or the fingerprint store owns,
    /// or that discovery would pick up as a new source.
    fn check_artifact(&self, doc: &Document, suffix: &str, path: &Path) -> Result<()> {
        if suffix.is_empty() {
            return Err(rejected_artifact(path, "empty artifact suffix"));
        }
        if suffix.contains(['/', '\\']) {
            return Err(rejected_artifact(path, "artifact suffix contains a path separator"));
        }
        if FingerprintStore::is_sidecar(path) || suffix.ends_with(".corrupt") {
            return Err(rejected_artifact(path, "artifact collides with fingerprint bookkeeping"));
        }

        let name = format!("{}{}", doc.file_name(), suffix);
        if !is_generated_artifact(&name) {
            return Err(rejected_artifact(
                path,
                "artifact name would be discovered as a source document",
            ));
        }

        // `<file name><suffix>` belongs to the longest document name it extends.
        let own = doc.file_name();
        let parent = doc.path.parent();
        let foreign = self.documents.iter().find(|other| {
            other.path != doc.path
                && other.path.parent() == parent
                && other.file_name().len() > own.len()
                && name.starts_with(&other.file_name())
        });
        if let Some(other) = foreign {
            warn!(doc = %doc, owner = %other, artifact = %name, "artifact belongs to another document");
            return Err(rejected_artifact(path, "artifact name belongs to another document"));
        }
        Ok(())
    }

    /// Persist a successful stage: artifacts first, then the updated record.
    ///
    /// `record` is only updated once the sidecar write succeeded.
    fn commit(
        &self,
        doc: &Document,
        record: &mut FingerprintRecord,
        stage: StageName,
        output: StageOutput,
    ) -> Result<PriorOutput> {
        // Every artifact is checked before the first one is written.
        let mut names = Vec::with_capacity(output.artifacts.len());
        let mut paths = Vec::with_capacity(output.artifacts.len());
        for artifact in &output.artifacts {
            let path = doc.sibling(&artifact.suffix);
            self.check_artifact(doc, &artifact.suffix, &path)?;
            names.push(format!("{}{}", doc.file_name(), artifact.suffix));
            paths.push(path);
        }

        for (artifact, path) in output.artifacts.iter().zip(&paths) {
            write_atomic(path, &artifact.contents)?;
            debug!(doc = %doc, artifact = %path.display(), bytes = artifact.contents.len(), "artifact written");
        }

        let mut updated = record.clone();
        updated.complete_step(stage, names, output.result.clone());
        self.store.save(doc, &updated)?;
        *record = updated;

        Ok(PriorOutput {
            artifacts: paths,
            result: output.result,
        })
    }
}

fn rejected_artifact(path: &Path, msg: &str) -> DocPipeError {
    DocPipeError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string()),
    )
}

/// Rebuild a completed stage's outputs from what the sidecar recorded.
fn recorded_output(doc: &Document, record: &FingerprintRecord, stage: StageName) -> PriorOutput {
    PriorOutput {
        artifacts: record
            .outputs(stage)
            .into_iter()
            .map(|name| doc.path.with_file_name(name))
            .collect(),
        result: record.result(stage).cloned().unwrap_or(Value::Null),
    }
}
