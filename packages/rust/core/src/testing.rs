//! Scriptable in-process executor for scheduler tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use docpipe_shared::{StageError, StageName};

use crate::executor::{Artifact, PriorOutputs, StageExecutor, StageInput, StageOutput};

/// One recorded executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub doc: String,
    pub stage: StageName,
}

/// Records calls, fails on demand, and tracks how many calls overlap.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<(String, StageName), StageError>>,
    priors: Mutex<Vec<(String, StageName, PriorOutputs)>>,
    delay: Option<Duration>,
    panic_on: Option<(String, StageName)>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn panicking_on(mut self, doc: &str, stage: StageName) -> Self {
        self.panic_on = Some((doc.to_string(), stage));
        self
    }

    pub fn fail(&self, doc: &str, stage: StageName, error: StageError) {
        self.failures
            .lock()
            .unwrap()
            .insert((doc.to_string(), stage), error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn calls_for(&self, doc: &str) -> Vec<StageName> {
        self.calls()
            .into_iter()
            .filter(|c| c.doc == doc)
            .map(|c| c.stage)
            .collect()
    }

    /// Prior outputs seen by the most recent call for `(doc, stage)`.
    pub fn prior_seen(&self, doc: &str, stage: StageName) -> Option<PriorOutputs> {
        self.priors
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(d, s, _)| d == doc && *s == stage)
            .map(|(_, _, p)| p.clone())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Artifact suffix written by each stage, if any.
pub fn artifact_suffix(stage: StageName) -> Option<&'static str> {
    match stage {
        StageName::Convert => Some(".converted.md"),
        StageName::Analyze => Some(".analysis.json"),
        StageName::Validate | StageName::Embed => None,
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, input: StageInput<'_>) -> Result<StageOutput, StageError> {
        let doc = input.document.rel_path.clone();
        self.calls.lock().unwrap().push(Call {
            doc: doc.clone(),
            stage: input.stage,
        });
        self.priors
            .lock()
            .unwrap()
            .push((doc.clone(), input.stage, input.prior.clone()));

        if self.panic_on.as_ref() == Some(&(doc.clone(), input.stage)) {
            panic!("scripted panic for {doc}");
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get(&(doc.clone(), input.stage))
            .cloned();
        if let Some(err) = failure {
            return Err(err);
        }

        let mut output = StageOutput::result(json!({"stage": input.stage, "doc": doc}));
        if let Some(suffix) = artifact_suffix(input.stage) {
            output = output.with_artifact(Artifact::new(
                suffix,
                format!("{} of {doc}", input.stage),
            ));
        }
        Ok(output)
    }
}

/// A scratch source tree with the given files (relative path, contents).
pub fn scratch_tree(tag: &str, files: &[(&str, &str)]) -> PathBuf {
    let root = std::env::temp_dir().join(format!("docpipe-{tag}-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&root).unwrap();
    for (rel, contents) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    root
}

/// Parsed sidecars under `root`, keyed by the source's relative path.
pub fn sidecars(root: &Path, docs: &[&str]) -> BTreeMap<String, docpipe_fingerprint::FingerprintRecord> {
    let store = docpipe_fingerprint::FingerprintStore::new();
    docs.iter()
        .filter_map(|rel| {
            let doc = docpipe_shared::Document::new(root, root.join(rel));
            store
                .try_load(&doc)
                .unwrap()
                .map(|record| (rel.to_string(), record))
        })
        .collect()
}
