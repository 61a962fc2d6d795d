//! The per-document fingerprint record persisted in each sidecar.

use std::collections::BTreeMap;

use chrono::Utc;
use docpipe_shared::StageName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `extra` key holding artifact file names per stage.
const OUTPUTS_KEY: &str = "outputs";
/// `extra` key holding the executor's structured result per stage.
const RESULTS_KEY: &str = "results";
/// `extra` key holding RFC 3339 completion timestamps per stage.
const COMPLETED_AT_KEY: &str = "completed_at";

/// Content hash plus completed-stage flags for one document.
///
/// Serialized as
/// `{"hash": "<hex>", "steps": {"convert": true, ...}, "extra": {...}}`.
/// Step keys are plain strings so that records written by other tools with
/// extra stage names survive a load/save cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Hex digest of the document bytes when the flags were recorded.
    #[serde(default)]
    pub hash: String,
    /// Completed-stage flags keyed by stage name.
    #[serde(default)]
    pub steps: BTreeMap<String, bool>,
    /// Free-form metadata (outputs, results, timestamps).
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl FingerprintRecord {
    /// Whether `stage` is recorded as complete.
    pub fn is_step_done(&self, stage: StageName) -> bool {
        self.steps.get(stage.as_str()).copied().unwrap_or(false)
    }

    /// Set the flag for `stage`.
    ///
    /// Clearing a flag also clears every later stage in the canonical chain so
    /// that no stage stays done while its predecessor is not.
    pub fn mark_step(&mut self, stage: StageName, done: bool) {
        self.steps.insert(stage.as_str().to_string(), done);
        if !done {
            self.clear_after(stage);
        }
    }

    /// Mark `stage` done with freshly produced outputs.
    ///
    /// Later stages consumed the previous outputs, so their flags are cleared
    /// and they run again on the next pass that enables them.
    pub fn complete_step(&mut self, stage: StageName, outputs: Vec<String>, result: Value) {
        self.mark_step(stage, true);
        self.clear_after(stage);
        self.record_completion(stage, outputs, result);
    }

    fn clear_after(&mut self, stage: StageName) {
        for later in StageName::ALL.into_iter().filter(|s| *s > stage) {
            if let Some(flag) = self.steps.get_mut(later.as_str()) {
                *flag = false;
            }
        }
    }

    /// Reconcile the record with the document's current `hash`.
    ///
    /// On mismatch every step flag and all `extra` metadata are cleared and
    /// the new hash is adopted. Returns whether anything was invalidated.
    pub fn invalidate(&mut self, hash: &str) -> bool {
        if self.hash == hash {
            return false;
        }
        self.hash = hash.to_string();
        self.steps.clear();
        self.extra.clear();
        true
    }

    /// Stages from the canonical chain currently marked done.
    pub fn completed_stages(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|s| self.is_step_done(*s))
            .collect()
    }

    /// Whether some stage is done while its canonical predecessor is not.
    pub fn has_chain_gap(&self) -> bool {
        StageName::ALL.into_iter().any(|s| {
            self.is_step_done(s)
                && s.canonical_predecessor()
                    .is_some_and(|pred| !self.is_step_done(pred))
        })
    }

    /// Remember what a successful stage produced.
    pub fn record_completion(&mut self, stage: StageName, outputs: Vec<String>, result: Value) {
        let outputs = Value::Array(outputs.into_iter().map(Value::String).collect());
        self.set_in_section(OUTPUTS_KEY, stage, outputs);
        self.set_in_section(RESULTS_KEY, stage, result);
        self.set_in_section(COMPLETED_AT_KEY, stage, Value::String(Utc::now().to_rfc3339()));
    }

    /// Artifact file names recorded for `stage`.
    pub fn outputs(&self, stage: StageName) -> Vec<String> {
        self.section_entry(OUTPUTS_KEY, stage)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Structured executor result recorded for `stage`.
    pub fn result(&self, stage: StageName) -> Option<&Value> {
        self.section_entry(RESULTS_KEY, stage)
    }

    /// Completion timestamp recorded for `stage`.
    pub fn completed_at(&self, stage: StageName) -> Option<&str> {
        self.section_entry(COMPLETED_AT_KEY, stage)
            .and_then(Value::as_str)
    }

    fn section_entry(&self, key: &str, stage: StageName) -> Option<&Value> {
        self.extra
            .get(key)
            .and_then(Value::as_object)
            .and_then(|m| m.get(stage.as_str()))
    }

    fn set_in_section(&mut self, key: &str, stage: StageName, value: Value) {
        let mut section = match self.extra.remove(key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        section.insert(stage.as_str().to_string(), value);
        self.extra.insert(key.to_string(), Value::Object(section));
    }
}
