//! Stage registry: the ordered, validated chain of stages for a run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use docpipe_shared::{DocPipeError, Result, StageName};

use crate::executor::StageExecutor;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One registered stage.
#[derive(Clone)]
pub struct Stage {
    pub name: StageName,
    /// The stage that must be complete before this one may run.
    pub predecessor: Option<StageName>,
    pub executor: Arc<dyn StageExecutor>,
    /// Passed to the executor untouched.
    pub options: Value,
    /// Overrides the run-wide stage timeout when set.
    pub timeout: Option<Duration>,
}

impl Stage {
    pub fn new(
        name: StageName,
        predecessor: Option<StageName>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            name,
            predecessor,
            executor,
            options: Value::Object(Default::default()),
            timeout: None,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("predecessor", &self.predecessor)
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stage selection
// ---------------------------------------------------------------------------

/// Which registered stages a run should consider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSelection {
    /// Restrict to these stages; `None` means all registered stages.
    pub enabled: Option<Vec<StageName>>,
    /// Drop every stage before this one.
    pub resume_from: Option<StageName>,
    /// Drop these stages.
    pub skip: BTreeSet<StageName>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The validated, linearly ordered stage chain.
///
/// Invariants: at least one stage; unique names; the first stage has no
/// predecessor; every later stage's predecessor is the stage right before it.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<Stage>,
}

impl StageRegistry {
    /// Validate `stages` and build the registry.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(DocPipeError::config("stage registry is empty"));
        }

        let mut seen = BTreeSet::new();
        let mut previous: Option<StageName> = None;
        for stage in &stages {
            if !seen.insert(stage.name) {
                return Err(DocPipeError::config(format!(
                    "stage '{}' is registered more than once",
                    stage.name
                )));
            }
            match (previous, stage.predecessor) {
                (None, Some(pred)) => {
                    return Err(DocPipeError::config(format!(
                        "first stage '{}' declares predecessor '{pred}'",
                        stage.name
                    )));
                }
                (Some(prev), pred) if pred != Some(prev) => {
                    let declared = pred.map_or_else(|| "none".to_string(), |p| p.to_string());
                    return Err(DocPipeError::config(format!(
                        "stage '{}' must follow '{prev}' but declares predecessor '{declared}'",
                        stage.name
                    )));
                }
                _ => {}
            }
            previous = Some(stage.name);
        }

        Ok(Self { stages })
    }

    /// Build the canonical `convert → validate → analyze → embed` chain.
    ///
    /// `bindings` must cover a prefix of the canonical order: binding a stage
    /// without its predecessor is a configuration error. Bound stages pick
    /// up the options and timeouts given in `settings`.
    pub fn standard(
        bindings: BTreeMap<StageName, Arc<dyn StageExecutor>>,
        settings: &BTreeMap<StageName, (Value, Option<Duration>)>,
    ) -> Result<Self> {
        if bindings.is_empty() {
            return Err(DocPipeError::config(
                "no stage executors configured (expected at least 'convert')",
            ));
        }

        let mut stages = Vec::new();
        for name in StageName::ALL {
            match bindings.get(&name) {
                Some(executor) => {
                    let mut stage =
                        Stage::new(name, name.canonical_predecessor(), Arc::clone(executor));
                    if let Some((options, timeout)) = settings.get(&name) {
                        stage = stage.with_options(options.clone()).with_timeout(*timeout);
                    }
                    stages.push(stage);
                }
                None => {
                    if let Some(orphan) = bindings.keys().find(|bound| **bound > name) {
                        return Err(DocPipeError::config(format!(
                            "stage '{orphan}' is configured but its prerequisite '{name}' has no executor"
                        )));
                    }
                    break;
                }
            }
        }

        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name).collect()
    }

    fn require(&self, name: StageName, role: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                DocPipeError::config(format!(
                    "{role} stage '{name}' is not registered (registered: {})",
                    self.names()
                        .iter()
                        .map(|n| n.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Resolve a selection into the enabled stages, in registry order.
    ///
    /// Every name in the selection must be registered.
    pub fn select(&self, selection: &StageSelection) -> Result<Vec<StageName>> {
        let start = match selection.resume_from {
            Some(name) => self.require(name, "resume-from")?,
            None => 0,
        };
        for name in &selection.skip {
            self.require(*name, "skipped")?;
        }
        let allowed = match &selection.enabled {
            Some(enabled) => {
                let mut set = BTreeSet::new();
                for name in enabled {
                    self.require(*name, "enabled")?;
                    set.insert(*name);
                }
                Some(set)
            }
            None => None,
        };

        Ok(self.stages[start..]
            .iter()
            .map(|s| s.name)
            .filter(|name| !selection.skip.contains(name))
            .filter(|name| allowed.as_ref().is_none_or(|set| set.contains(name)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;

    fn exec() -> Arc<dyn StageExecutor> {
        Arc::new(ScriptedExecutor::new())
    }

    fn full_chain() -> StageRegistry {
        let bindings = StageName::ALL.into_iter().map(|s| (s, exec())).collect();
        StageRegistry::standard(bindings, &BTreeMap::new()).unwrap()
    }

    fn config_message(err: DocPipeError) -> String {
        match err {
            DocPipeError::Config { message } => message,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn valid_chain_is_accepted() {
        let registry = StageRegistry::new(vec![
            Stage::new(StageName::Convert, None, exec()),
            Stage::new(StageName::Validate, Some(StageName::Convert), exec()),
        ])
        .unwrap();
        assert_eq!(registry.names(), vec![StageName::Convert, StageName::Validate]);
    }

    #[test]
    fn empty_registry_is_rejected() {
        let msg = config_message(StageRegistry::new(Vec::new()).unwrap_err());
        assert!(msg.contains("empty"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = StageRegistry::new(vec![
            Stage::new(StageName::Convert, None, exec()),
            Stage::new(StageName::Convert, Some(StageName::Convert), exec()),
        ])
        .unwrap_err();
        assert!(config_message(err).contains("more than once"));
    }

    #[test]
    fn first_stage_may_not_have_predecessor() {
        let err = StageRegistry::new(vec![Stage::new(
            StageName::Validate,
            Some(StageName::Convert),
            exec(),
        )])
        .unwrap_err();
        assert!(config_message(err).contains("first stage"));
    }

    #[test]
    fn predecessor_must_be_previous_stage() {
        let err = StageRegistry::new(vec![
            Stage::new(StageName::Convert, None, exec()),
            Stage::new(StageName::Validate, Some(StageName::Convert), exec()),
            Stage::new(StageName::Analyze, Some(StageName::Convert), exec()),
        ])
        .unwrap_err();
        assert!(config_message(err).contains("must follow 'validate'"));

        let err = StageRegistry::new(vec![
            Stage::new(StageName::Convert, None, exec()),
            Stage::new(StageName::Validate, None, exec()),
        ])
        .unwrap_err();
        assert!(config_message(err).contains("predecessor 'none'"));
    }

    #[test]
    fn standard_chain_uses_canonical_order() {
        let registry = full_chain();
        assert_eq!(registry.names(), StageName::ALL.to_vec());
        for stage in registry.stages() {
            assert_eq!(stage.predecessor, stage.name.canonical_predecessor());
        }
    }

    #[test]
    fn standard_chain_accepts_a_prefix() {
        let bindings = [StageName::Convert, StageName::Validate]
            .into_iter()
            .map(|s| (s, exec()))
            .collect();
        let registry = StageRegistry::standard(bindings, &BTreeMap::new()).unwrap();
        assert_eq!(registry.names(), vec![StageName::Convert, StageName::Validate]);
    }

    #[test]
    fn standard_chain_rejects_missing_binding() {
        let bindings = [StageName::Convert, StageName::Analyze]
            .into_iter()
            .map(|s| (s, exec()))
            .collect();
        let err = StageRegistry::standard(bindings, &BTreeMap::new()).unwrap_err();
        let msg = config_message(err);
        assert!(msg.contains("'analyze'"));
        assert!(msg.contains("'validate'"));

        let err = StageRegistry::standard(BTreeMap::new(), &BTreeMap::new()).unwrap_err();
        assert!(config_message(err).contains("no stage executors"));
    }

    #[test]
    fn standard_chain_applies_settings() {
        let bindings = [(StageName::Convert, exec())].into_iter().collect();
        let settings = [(
            StageName::Convert,
            (serde_json::json!({"format": "markdown"}), Some(Duration::from_secs(5))),
        )]
        .into_iter()
        .collect();
        let registry = StageRegistry::standard(bindings, &settings).unwrap();
        let convert = &registry.stages()[0];
        assert_eq!(convert.name, StageName::Convert);
        assert_eq!(convert.options["format"], "markdown");
        assert_eq!(convert.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn selection_defaults_to_everything() {
        let registry = full_chain();
        let enabled = registry.select(&StageSelection::default()).unwrap();
        assert_eq!(enabled, StageName::ALL.to_vec());
    }

    #[test]
    fn selection_applies_resume_and_skip() {
        let registry = full_chain();
        let selection = StageSelection {
            resume_from: Some(StageName::Validate),
            skip: [StageName::Analyze].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(
            registry.select(&selection).unwrap(),
            vec![StageName::Validate, StageName::Embed]
        );
    }

    #[test]
    fn selection_applies_enabled_list_in_registry_order() {
        let registry = full_chain();
        let selection = StageSelection {
            enabled: Some(vec![StageName::Embed, StageName::Convert]),
            ..Default::default()
        };
        assert_eq!(
            registry.select(&selection).unwrap(),
            vec![StageName::Convert, StageName::Embed]
        );
    }

    #[test]
    fn selection_rejects_unregistered_names() {
        let bindings = [StageName::Convert, StageName::Validate]
            .into_iter()
            .map(|s| (s, exec()))
            .collect();
        let registry = StageRegistry::standard(bindings, &BTreeMap::new()).unwrap();

        let selection = StageSelection {
            resume_from: Some(StageName::Embed),
            ..Default::default()
        };
        let msg = config_message(registry.select(&selection).unwrap_err());
        assert!(msg.contains("resume-from stage 'embed'"));

        let selection = StageSelection {
            skip: [StageName::Analyze].into_iter().collect(),
            ..Default::default()
        };
        assert!(registry.select(&selection).is_err());
    }
}
