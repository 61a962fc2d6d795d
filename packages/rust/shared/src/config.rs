//! Application configuration for docpipe.
//!
//! User config lives at `~/.docpipe/docpipe.toml`.
//! CLI flags replace config file values, which replace defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DocPipeError, Result};
use crate::types::StageName;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docpipe";

// ---------------------------------------------------------------------------
// Config structs (matching docpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduler and discovery settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// External executor bindings keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageCommandConfig>,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent document lanes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Stop dispatching new documents after the first failure.
    #[serde(default)]
    pub fail_fast: bool,

    /// Re-run stages even when already recorded as done.
    #[serde(default)]
    pub force: bool,

    /// Default per-stage timeout in seconds (0 disables).
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// File extensions treated as pipeline sources (with leading dot).
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,

    /// Root-relative glob patterns excluded from discovery.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fail_fast: false,
            force: false,
            stage_timeout_secs: default_stage_timeout(),
            source_extensions: default_source_extensions(),
            exclude_patterns: Vec::new(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_stage_timeout() -> u64 {
    600
}
fn default_source_extensions() -> Vec<String> {
    [
        ".pdf", ".docx", ".pptx", ".png", ".jpg", ".jpeg", ".gif", ".tif", ".tiff", ".bmp",
        ".webp", ".svg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// `[stages.<name>]` section: how to invoke the external executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCommandConfig {
    /// Program to spawn for each work item.
    pub command: String,

    /// Arguments passed before the request is written to stdin.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the subprocess (defaults to the caller's).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Per-stage timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Free-form options forwarded to the executor with every request.
    #[serde(default)]
    pub options: toml::Table,
}

impl AppConfig {
    /// Timeout in seconds for `stage`, honoring per-stage overrides.
    /// `None` means no timeout.
    pub fn stage_timeout_secs(&self, stage: StageName) -> Option<u64> {
        let secs = self
            .stages
            .get(&stage)
            .and_then(|s| s.timeout_secs)
            .unwrap_or(self.pipeline.stage_timeout_secs);
        (secs > 0).then_some(secs)
    }

    /// Check values that would otherwise fail later in a confusing way.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(DocPipeError::config("pipeline.workers must be at least 1"));
        }
        for ext in &self.pipeline.source_extensions {
            if !ext.starts_with('.') {
                return Err(DocPipeError::config(format!(
                    "source extension '{ext}' must start with '.'"
                )));
            }
        }
        for (stage, cmd) in &self.stages {
            if cmd.command.trim().is_empty() {
                return Err(DocPipeError::config(format!(
                    "stages.{stage}.command must not be empty"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocPipeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docpipe/docpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocPipeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DocPipeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocPipeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocPipeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocPipeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
