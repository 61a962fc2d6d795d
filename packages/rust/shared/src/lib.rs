//! Shared types, error model, and configuration for docpipe.
//!
//! Every other docpipe crate builds on this one. Contents:
//! - [`DocPipeError`] for run-level failures, [`StageError`] for per-stage ones
//! - the [`Document`] handle and the closed [`StageName`] chain
//! - [`AppConfig`] loading from `~/.docpipe/docpipe.toml`

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, PipelineConfig, StageCommandConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{DocPipeError, Result, StageError};
pub use types::{CONVERTED_MARKER, Document, SIDECAR_SUFFIX, StageName};
