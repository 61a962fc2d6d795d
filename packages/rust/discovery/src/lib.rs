//! Source document discovery.
//!
//! Walks a root directory, keeps files whose extension the pipeline
//! recognizes, drops anything the pipeline generated itself (sidecars,
//! conversion outputs, temp files), and returns a stable, lexicographically
//! ordered document list so that runs and logs are reproducible.

mod filter;

use std::path::Path;

use docpipe_shared::{DocPipeError, Document, PipelineConfig, Result};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

pub use filter::is_generated_artifact;

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for the discovery walk.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Extensions (with leading dot) treated as sources.
    pub source_extensions: Vec<String>,
    /// Root-relative glob patterns to exclude.
    pub exclude_patterns: Vec<String>,
    /// Whether to descend into dot-prefixed directories.
    pub include_hidden: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for DiscoveryOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            source_extensions: config.source_extensions.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
            include_hidden: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Discover source documents under `root`.
///
/// If `root` is a single file it is returned on its own when it qualifies.
/// Unreadable directory entries are logged and skipped.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn discover(root: &Path, opts: &DiscoveryOptions) -> Result<Vec<Document>> {
    let meta = std::fs::metadata(root).map_err(|e| DocPipeError::io(root, e))?;

    let excludes: Vec<regex::Regex> = opts
        .exclude_patterns
        .iter()
        .filter_map(|p| {
            let re = filter::glob_to_regex(p);
            if re.is_none() {
                warn!(pattern = %p, "ignoring invalid exclude pattern");
            }
            re
        })
        .collect();

    if meta.is_file() {
        let base = root.parent().unwrap_or(Path::new(""));
        let doc = Document::new(base, root);
        return Ok(accept(&doc, opts, &excludes).then_some(doc).into_iter().collect());
    }

    let mut documents = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || opts.include_hidden || !filter::is_hidden(e.path()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let doc = Document::new(root, entry.path());
        if accept(&doc, opts, &excludes) {
            documents.push(doc);
        } else {
            debug!(path = %doc.rel_path, "not a pipeline source");
        }
    }

    documents.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    info!(documents = documents.len(), "discovery complete");
    Ok(documents)
}

fn accept(doc: &Document, opts: &DiscoveryOptions, excludes: &[regex::Regex]) -> bool {
    filter::has_source_extension(&doc.path, &opts.source_extensions)
        && !filter::is_generated_artifact(&doc.rel_path)
        && !excludes.iter().any(|re| re.is_match(&doc.rel_path))
}
