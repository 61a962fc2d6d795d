//! Path filters deciding which files under the root are pipeline sources.

use std::path::Path;

use docpipe_shared::{CONVERTED_MARKER, SIDECAR_SUFFIX};

/// Name suffixes of files the pipeline writes itself.
const GENERATED_SUFFIXES: &[&str] = &[SIDECAR_SUFFIX, ".analysis.json", ".corrupt"];

/// Marker inside the names of in-flight atomic writes.
const TEMP_MARKER: &str = ".tmp-";

/// Whether `rel_path` (root-relative, `/`-separated) names a file produced by
/// the pipeline rather than a source document.
pub fn is_generated_artifact(rel_path: &str) -> bool {
    if rel_path
        .split('/')
        .any(|part| part.contains(CONVERTED_MARKER))
    {
        return true;
    }

    let name = rel_path
        .rsplit('/')
        .next()
        .unwrap_or(rel_path)
        .to_ascii_lowercase();

    name.contains(TEMP_MARKER) || GENERATED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Whether the path's final component is hidden (dot-prefixed).
pub(crate) fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.starts_with('.') && s != "." && s != "..")
        .unwrap_or(false)
}

/// Whether the file's extension is one of `extensions` (case-insensitive,
/// each with a leading dot).
pub(crate) fn has_source_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let dotted = format!(".{}", ext.to_ascii_lowercase());
    extensions
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(&dotted))
}

/// Convert a glob-like pattern to an anchored regex.
///
/// `**` matches across directories, `*` within one path segment, `?` one
/// character.
pub(crate) fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}
