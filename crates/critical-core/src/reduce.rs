//! Removing inlined rules from the built stylesheets.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::fs::write_atomic;

/// Outcome of reducing one stylesheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReducedStylesheet {
    pub path: PathBuf,
    pub original_bytes: usize,
    pub reduced_bytes: usize,
    pub removed_rules: usize,
    pub kept_interactive: usize,
}

/// Remove the non-interactive rules of `critical_css` from the stylesheet at
/// `path`, rewriting it atomically. Returns the resulting byte size.
pub fn reduce_file(path: &Path, critical_css: &str, min_rule_len: usize) -> Result<ReducedStylesheet> {
    let reduction_error = |reason: String| PipelineError::Reduction {
        path: path.to_path_buf(),
        reason,
    };

    let original = fs::read_to_string(path).map_err(|err| reduction_error(err.to_string()))?;
    let reduction = critical_css::reduce_stylesheet(&original, critical_css, min_rule_len);

    if reduction.removed > 0 {
        write_atomic(path, reduction.css.as_bytes())
            .map_err(|err| reduction_error(err.to_string()))?;
    }

    info!(
        path = %path.display(),
        original_bytes = original.len(),
        reduced_bytes = reduction.css.len(),
        removed = reduction.removed,
        kept_interactive = reduction.kept_interactive,
        "reduced stylesheet"
    );

    Ok(ReducedStylesheet {
        path: path.to_path_buf(),
        original_bytes: original.len(),
        reduced_bytes: reduction.css.len(),
        removed_rules: reduction.removed,
        kept_interactive: reduction.kept_interactive,
    })
}

/// Reduce every stylesheet, stopping at the first failure.
pub fn reduce_all(paths: &[PathBuf], critical_css: &str, min_rule_len: usize) -> Result<Vec<ReducedStylesheet>> {
    paths
        .iter()
        .map(|path| reduce_file(path, critical_css, min_rule_len))
        .collect()
}
