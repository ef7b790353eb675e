//! Locating build artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::model::Route;

/// Non-empty `.css` files directly under `assets_dir`, sorted by file name.
///
/// The first entry is treated as the main stylesheet. A missing directory
/// yields an empty list.
pub fn discover_stylesheets(assets_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(assets_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %assets_dir.display(), "assets directory not found");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let mut stylesheets = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || path.extension().map_or(true, |ext| ext != "css") {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            debug!(path = %path.display(), "skipping empty stylesheet");
            continue;
        }
        debug!(path = %path.display(), bytes = text.len(), "found stylesheet");
        stylesheets.push(path);
    }
    stylesheets.sort();
    Ok(stylesheets)
}

/// Built HTML document for `route` under `dist_dir`.
pub fn html_path(dist_dir: &Path, route: &Route) -> PathBuf {
    dist_dir.join(route.html_file())
}
