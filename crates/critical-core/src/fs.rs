//! File writes and the scratch directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::COMBINED_FILE_NAME;
use crate::error::Result;
use crate::model::CriticalFragment;

/// Replace `path` with `contents` in one step.
///
/// The data goes to a temp file in the same directory which is then renamed
/// over the target, so readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Directory holding per-combination fragments and the combined stylesheet.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    pub fn combined_path(&self) -> PathBuf {
        self.path.join(COMBINED_FILE_NAME)
    }

    pub fn write_fragment(&self, fragment: &CriticalFragment) -> Result<PathBuf> {
        let path = self.path.join(fragment.file_name());
        write_atomic(&path, fragment.css.as_bytes())?;
        Ok(path)
    }

    pub fn write_combined(&self, css: &str) -> Result<PathBuf> {
        let path = self.combined_path();
        write_atomic(&path, css.as_bytes())?;
        Ok(path)
    }

    /// Fragment files (`*.css`, not hidden, not the combined file) sorted by
    /// name. A missing directory has no fragments.
    pub fn fragment_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".css")
                && name != COMBINED_FILE_NAME
                && !name.starts_with('.')
                && entry.file_type()?.is_file()
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Remove everything inside the directory, keeping the directory itself.
    /// Returns the number of entries removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    debug!(path = %path.display(), "removed scratch entry");
                    removed += 1;
                }
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove scratch entry"),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Route, Viewport};

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/index.html");
        write_atomic(&path, b"<html>old</html>").unwrap();
        write_atomic(&path, b"<html>new</html>").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "<html>new</html>");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_fragment_files_skip_combined_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(dir.path().join("critical"));
        scratch.ensure().unwrap();

        let fragment = CriticalFragment::new(
            &Route::new("/about"),
            &Viewport::new("mobile", 375, 667),
            ".a{color:red}".into(),
        );
        scratch.write_fragment(&fragment).unwrap();
        scratch.write_combined(".a{color:red}").unwrap();
        fs::write(scratch.path().join(".hidden.css"), "x").unwrap();
        fs::write(scratch.path().join("notes.txt"), "x").unwrap();

        let files = scratch.fragment_files().unwrap();
        assert_eq!(files, vec![scratch.path().join("about-mobile.css")]);

        assert_eq!(scratch.clear().unwrap(), 4);
        assert!(scratch.path().is_dir());
        assert!(scratch.fragment_files().unwrap().is_empty());
    }

    #[test]
    fn test_missing_scratch_dir_is_empty() {
        let scratch = ScratchDir::new("/nonexistent/critical-scratch");
        assert!(scratch.fragment_files().unwrap().is_empty());
        assert_eq!(scratch.clear().unwrap(), 0);
    }
}
