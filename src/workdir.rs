//! Private working directories for boxed execution.
//!
//! Each boxed execution owns exactly one freshly created directory for its
//! whole lifetime. The directory is removed when the [`WorkDir`] is dropped,
//! so teardown happens regardless of how the execution ends.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::boxed::path::BoxedPath;
use crate::error::Result;

pub struct WorkDir {
    dir: TempDir,
}

impl WorkDir {
    /// Create a fresh private directory, under `base` when one is configured.
    pub fn create(base: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("runbox-");
        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created working directory");
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute location for a boxed path, with its parent directories
    /// created so the file can be written immediately.
    pub fn prepare(&self, path: &BoxedPath) -> Result<PathBuf> {
        let absolute = path.under(self.root());
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(absolute)
    }

    /// Remove the directory now instead of at drop, surfacing any error.
    pub fn teardown(self) -> Result<()> {
        let path = self.dir.path().display().to_string();
        self.dir.close()?;
        debug!(path = %path, "Removed working directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_parent_directories() {
        let workdir = WorkDir::create(None).unwrap();
        let path = BoxedPath::new("a/b/c.txt").unwrap();
        let absolute = workdir.prepare(&path).unwrap();
        assert!(absolute.parent().unwrap().is_dir());
        assert!(absolute.starts_with(workdir.root()));
    }

    #[test]
    fn teardown_removes_the_directory() {
        let workdir = WorkDir::create(None).unwrap();
        let root = workdir.root().to_path_buf();
        std::fs::write(root.join("stray.txt"), b"x").unwrap();
        workdir.teardown().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn directories_are_never_shared() {
        let first = WorkDir::create(None).unwrap();
        let second = WorkDir::create(None).unwrap();
        assert_ne!(first.root(), second.root());
    }
}
