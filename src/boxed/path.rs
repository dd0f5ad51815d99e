//! Boxed-relative path normalization.
//!
//! Every file a boxed command reads or writes is named by a path relative to
//! the private working directory. These paths arrive from untrusted callers
//! (directly, or through the wire protocol), so this is the injection
//! boundary between the caller and the filesystem: anything that could
//! resolve outside the working directory is rejected before any file I/O.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunboxError};

/// Device names Windows resolves even when a path has an extension.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// A normalized path known to resolve underneath the working directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoxedPath(String);

impl BoxedPath {
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref();
        let reject = |reason: &str| {
            Err(RunboxError::BadBoxedPath {
                path: path.to_string(),
                reason: reason.to_string(),
            })
        };

        if path.is_empty() {
            return reject("empty path");
        }
        if path.starts_with('/') {
            return reject("absolute path");
        }
        if path.contains('\\') {
            return reject("backslash separator");
        }
        if path.contains(':') {
            return reject("drive or stream separator");
        }
        if path.chars().any(|c| c.is_control()) {
            return reject("control character");
        }

        for component in path.split('/') {
            if component.is_empty() {
                return reject("empty component");
            }
            if component == "." || component == ".." {
                return reject("directory traversal");
            }
            let stem = component
                .split_once('.')
                .map_or(component, |(stem, _)| stem)
                .to_ascii_lowercase();
            if RESERVED_NAMES.contains(&stem.as_str()) {
                return reject("reserved device name");
            }
        }

        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path resolved under `base`.
    pub fn under(&self, base: &Path) -> PathBuf {
        base.join(&self.0)
    }

    /// The directory part of the path, if any ("a/b/c.txt" -> "a/b").
    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(dir, _)| dir)
    }

    /// The final component ("a/b/c.txt" -> "c.txt").
    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(&self.0, |(_, name)| name)
    }
}

impl fmt::Display for BoxedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BoxedPath {
    type Error = RunboxError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BoxedPath> for String {
    fn from(value: BoxedPath) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_nested_paths_pass() {
        assert!(BoxedPath::new("in.txt").is_ok());
        assert!(BoxedPath::new("sub/dir/out.png").is_ok());
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(BoxedPath::new("../etc/passwd").is_err());
        assert!(BoxedPath::new("a/../../b").is_err());
        assert!(BoxedPath::new("a/./b").is_err());
    }

    #[test]
    fn absolute_paths_are_rejected() {
        assert!(BoxedPath::new("/etc/passwd").is_err());
    }

    #[test]
    fn windows_shapes_are_rejected() {
        assert!(BoxedPath::new("a\\b").is_err());
        assert!(BoxedPath::new("c:stream").is_err());
        assert!(BoxedPath::new("nul").is_err());
        assert!(BoxedPath::new("sub/CON.txt").is_err());
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(BoxedPath::new("a\nb").is_err());
        assert!(BoxedPath::new("a\0b").is_err());
    }

    #[test]
    fn parent_and_file_name() {
        let path = BoxedPath::new("a/b/c.txt").unwrap();
        assert_eq!(path.parent(), Some("a/b"));
        assert_eq!(path.file_name(), "c.txt");

        let flat = BoxedPath::new("c.txt").unwrap();
        assert_eq!(flat.parent(), None);
        assert_eq!(flat.file_name(), "c.txt");
    }
}
