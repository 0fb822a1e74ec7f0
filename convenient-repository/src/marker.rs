//! Marker files recording how a repository directory was produced.
//!
//! Format (one entry per line):
//!
//! ```text
//! <digest hex>
//! FILE:<sha256 hex> <path>
//! ENV:<name> <value>
//! ENV:<name>
//! ```
//!
//! The first line is the rule digest, not the state digest: recorded file
//! hashes are checked line by line instead. `ENV:<name>` without a value
//! records a variable that was unset.

use crate::digest::{hash_file, FetchDigest};
use crate::error::{io_at, RepositoryResult};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Parsed contents of a repository marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryMarker {
    digest: FetchDigest,
    files: BTreeMap<PathBuf, String>,
    environ: BTreeMap<String, Option<String>>,
}

impl RepositoryMarker {
    /// Marker for a fetch keyed by the rule digest `digest`.
    #[must_use]
    pub fn new(digest: FetchDigest) -> Self {
        Self {
            digest,
            files: BTreeMap::new(),
            environ: BTreeMap::new(),
        }
    }

    /// Record a file the fetch read, with its content hash.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, hash: impl Into<String>) -> Self {
        let _ = self.files.insert(path.into(), hash.into());
        self
    }

    /// Record an environment variable value (`None` when unset).
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        let _ = self.environ.insert(name.into(), value);
        self
    }

    /// Recorded digest.
    #[must_use]
    pub fn digest(&self) -> &FetchDigest {
        &self.digest
    }

    /// Recorded files.
    #[must_use]
    pub fn files(&self) -> &BTreeMap<PathBuf, String> {
        &self.files
    }

    /// Parse marker text. Returns `None` for anything malformed.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let digest = FetchDigest::from_hex(lines.next()?).ok()?;
        if digest.as_bytes().is_empty() {
            return None;
        }
        let mut marker = Self::new(digest);

        for line in lines.filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("FILE:") {
                let (hash, path) = rest.split_once(' ')?;
                let _ = marker.files.insert(PathBuf::from(path), hash.to_string());
            } else if let Some(rest) = line.strip_prefix("ENV:") {
                let (name, value) = match rest.split_once(' ') {
                    Some((name, value)) => (name, Some(value.to_string())),
                    None => (rest, None),
                };
                let _ = marker.environ.insert(name.to_string(), value);
            } else {
                return None;
            }
        }

        Some(marker)
    }

    /// Render marker text.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.digest.to_hex();
        out.push('\n');
        for (path, hash) in &self.files {
            let _ = writeln!(out, "FILE:{hash} {}", path.display());
        }
        for (name, value) in &self.environ {
            match value {
                Some(value) => {
                    let _ = writeln!(out, "ENV:{name} {value}");
                }
                None => {
                    let _ = writeln!(out, "ENV:{name}");
                }
            }
        }
        out
    }

    /// Read a marker. Missing or malformed markers read as `None`.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than "not found".
    pub fn read(path: &Path) -> RepositoryResult<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_at(path)(e)),
        };

        let marker = Self::parse(&content);
        if marker.is_none() {
            warn!("Ignoring malformed repository marker {}", path.display());
        }
        Ok(marker)
    }

    /// Write the marker atomically (temporary file, then rename).
    ///
    /// # Errors
    ///
    /// Returns any I/O error from writing or renaming.
    pub fn write(&self, path: &Path) -> RepositoryResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let tmp = path.with_extension("marker.tmp");
        fs::write(&tmp, self.render()).map_err(io_at(&tmp))?;
        fs::rename(&tmp, path).map_err(io_at(path))?;
        debug!("Wrote repository marker {}", path.display());
        Ok(())
    }

    /// Whether a directory produced under this marker can be reused.
    ///
    /// Requires the same digest, the same values for every recorded
    /// environment variable, and unchanged contents for every recorded file.
    #[must_use]
    pub fn is_up_to_date(&self, expected: &FetchDigest, env: &BTreeMap<String, String>) -> bool {
        if &self.digest != expected {
            debug!("Marker digest {} differs from {}", self.digest, expected);
            return false;
        }

        for (name, recorded) in &self.environ {
            if env.get(name) != recorded.as_ref() {
                debug!("Environment variable {name} changed");
                return false;
            }
        }

        for (path, recorded) in &self.files {
            match hash_file(path) {
                Ok(current) if &current == recorded => {}
                _ => {
                    debug!("Recorded file {} changed", path.display());
                    return false;
                }
            }
        }

        true
    }
}
