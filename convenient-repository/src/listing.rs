//! Snapshot of a directory's immediate contents.

use crate::error::{RepositoryError, RepositoryResult};
use std::path::Path;
use walkdir::WalkDir;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link (not followed)
    Symlink,
    /// Sockets, fifos, devices
    Other,
}

/// One entry of a [`DirectoryListing`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ListingEntry {
    /// File name relative to the listed directory
    pub name: String,
    /// Entry kind
    pub kind: EntryKind,
}

impl ListingEntry {
    /// Create an entry.
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Sorted, immutable listing of a directory's immediate entries.
///
/// Used only for change detection: two listings are equal when they name the
/// same entries with the same kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DirectoryListing {
    entries: Vec<ListingEntry>,
}

impl DirectoryListing {
    /// Read the immediate entries of `dir`. Symlinks below `dir` are not followed.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Listing`] if the directory cannot be read.
    pub fn read(dir: &Path) -> RepositoryResult<Self> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = entry.map_err(|source| RepositoryError::Listing {
                path: dir.to_path_buf(),
                source,
            })?;

            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };

            entries.push(ListingEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                kind,
            ));
        }

        Ok(Self::from_entries(entries))
    }

    /// Build a listing from arbitrary entries; sorts and deduplicates them.
    pub fn from_entries(entries: impl IntoIterator<Item = ListingEntry>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    /// Entries in name order.
    #[must_use]
    pub fn entries(&self) -> &[ListingEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }
}
