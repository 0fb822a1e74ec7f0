//! Repository names.

use crate::error::{RepositoryError, RepositoryResult};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Validated name of an external repository, stored without the leading `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Parse and validate a name. A leading `@` is accepted and stripped.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidName`] for empty names, `.`/`..`, or
    /// names containing characters other than ASCII alphanumerics, `_`, `-`, `.`.
    pub fn new(name: impl AsRef<str>) -> RepositoryResult<Self> {
        let raw = name.as_ref();
        let name = raw.strip_prefix('@').unwrap_or(raw);

        let invalid = |reason| RepositoryError::InvalidName {
            name: raw.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name == "." || name == ".." {
            return Err(invalid("name is a relative path segment"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(invalid("only [A-Za-z0-9_.-] are allowed"));
        }

        Ok(Self(name.to_string()))
    }

    /// Name without the leading `@`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the marker recorded next to the repository directory.
    #[must_use]
    pub fn marker_file_name(&self) -> String {
        format!("@{}.marker", self.0)
    }
}

impl FromStr for RepositoryName {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}
