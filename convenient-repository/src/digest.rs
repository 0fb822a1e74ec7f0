//! Fetch fingerprints.
//!
//! A [`FetchDigest`] summarizes everything that determined the contents of a
//! fetched repository: the rule that describes it, the files it recorded
//! while fetching and the environment variables it declared. Two states with
//! equal digests (and paths) are interchangeable for caching purposes.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Chunk size used when streaming files through the hasher
const CHUNK_SIZE: usize = 64 * 1024;

/// Opaque, immutable fingerprint of a fetched repository.
///
/// Equality and hashing are byte-wise.
#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FetchDigest(Vec<u8>);

impl FetchDigest {
    /// Wrap raw digest bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Parse a hex encoded digest.
    ///
    /// # Errors
    ///
    /// Returns the decoding error if `hex` is not valid hexadecimal.
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(hex.trim()).map(Self)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for FetchDigest {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for FetchDigest {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for FetchDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FetchDigest({})", self.to_hex())
    }
}

impl fmt::Display for FetchDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", &hex[..hex.len().min(8)])
    }
}

/// Accumulates the inputs of a repository fetch and hashes them.
///
/// All inputs are kept in sorted maps, so insertion order never changes the
/// resulting digest.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct DigestBuilder {
    rule_name: String,
    rule_kind: String,
    attributes: BTreeMap<String, String>,
    files: BTreeMap<PathBuf, String>,
    environ: BTreeMap<String, Option<String>>,
}

impl DigestBuilder {
    /// Start a digest for the rule `name` of kind `kind`.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            rule_name: name.into(),
            rule_kind: kind.into(),
            ..Self::default()
        }
    }

    /// Add a rule attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a file the fetch read, with its content hash.
    pub fn record_file(mut self, path: impl Into<PathBuf>, hash: impl Into<String>) -> Self {
        let _ = self.files.insert(path.into(), hash.into());
        self
    }

    /// Add an environment variable the fetch depends on (`None` when unset).
    pub fn record_env(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        let _ = self.environ.insert(name.into(), value);
        self
    }

    /// Hash everything accumulated so far.
    #[must_use]
    pub fn finish(&self) -> FetchDigest {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, b"RULE", self.rule_name.as_bytes());
        update_field(&mut hasher, b"KIND", self.rule_kind.as_bytes());

        for (key, value) in &self.attributes {
            update_field(&mut hasher, b"ATTR", key.as_bytes());
            update_field(&mut hasher, b"VALUE", value.as_bytes());
        }

        for (path, hash) in &self.files {
            update_field(&mut hasher, b"FILE", path.to_string_lossy().as_bytes());
            update_field(&mut hasher, b"HASH", hash.as_bytes());
        }

        for (name, value) in &self.environ {
            update_field(&mut hasher, b"ENV", name.as_bytes());
            match value {
                Some(value) => update_field(&mut hasher, b"SET", value.as_bytes()),
                None => update_field(&mut hasher, b"UNSET", &[]),
            }
        }

        FetchDigest(hasher.finalize().to_vec())
    }
}

// Length-prefixed so that adjacent fields cannot run into each other.
fn update_field(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update(tag);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

/// SHA-256 of a file's contents as lowercase hex.
///
/// # Errors
///
/// Returns any error from opening or reading the file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
