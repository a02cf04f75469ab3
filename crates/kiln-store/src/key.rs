//! Artifact keys
//!
//! A key is the lowercase hex SHA-256 of the inputs that define an artifact.
//! `KeyHasher` length-prefixes every field so that `("ab", "c")` and
//! `("a", "bc")` never collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::StoreError;

/// Length of a hex-encoded SHA-256 digest.
const KEY_LEN: usize = 64;

/// Content-derived key of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Parse a key, rejecting anything that is not 64 lowercase hex chars.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        let valid = value.len() == KEY_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(StoreError::InvalidKey(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// Key of a single byte string.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = KeyHasher::new();
        hasher.field(bytes);
        hasher.finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Two-character fan-out prefix used for the object directory.
    pub(crate) fn prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

/// Incremental builder for an `ArtifactKey`.
#[derive(Clone, Default)]
pub struct KeyHasher {
    hasher: Sha256,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one length-prefixed field.
    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Add a string field.
    pub fn text(&mut self, value: &str) -> &mut Self {
        self.field(value.as_bytes())
    }

    pub fn finish(self) -> ArtifactKey {
        ArtifactKey(hex::encode(self.hasher.finalize()))
    }
}
