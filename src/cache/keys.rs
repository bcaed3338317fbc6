//! Cache key definitions.
//!
//! A formula is identified by its trimmed LaTeX source and its display mode.
//! The digest is stable across runs and matches the layout used by earlier
//! cache files (`"{latex}::True"` / `"{latex}::False"`).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest identifying a `(formula, display mode)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Length of the hex digest in characters.
    pub const LEN: usize = 64;

    pub fn new(latex: &str, display_mode: bool) -> Self {
        let marker = if display_mode { "True" } else { "False" };
        let mut hasher = Sha256::new();
        hasher.update(latex.trim().as_bytes());
        hasher.update(b"::");
        hasher.update(marker.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
