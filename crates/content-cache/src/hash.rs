//! ContentHash: hex-encoded BLAKE3 digest of a blob.
//!
//! The digest is only used for change detection and addressing. Nothing
//! authenticates a peer on the strength of a matching digest.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of a digest in hex characters.
pub const HASH_HEX_LEN: usize = 64;

/// A content digest: 64 lowercase hex chars of BLAKE3.
///
/// Decoding goes through [`FromStr`], so a digest read off the wire is
/// always safe to use as a cache file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash length: expected {HASH_HEX_LEN} hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in hash")]
    InvalidHex,
}

impl ContentHash {
    /// Hash data and return its digest.
    pub fn from_data(data: &[u8]) -> Self {
        Self(hex::encode(blake3::hash(data).as_bytes()))
    }

    /// Finish an incremental hasher.
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    /// First two characters, used for directory sharding.
    pub fn prefix(&self) -> &str {
        &self.0[0..2]
    }

    /// Remainder after the prefix, used as the object file name.
    pub fn remainder(&self) -> &str {
        &self.0[2..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_is_deterministic() {
        let a = ContentHash::from_data(b"hello");
        let b = ContentHash::from_data(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), HASH_HEX_LEN);
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(
            ContentHash::from_data(b"hello"),
            ContentHash::from_data(b"somethingelse")
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(
            ContentHash::from_hasher(&hasher),
            ContentHash::from_data(b"hello")
        );
    }

    #[test]
    fn test_prefix_and_remainder() {
        let hash = ContentHash::from_data(b"test");
        assert_eq!(hash.prefix().len(), 2);
        assert_eq!(format!("{}{}", hash.prefix(), hash.remainder()), hash.as_str());
    }

    #[test]
    fn test_parse() {
        let hash = ContentHash::from_data(b"parse me");
        let upper = hash.as_str().to_ascii_uppercase();
        assert_eq!(upper.parse::<ContentHash>().unwrap(), hash);
        assert_eq!(
            "short".parse::<ContentHash>(),
            Err(HashError::InvalidLength(5))
        );
        assert_eq!(
            "z".repeat(HASH_HEX_LEN).parse::<ContentHash>(),
            Err(HashError::InvalidHex)
        );
    }

    #[test]
    fn test_serde_as_string() {
        let hash = ContentHash::from_data(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        assert_eq!(serde_json::from_str::<ContentHash>(&json).unwrap(), hash);
    }

    #[test]
    fn test_deserialize_rejects_malformed() {
        let escape = format!("\"../{}\"", "a".repeat(HASH_HEX_LEN - 3));
        assert!(serde_json::from_str::<ContentHash>(&escape).is_err());
        assert!(serde_json::from_str::<ContentHash>("\"/etc/passwd\"").is_err());
        assert!(serde_json::from_str::<ContentHash>("\"a\"").is_err());
        assert!(serde_json::from_str::<ContentHash>("\"\"").is_err());
    }
}
