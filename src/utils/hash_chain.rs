// Content fingerprints used to chain stage cache keys.
//
// Each part is length-prefixed before hashing so that ["ab", "c"] and ["a", "bc"]
// produce different digests while the order of parts still matters.

use sha2::{Digest, Sha256};
use std::fmt;

/// One input to [`fingerprint`]: raw bytes or text.
#[derive(Debug, Clone, Copy)]
pub enum Part<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
}

impl<'a> Part<'a> {
    fn as_bytes(&self) -> &'a [u8] {
        match self {
            Part::Bytes(b) => b,
            Part::Text(s) => s.as_bytes(),
        }
    }
}

impl<'a> From<&'a [u8]> for Part<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Part::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for Part<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        Part::Bytes(bytes.as_slice())
    }
}

impl<'a> From<&'a str> for Part<'a> {
    fn from(text: &'a str) -> Self {
        Part::Text(text)
    }
}

impl<'a> From<&'a String> for Part<'a> {
    fn from(text: &'a String) -> Self {
        Part::Text(text.as_str())
    }
}

impl<'a> From<&'a ContentHash> for Part<'a> {
    fn from(hash: &'a ContentHash) -> Self {
        Part::Text(hash.as_str())
    }
}

/// Hex-encoded SHA-256 digest of some stage input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic, order-sensitive SHA-256 fingerprint of `parts`.
///
/// An empty list hashes nothing and yields the digest of empty input.
pub fn fingerprint<'a, I>(parts: I) -> ContentHash
where
    I: IntoIterator<Item = Part<'a>>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    ContentHash(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of a single byte sequence.
pub fn fingerprint_bytes(bytes: &[u8]) -> ContentHash {
    fingerprint([Part::Bytes(bytes)])
}

/// Fingerprint of a single string.
pub fn fingerprint_text(text: &str) -> ContentHash {
    fingerprint([Part::Text(text)])
}
