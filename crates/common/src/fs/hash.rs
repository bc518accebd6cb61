use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed-width BLAKE3 content digest. The sole identity for file content:
/// two objects with equal hashes are treated as byte-identical.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const LEN: usize = 32;

    /// Digest a complete byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Incremental hasher for streaming file contents through the rate limiter
/// one chunk at a time.
#[derive(Default)]
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("invalid hex digest: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("digest must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HashParseError::BadLength {
                expected: Self::LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}
