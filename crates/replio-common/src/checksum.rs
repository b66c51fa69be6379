//! Content checksum engine
//!
//! Supports the "none" type plus xxHash64 (fast default) and SHA256
//! (strong) content hashes, computed either one-shot or streaming.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Supported checksum algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CksumType {
    None,
    #[default]
    XxHash64,
    Sha256,
}

impl CksumType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::XxHash64 => "xxhash64",
            Self::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for CksumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed content checksum: algorithm + hex-encoded value
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cksum {
    ty: CksumType,
    value: String,
}

impl Cksum {
    #[must_use]
    pub fn new(ty: CksumType, value: impl Into<String>) -> Self {
        Self { ty, value: value.into() }
    }

    /// The "no checksum" value
    #[must_use]
    pub const fn none() -> Self {
        Self { ty: CksumType::None, value: String::new() }
    }

    #[must_use]
    pub const fn ty(&self) -> CksumType {
        self.ty
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ty == CksumType::None || self.value.is_empty()
    }

    /// Compute a checksum over a full in-memory buffer
    #[must_use]
    pub fn compute(ty: CksumType, data: &[u8]) -> Self {
        let mut h = CksumHash::new(ty);
        h.update(data);
        h.finalize()
    }
}

impl std::fmt::Display for Cksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ty, self.value)
    }
}

/// Streaming checksum calculator
pub struct CksumHash {
    ty: CksumType,
    xx: Option<xxhash_rust::xxh64::Xxh64>,
    sha: Option<Sha256>,
}

impl CksumHash {
    #[must_use]
    pub fn new(ty: CksumType) -> Self {
        let (xx, sha) = match ty {
            CksumType::None => (None, None),
            CksumType::XxHash64 => (Some(xxhash_rust::xxh64::Xxh64::new(0)), None),
            CksumType::Sha256 => (None, Some(Sha256::new())),
        };
        Self { ty, xx, sha }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        if let Some(ref mut xx) = self.xx {
            xx.update(data);
        }
        if let Some(ref mut sha) = self.sha {
            sha.update(data);
        }
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Cksum {
        match self.ty {
            CksumType::None => Cksum::none(),
            CksumType::XxHash64 => {
                let digest = self.xx.map(|h| h.digest()).unwrap_or_default();
                Cksum::new(self.ty, hex_encode(&digest.to_be_bytes()))
            }
            CksumType::Sha256 => {
                let digest: [u8; 32] = self.sha.map(|h| h.finalize().into()).unwrap_or_default();
                Cksum::new(self.ty, hex_encode(&digest))
            }
        }
    }
}

/// Hex encode bytes
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}
