//! Core data types for Sharenode

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result, MAX_SEGMENT_COUNT, SEGMENT_SIZE};

/// A 32-byte BLAKE3 hash of a whole file
pub type ContentHash = [u8; 32];

/// Transport-assigned identifier of a connected peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Identifier shared by a Download and the Upload serving it
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId([u8; 16]);

impl TransferId {
    /// Generate a fresh random transfer id
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| Error::Crypto(format!("random source unavailable: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from wire bytes; anything but 16 bytes is a protocol error
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            Error::Protocol(format!("transfer id must be 16 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", &hex::encode(self.0)[..8])
    }
}

impl FromStr for TransferId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidData(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// A file entry as advertised in a `FilesList` catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Monotonic index within the sharing node's catalog
    pub index: u64,
    /// Display name
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Number of segments
    pub segment_count: u32,
    /// BLAKE3 content hash, hex encoded
    pub hash: String,
}

impl CatalogEntry {
    /// Decode the advertised hash
    pub fn content_hash(&self) -> Result<ContentHash> {
        hex_to_hash(&self.hash).map_err(|e| Error::InvalidData(format!("bad hash: {}", e)))
    }
}

/// Number of segments needed to carry `size` bytes.
///
/// Sizes needing more than [`MAX_SEGMENT_COUNT`] segments are rejected.
pub fn segment_count(size: u64) -> Result<u32> {
    let count = size.div_ceil(SEGMENT_SIZE as u64);
    u32::try_from(count)
        .ok()
        .filter(|&count| count <= MAX_SEGMENT_COUNT)
        .ok_or_else(|| {
            Error::InvalidData(format!(
                "{} bytes needs {} segments, limit is {}",
                size, count, MAX_SEGMENT_COUNT
            ))
        })
}

/// Byte length of segment `index` in a file of `size` bytes
pub fn segment_len(size: u64, index: u32) -> usize {
    let offset = index as u64 * SEGMENT_SIZE as u64;
    size.saturating_sub(offset).min(SEGMENT_SIZE as u64) as usize
}

/// Byte offset of segment `index`
pub fn segment_offset(index: u32) -> u64 {
    index as u64 * SEGMENT_SIZE as u64
}

/// Helper to format a content hash as hex string
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into a content hash
pub fn hex_to_hash(s: &str) -> std::result::Result<ContentHash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_arithmetic() {
        assert_eq!(segment_count(0).unwrap(), 0);
        assert_eq!(segment_count(1).unwrap(), 1);
        assert_eq!(segment_count(SEGMENT_SIZE as u64).unwrap(), 1);
        assert_eq!(segment_count(600_000).unwrap(), 3);

        assert_eq!(segment_len(600_000, 0), 262_144);
        assert_eq!(segment_len(600_000, 1), 262_144);
        assert_eq!(segment_len(600_000, 2), 75_712);
        assert_eq!(segment_len(600_000, 3), 0);
        assert_eq!(segment_offset(2), 524_288);
    }

    #[test]
    fn test_segment_count_limit() {
        let largest = MAX_SEGMENT_COUNT as u64 * SEGMENT_SIZE as u64;
        assert_eq!(segment_count(largest).unwrap(), MAX_SEGMENT_COUNT);
        assert!(segment_count(largest + 1).is_err());
        assert!(segment_count((1u64 << 50) + 1).is_err());
        assert!(segment_count(u64::MAX).is_err());
    }

    #[test]
    fn test_transfer_id_hex() {
        let id = TransferId::generate().unwrap();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(TransferId::from_slice(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_catalog_entry_hash() {
        let hash = *blake3::hash(b"entry").as_bytes();
        let entry = CatalogEntry {
            index: 0,
            name: "a.bin".to_string(),
            size: 5,
            segment_count: 1,
            hash: hash_to_hex(&hash),
        };
        assert_eq!(entry.content_hash().unwrap(), hash);
    }
}
