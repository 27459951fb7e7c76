//! Segment-level file I/O and content hashing

use crate::{error::Result, types::*, Error, SEGMENT_SIZE};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Compute the BLAKE3 hash of a whole file, reading it segment by segment
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut reader = std::io::BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; SEGMENT_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hash = *hasher.finalize().as_bytes();
    tracing::debug!(path = %path.display(), hash = %hash_to_hex(&hash), "hashed file");
    Ok(hash)
}

/// Read segment `index` of a file of `size` bytes
pub fn read_segment(file: &mut File, size: u64, index: u32) -> Result<Vec<u8>> {
    let total = segment_count(size)?;
    if index >= total {
        return Err(Error::InvalidSegmentIndex { index, total });
    }

    let mut buffer = vec![0u8; segment_len(size, index)];
    file.seek(SeekFrom::Start(segment_offset(index)))?;
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Write segment `index` at its offset
pub fn write_segment(file: &mut File, index: u32, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(segment_offset(index)))?;
    file.write_all(data)?;
    Ok(())
}

/// Display name of a path, falling back to "unknown"
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
