//! Shared file catalog
//!
//! Files offered to other peers. Each entry gets the next catalog index when
//! shared; its content hash is computed off the caller's task and the entry
//! is only advertised once the hash is known.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sharenode_core::file::{display_name, hash_file};
use sharenode_core::{
    hash_to_hex, segment_count, CatalogEntry, ContentHash, Error, FilesList, Result,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
pub struct SharedFile {
    pub index: u64,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub segment_count: u32,
    hash: OnceLock<ContentHash>,
}

impl SharedFile {
    /// Content hash, if computed
    pub fn hash(&self) -> Option<ContentHash> {
        self.hash.get().copied()
    }

    /// Hash the file now unless already done
    pub fn compute_hash(&self) -> Result<ContentHash> {
        if let Some(hash) = self.hash() {
            return Ok(hash);
        }
        let hash = hash_file(&self.path)?;
        Ok(*self.hash.get_or_init(|| hash))
    }

    /// Advertised form; `None` until the hash is ready
    pub fn entry(&self) -> Option<CatalogEntry> {
        let hash = self.hash()?;
        Some(CatalogEntry {
            index: self.index,
            name: self.name.clone(),
            size: self.size,
            segment_count: self.segment_count,
            hash: hash_to_hex(&hash),
        })
    }
}

#[derive(Clone, Default)]
pub struct SharedCatalog {
    files: Arc<DashMap<PathBuf, Arc<SharedFile>>>,
    next_index: Arc<AtomicU64>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a file. Sharing the same path again returns the existing entry.
    ///
    /// Hashing runs on the blocking pool when a tokio runtime is available,
    /// inline otherwise.
    pub fn share(&self, path: &Path) -> Result<Arc<SharedFile>> {
        let path = std::fs::canonicalize(path)?;
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(Error::InvalidData(format!("{} is not a file", path.display())));
        }
        if metadata.len() == 0 {
            return Err(Error::InvalidData(format!("{} is empty", path.display())));
        }
        let segments = segment_count(metadata.len())?;

        let file = match self.files.entry(path.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let file = Arc::new(SharedFile {
                    index: self.next_index.fetch_add(1, Ordering::SeqCst),
                    name: display_name(&path),
                    path,
                    size: metadata.len(),
                    segment_count: segments,
                    hash: OnceLock::new(),
                });
                slot.insert(file.clone());
                file
            }
        };

        tracing::info!(
            index = file.index,
            name = %file.name,
            size = file.size,
            segments = file.segment_count,
            "sharing file"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pending = file.clone();
                handle.spawn_blocking(move || log_hash_result(&pending, pending.compute_hash()));
            }
            Err(_) => log_hash_result(&file, file.compute_hash()),
        }

        Ok(file)
    }

    /// Stop sharing a path
    pub fn unshare(&self, path: &Path) -> Option<Arc<SharedFile>> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.files.remove(&path).map(|(_, file)| file)
    }

    /// Look up a hashed file by content hash
    pub fn find_by_hash(&self, hash: &ContentHash) -> Option<Arc<SharedFile>> {
        self.files
            .iter()
            .find(|entry| entry.value().hash().as_ref() == Some(hash))
            .map(|entry| entry.value().clone())
    }

    /// Every shared file, hashed or not, in index order
    pub fn files(&self) -> Vec<Arc<SharedFile>> {
        let mut files: Vec<_> = self.files.iter().map(|e| e.value().clone()).collect();
        files.sort_by_key(|file| file.index);
        files
    }

    /// Advertised entries in index order
    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.files().iter().filter_map(|file| file.entry()).collect()
    }

    /// The catalog as sent in a `FilesList` message
    pub fn files_list(&self) -> Result<FilesList> {
        FilesList::from_entries(&self.entries())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn log_hash_result(file: &SharedFile, result: Result<ContentHash>) {
    match result {
        Ok(hash) => {
            tracing::debug!(index = file.index, hash = %hash_to_hex(&hash), "file hashed")
        }
        Err(e) => {
            tracing::error!(index = file.index, path = %file.path.display(), error = %e, "hashing failed")
        }
    }
}
