//! Download and upload registries
//!
//! Both registries index transfers by [`TransferId`]. Adding attaches the
//! registry's event sender to the transfer so its notifications are
//! forwarded; removing detaches it again.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sharenode_core::{ContentHash, PeerId, TransferId};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::download::{Download, Verification};
use crate::peers::EVENT_CAPACITY;
use crate::upload::Upload;

/// Notifications raised by registries and forwarded from their transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Added(TransferId),
    Removed(TransferId),
    DownloadFinished(TransferId),
    DownloadVerified {
        id: TransferId,
        verification: Verification,
    },
    /// A cancelled download deleted its partial file
    FileRemoved(TransferId),
    /// Segments a download is still waiting for, in ascending order
    MissingSegments {
        id: TransferId,
        peer: PeerId,
        file_hash: ContentHash,
        segments: Vec<u32>,
    },
    UploadFinished(TransferId),
}

/// What a registry needs from the transfers it holds
pub trait Transfer: Send + Sync {
    fn id(&self) -> TransferId;

    /// The remote peer on the other end of this transfer
    fn peer(&self) -> PeerId;

    fn is_active(&self) -> bool;

    /// Cancel if still active. Returns whether anything changed.
    fn cancel(&self) -> bool;

    fn attach(&self, events: broadcast::Sender<TransferEvent>);

    fn detach(&self);
}

pub struct TransferRegistry<T> {
    transfers: Arc<DashMap<TransferId, Arc<T>>>,
    events: broadcast::Sender<TransferEvent>,
}

pub type DownloadRegistry = TransferRegistry<Download>;
pub type UploadRegistry = TransferRegistry<Upload>;

impl<T> Clone for TransferRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            transfers: self.transfers.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T: Transfer> Default for TransferRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transfer> TransferRegistry<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transfers: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Register a transfer. Returns false and changes nothing if the id is taken.
    pub fn add(&self, transfer: Arc<T>) -> bool {
        let id = transfer.id();
        match self.transfers.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                transfer.attach(self.events.clone());
                slot.insert(transfer);
            }
        }

        let _ = self.events.send(TransferEvent::Added(id));
        true
    }

    /// Unregister a transfer. Removing an unknown id is a no-op.
    pub fn remove(&self, id: TransferId) -> Option<Arc<T>> {
        let (_, transfer) = self.transfers.remove(&id)?;
        transfer.detach();
        let _ = self.events.send(TransferEvent::Removed(id));
        Some(transfer)
    }

    pub fn get(&self, id: TransferId) -> Option<Arc<T>> {
        self.transfers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Cancel and unregister every active transfer with `peer`.
    ///
    /// Transfers that already reached a terminal state stay registered.
    pub fn cancel_all_for_peer(&self, peer: PeerId) -> Vec<Arc<T>> {
        let owned: Vec<_> = self
            .transfers
            .iter()
            .filter(|entry| entry.value().peer() == peer)
            .map(|entry| entry.value().clone())
            .collect();

        let cancelled: Vec<_> = owned
            .into_iter()
            .filter(|transfer| transfer.cancel())
            .collect();
        for transfer in &cancelled {
            self.remove(transfer.id());
        }

        if !cancelled.is_empty() {
            tracing::info!(peer = %peer, count = cancelled.len(), "cancelled transfers for peer");
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }
}

impl TransferRegistry<Download> {
    /// The active download writing to `path`, if any
    pub fn find_by_same_path(&self, path: &Path) -> Option<Arc<Download>> {
        self.transfers
            .iter()
            .find(|entry| entry.value().is_active() && entry.value().path() == path)
            .map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SharedCatalog;
    use sharenode_core::{hash_to_hex, CatalogEntry};
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            index: 0,
            name: "a.bin".to_string(),
            size: 1000,
            segment_count: 1,
            hash: hash_to_hex(&[9u8; 32]),
        }
    }

    fn download(dir: &TempDir, id: u8, peer: u32) -> Arc<Download> {
        Arc::new(
            Download::open(
                TransferId::from_bytes([id; 16]),
                PeerId(peer),
                &entry(),
                dir.path().join(format!("file-{}", id)),
                Duration::from_secs(15),
                20,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let dir = TempDir::new().unwrap();
        let other_dir = TempDir::new().unwrap();
        let registry = DownloadRegistry::new();
        let mut events = registry.subscribe();

        assert!(registry.add(download(&dir, 1, 1)));
        assert!(!registry.add(download(&other_dir, 1, 1)));
        assert_eq!(registry.len(), 1);

        assert!(matches!(events.try_recv(), Ok(TransferEvent::Added(_))));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = DownloadRegistry::new();
        let mut events = registry.subscribe();
        assert!(registry.remove(TransferId::from_bytes([3; 16])).is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_events_forwarded_until_removed() {
        let dir = TempDir::new().unwrap();
        let registry = DownloadRegistry::new();
        let first = download(&dir, 1, 1);
        let second = download(&dir, 2, 1);
        registry.add(first.clone());
        registry.add(second.clone());
        registry.remove(second.id());

        let mut events = registry.subscribe();
        first.cancel();
        second.cancel();

        assert_eq!(events.try_recv().unwrap(), TransferEvent::FileRemoved(first.id()));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all_for_peer_only_touches_that_peer() {
        let dir = TempDir::new().unwrap();
        let registry = DownloadRegistry::new();
        let mine = [download(&dir, 1, 7), download(&dir, 2, 7)];
        let other = download(&dir, 3, 8);
        for d in mine.iter().chain(std::iter::once(&other)) {
            registry.add(d.clone());
        }

        let cancelled = registry.cancel_all_for_peer(PeerId(7));
        assert_eq!(cancelled.len(), 2);
        assert!(mine.iter().all(|d| !d.is_active() && !d.path().exists()));
        assert!(other.is_active());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(other.id()).is_some());

        assert!(registry.cancel_all_for_peer(PeerId(7)).is_empty());
    }

    #[test]
    fn test_find_by_same_path_ignores_inactive() {
        let dir = TempDir::new().unwrap();
        let registry = DownloadRegistry::new();
        let d = download(&dir, 1, 1);
        registry.add(d.clone());

        assert!(registry.find_by_same_path(d.path()).is_some());
        assert!(registry.find_by_same_path(&dir.path().join("other")).is_none());

        d.cancel();
        assert!(registry.find_by_same_path(d.path()).is_none());
    }

    #[test]
    fn test_upload_registry_cancel_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.bin");
        std::fs::write(&path, [1u8; 100]).unwrap();
        let shared = SharedCatalog::new().share(&path).unwrap();

        let registry = UploadRegistry::new();
        let upload = Arc::new(
            Upload::open(TransferId::from_bytes([4; 16]), PeerId(2), &shared).unwrap(),
        );
        registry.add(upload.clone());

        assert_eq!(registry.cancel_all_for_peer(PeerId(2)).len(), 1);
        assert!(upload.is_cancelled());
        assert!(registry.is_empty());
    }
}
