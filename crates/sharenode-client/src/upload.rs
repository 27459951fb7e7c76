//! Upload state machine
//!
//! Serves one file to the peer that requested it. Segments are acknowledged
//! individually; the upload finishes once every segment has been acked.

use sharenode_core::{
    lock, segment_len, AddOutcome, ContentHash, PeerId, Result, SegmentMap, TransferId,
};
use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::catalog::SharedFile;
use crate::registry::{Transfer, TransferEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Active,
    Finished,
    Cancelled,
}

/// Result of [`Upload::add_ack`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    /// Last outstanding ack; the upload is now finished
    Finished,
    Duplicate,
    /// Upload not active or index out of range
    Rejected,
}

#[derive(Debug)]
struct UploadState {
    status: UploadStatus,
    finished_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Upload {
    id: TransferId,
    peer: PeerId,
    file_hash: ContentHash,
    name: String,
    size: u64,
    acks: SegmentMap,
    bytes_sent: AtomicU64,
    resend_count: AtomicU32,
    state: Mutex<UploadState>,
    file: Mutex<File>,
    events: Mutex<Option<broadcast::Sender<TransferEvent>>>,
}

impl Upload {
    /// Open the shared file for serving. Fails if the file cannot be opened.
    pub fn open(id: TransferId, peer: PeerId, shared: &SharedFile) -> Result<Self> {
        let file_hash = shared.compute_hash()?;
        let file = File::open(&shared.path)?;

        Ok(Self {
            id,
            peer,
            file_hash,
            name: shared.name.clone(),
            size: shared.size,
            acks: SegmentMap::new(shared.segment_count),
            bytes_sent: AtomicU64::new(0),
            resend_count: AtomicU32::new(0),
            state: Mutex::new(UploadState {
                status: UploadStatus::Active,
                finished_at: None,
            }),
            file: Mutex::new(file),
            events: Mutex::new(None),
        })
    }

    pub fn file_hash(&self) -> ContentHash {
        self.file_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segment_count(&self) -> u32 {
        self.acks.len()
    }

    pub fn status(&self) -> UploadStatus {
        lock(&self.state).status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == UploadStatus::Cancelled
    }

    pub fn finished_at(&self) -> Option<Instant> {
        lock(&self.state).finished_at
    }

    /// Fraction of segments acknowledged
    pub fn progress(&self) -> f64 {
        self.acks.progress()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn resend_count(&self) -> u32 {
        self.resend_count.load(Ordering::Relaxed)
    }

    pub fn is_acked(&self, segment: u32) -> bool {
        self.acks.contains(segment).unwrap_or(false)
    }

    /// Record the peer's acknowledgement of one segment
    pub fn add_ack(&self, segment: u32) -> AckOutcome {
        let mut state = lock(&self.state);
        if state.status != UploadStatus::Active {
            return AckOutcome::Rejected;
        }

        let outcome = match self.acks.add(segment) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(transfer = %self.id, segment, error = %e, "ack rejected");
                return AckOutcome::Rejected;
            }
        };

        match outcome {
            AddOutcome::Duplicate | AddOutcome::AlreadyFilled => AckOutcome::Duplicate,
            AddOutcome::Added => {
                self.bytes_sent
                    .fetch_add(segment_len(self.size, segment) as u64, Ordering::Relaxed);
                AckOutcome::Accepted
            }
            AddOutcome::Filled => {
                self.bytes_sent
                    .fetch_add(segment_len(self.size, segment) as u64, Ordering::Relaxed);
                state.status = UploadStatus::Finished;
                state.finished_at = Some(Instant::now());
                drop(state);

                tracing::info!(transfer = %self.id, peer = %self.peer, name = %self.name, "upload finished");
                self.emit(TransferEvent::UploadFinished(self.id));
                AckOutcome::Finished
            }
        }
    }

    /// Count an explicit re-request of a segment
    pub fn add_resend_count(&self) {
        self.resend_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Read one segment from the shared file
    pub fn read_segment(&self, segment: u32) -> Result<Vec<u8>> {
        let mut file = lock(&self.file);
        sharenode_core::file::read_segment(&mut file, self.size, segment)
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }
}

impl Transfer for Upload {
    fn id(&self) -> TransferId {
        self.id
    }

    fn peer(&self) -> PeerId {
        self.peer
    }

    fn is_active(&self) -> bool {
        self.status() == UploadStatus::Active
    }

    /// No-op unless active. Nothing on disk is touched.
    fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status != UploadStatus::Active {
            return false;
        }
        state.status = UploadStatus::Cancelled;
        tracing::info!(transfer = %self.id, peer = %self.peer, "upload cancelled");
        true
    }

    fn attach(&self, events: broadcast::Sender<TransferEvent>) {
        *lock(&self.events) = Some(events);
    }

    fn detach(&self) {
        lock(&self.events).take();
    }
}
