//! Download state machine
//!
//! A download writes segments into its destination file as they arrive, in
//! any order. Once the byte count reaches the declared size the file is
//! closed and its content hash is checked in the background.
//!
//! While active, a download asks for the segments it is still missing every
//! `retry_interval` without activity. Each accepted segment resets that timer.

use sharenode_core::file::{hash_file, write_segment};
use sharenode_core::{
    lock, segment_len, AddOutcome, CatalogEntry, ContentHash, Error, PeerId, Result,
    SegmentMap, TransferId,
};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::registry::{Transfer, TransferEvent};
use crate::speed::SpeedMeter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Active,
    Downloaded,
    Cancelled,
}

/// Outcome of the post-download hash check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    None,
    Started,
    Positive,
    Negative,
    Failed,
}

/// Result of [`Download::try_write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Last segment written; the download is complete
    Completed,
    /// Segment already present; nothing written
    Duplicate,
    /// Download not active, or bad index or length
    Rejected,
}

impl WriteOutcome {
    /// Whether the sender should get an ack for this segment
    pub fn should_ack(&self) -> bool {
        !matches!(self, WriteOutcome::Rejected)
    }
}

#[derive(Debug)]
struct DownloadState {
    status: DownloadStatus,
    file: Option<File>,
    last_activity: Instant,
    speed: SpeedMeter,
    finished_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Download {
    id: TransferId,
    peer: PeerId,
    file_hash: ContentHash,
    name: String,
    path: PathBuf,
    size: u64,
    segments: SegmentMap,
    bytes_downloaded: AtomicU64,
    started_at: Instant,
    retry_interval: Duration,
    state: Mutex<DownloadState>,
    verification: Arc<Mutex<Verification>>,
    events: Mutex<Option<broadcast::Sender<TransferEvent>>>,
}

impl Download {
    /// Create the destination file and start an active download.
    ///
    /// A file that cannot be created fails the whole operation.
    pub fn open(
        id: TransferId,
        peer: PeerId,
        entry: &CatalogEntry,
        path: PathBuf,
        retry_interval: Duration,
        speed_window: usize,
    ) -> Result<Self> {
        let file_hash = entry.content_hash()?;
        if entry.size == 0 {
            return Err(Error::InvalidData(format!("{} is empty", entry.name)));
        }
        let segments = sharenode_core::segment_count(entry.size)?;
        if entry.segment_count != segments {
            return Err(Error::InvalidData(format!(
                "{} advertises {} segments, {} bytes needs {}",
                entry.name, entry.segment_count, entry.size, segments
            )));
        }

        // Never truncate an existing file, which may be one we are sharing
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let now = Instant::now();
        tracing::info!(
            transfer = %id,
            peer = %peer,
            name = %entry.name,
            size = entry.size,
            path = %path.display(),
            "download started"
        );

        Ok(Self {
            id,
            peer,
            file_hash,
            name: entry.name.clone(),
            path,
            size: entry.size,
            segments: SegmentMap::new(segments),
            bytes_downloaded: AtomicU64::new(0),
            started_at: now,
            retry_interval,
            state: Mutex::new(DownloadState {
                status: DownloadStatus::Active,
                file: Some(file),
                last_activity: now,
                speed: SpeedMeter::new(speed_window, now),
                finished_at: None,
            }),
            verification: Arc::new(Mutex::new(Verification::None)),
            events: Mutex::new(None),
        })
    }

    pub fn file_hash(&self) -> ContentHash {
        self.file_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segment_count(&self) -> u32 {
        self.segments.len()
    }

    pub fn status(&self) -> DownloadStatus {
        lock(&self.state).status
    }

    pub fn verification(&self) -> Verification {
        *lock(&self.verification)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Fraction of segments received
    pub fn progress(&self) -> f64 {
        self.segments.progress()
    }

    pub fn missing(&self) -> Vec<u32> {
        self.segments.missing()
    }

    /// Smoothed bytes per second
    pub fn rate(&self) -> f64 {
        lock(&self.state).speed.rate()
    }

    /// Bytes per second since the download started
    pub fn average(&self, now: Instant) -> f64 {
        let state = lock(&self.state);
        let end = state.finished_at.unwrap_or(now);
        let elapsed = end.saturating_duration_since(self.started_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_downloaded() as f64 / elapsed
    }

    /// Write one received segment at its offset
    pub fn try_write(&self, segment: u32, data: &[u8], channel: u8) -> Result<WriteOutcome> {
        let mut state = lock(&self.state);
        if state.status != DownloadStatus::Active {
            return Ok(WriteOutcome::Rejected);
        }

        let total = self.segments.len();
        if segment >= total {
            tracing::warn!(transfer = %self.id, segment, total, "segment index out of range");
            return Ok(WriteOutcome::Rejected);
        }
        let expected = segment_len(self.size, segment);
        if data.len() != expected {
            tracing::warn!(
                transfer = %self.id,
                segment,
                expected,
                actual = data.len(),
                "segment length mismatch"
            );
            return Ok(WriteOutcome::Rejected);
        }
        if self.segments.contains(segment)? {
            tracing::debug!(transfer = %self.id, segment, channel, "duplicate segment");
            return Ok(WriteOutcome::Duplicate);
        }

        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::InvalidData("download file closed".to_string()))?;
        write_segment(file, segment, data)?;

        let outcome = self.segments.add(segment)?;
        let downloaded = self
            .bytes_downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed)
            + data.len() as u64;
        state.last_activity = Instant::now();
        tracing::debug!(transfer = %self.id, segment, channel, downloaded, "segment written");

        let filled = outcome == AddOutcome::Filled;
        if !filled && downloaded < self.size {
            return Ok(WriteOutcome::Written);
        }
        if !filled || downloaded != self.size {
            tracing::error!(
                transfer = %self.id,
                downloaded,
                size = self.size,
                filled,
                "segment map and byte count disagree"
            );
            return Err(Error::InvalidData(format!(
                "{} of {} bytes with segment map {}",
                downloaded,
                self.size,
                if filled { "filled" } else { "incomplete" }
            )));
        }

        if let Some(file) = state.file.take() {
            if let Err(e) = file.sync_all() {
                tracing::warn!(transfer = %self.id, error = %e, "failed to sync download");
            }
        }
        state.status = DownloadStatus::Downloaded;
        state.finished_at = Some(Instant::now());
        drop(state);

        tracing::info!(transfer = %self.id, name = %self.name, size = self.size, "download finished");
        self.emit(TransferEvent::DownloadFinished(self.id));
        self.start_verification();
        Ok(WriteOutcome::Completed)
    }

    /// Emit the segments still missing if the retry period passed without activity
    pub fn poll_missing(&self, now: Instant) -> Option<Vec<u32>> {
        let mut state = lock(&self.state);
        if state.status != DownloadStatus::Active
            || now.saturating_duration_since(state.last_activity) < self.retry_interval
        {
            return None;
        }
        state.last_activity = now;
        drop(state);

        let segments = self.segments.missing();
        if segments.is_empty() {
            return None;
        }

        tracing::debug!(transfer = %self.id, missing = segments.len(), "requesting missing segments");
        self.emit(TransferEvent::MissingSegments {
            id: self.id,
            peer: self.peer,
            file_hash: self.file_hash,
            segments: segments.clone(),
        });
        Some(segments)
    }

    /// Take a throughput sample
    pub fn sample(&self, now: Instant) {
        let mut state = lock(&self.state);
        if state.status == DownloadStatus::Active {
            let total = self.bytes_downloaded();
            state.speed.sample(now, total);
        }
    }

    /// Hash the finished file on the blocking pool, or inline without a runtime
    fn start_verification(&self) {
        *lock(&self.verification) = Verification::Started;

        let path = self.path.clone();
        let job = VerifyJob {
            id: self.id,
            expected: self.file_hash,
            verification: self.verification.clone(),
            events: lock(&self.events).clone(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || job.run(&path));
            }
            Err(_) => job.run(&path),
        }
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }
}

/// Background hash check of a finished download
struct VerifyJob {
    id: TransferId,
    expected: ContentHash,
    verification: Arc<Mutex<Verification>>,
    events: Option<broadcast::Sender<TransferEvent>>,
}

impl VerifyJob {
    fn run(self, path: &Path) {
        let verification = match hash_file(path) {
            Ok(actual) if actual == self.expected => Verification::Positive,
            Ok(actual) => {
                tracing::warn!(
                    transfer = %self.id,
                    expected = %hex::encode(self.expected),
                    actual = %hex::encode(actual),
                    "downloaded file hash mismatch"
                );
                Verification::Negative
            }
            Err(e) => {
                tracing::error!(transfer = %self.id, error = %e, "failed to hash download");
                Verification::Failed
            }
        };

        *lock(&self.verification) = verification;
        tracing::info!(transfer = %self.id, ?verification, "download verified");
        if let Some(events) = self.events {
            let _ = events.send(TransferEvent::DownloadVerified {
                id: self.id,
                verification,
            });
        }
    }
}

impl Transfer for Download {
    fn id(&self) -> TransferId {
        self.id
    }

    fn peer(&self) -> PeerId {
        self.peer
    }

    fn is_active(&self) -> bool {
        self.status() == DownloadStatus::Active
    }

    /// Cancel an active download and delete the partial file
    fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status != DownloadStatus::Active {
            return false;
        }
        state.status = DownloadStatus::Cancelled;
        drop(state.file.take());
        drop(state);

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(transfer = %self.id, path = %self.path.display(), error = %e, "failed to delete partial download");
        }
        tracing::info!(transfer = %self.id, peer = %self.peer, name = %self.name, "download cancelled");
        self.emit(TransferEvent::FileRemoved(self.id));
        true
    }

    fn attach(&self, events: broadcast::Sender<TransferEvent>) {
        *lock(&self.events) = Some(events);
    }

    fn detach(&self) {
        lock(&self.events).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharenode_core::{hash_to_hex, SEGMENT_SIZE};
    use tempfile::TempDir;

    const SIZE: usize = 600_000;

    fn content() -> Vec<u8> {
        (0..SIZE).map(|i| (i % 239) as u8).collect()
    }

    fn entry(data: &[u8]) -> CatalogEntry {
        CatalogEntry {
            index: 0,
            name: "movie.mkv".to_string(),
            size: data.len() as u64,
            segment_count: sharenode_core::segment_count(data.len() as u64).unwrap(),
            hash: hash_to_hex(blake3::hash(data).as_bytes()),
        }
    }

    fn open(dir: &TempDir, entry: &CatalogEntry) -> Download {
        Download::open(
            TransferId::from_bytes([5; 16]),
            PeerId(2),
            entry,
            dir.path().join("movie.mkv"),
            Duration::from_secs(15),
            20,
        )
        .unwrap()
    }

    fn segment(data: &[u8], index: u32) -> &[u8] {
        let start = index as usize * SEGMENT_SIZE;
        &data[start..(start + SEGMENT_SIZE).min(data.len())]
    }

    #[test]
    fn test_writing_all_segments_completes_and_verifies() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));
        let (tx, mut rx) = broadcast::channel(8);
        download.attach(tx);

        assert_eq!(download.segment_count(), 3);
        assert_eq!(download.try_write(2, segment(&data, 2), 2).unwrap(), WriteOutcome::Written);
        assert_eq!(download.try_write(0, segment(&data, 0), 0).unwrap(), WriteOutcome::Written);
        assert_eq!(download.try_write(1, segment(&data, 1), 1).unwrap(), WriteOutcome::Completed);

        assert_eq!(download.status(), DownloadStatus::Downloaded);
        assert_eq!(download.bytes_downloaded(), SIZE as u64);
        assert_eq!(std::fs::read(download.path()).unwrap(), data);

        // No runtime here, so verification ran inline
        assert_eq!(download.verification(), Verification::Positive);
        assert!(matches!(rx.try_recv(), Ok(TransferEvent::DownloadFinished(_))));
        assert!(matches!(
            rx.try_recv(),
            Ok(TransferEvent::DownloadVerified { verification: Verification::Positive, .. })
        ));
    }

    #[test]
    fn test_duplicate_segment_counted_once() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));

        assert_eq!(download.try_write(0, segment(&data, 0), 0).unwrap(), WriteOutcome::Written);
        assert_eq!(download.try_write(0, segment(&data, 0), 3).unwrap(), WriteOutcome::Duplicate);
        assert_eq!(download.bytes_downloaded(), SEGMENT_SIZE as u64);
        assert!(WriteOutcome::Duplicate.should_ack());
    }

    #[test]
    fn test_bad_segments_rejected() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));

        assert_eq!(download.try_write(3, &[0u8; 10], 3).unwrap(), WriteOutcome::Rejected);
        assert_eq!(download.try_write(0, &[0u8; 10], 0).unwrap(), WriteOutcome::Rejected);
        assert_eq!(download.bytes_downloaded(), 0);
        assert!(!WriteOutcome::Rejected.should_ack());
    }

    #[test]
    fn test_hash_mismatch_is_negative() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let mut wrong = entry(&data);
        wrong.hash = hash_to_hex(&[0u8; 32]);
        let download = open(&dir, &wrong);

        for index in 0..3 {
            download.try_write(index, segment(&data, index), 0).unwrap();
        }
        assert_eq!(download.status(), DownloadStatus::Downloaded);
        assert_eq!(download.verification(), Verification::Negative);
    }

    #[test]
    fn test_cancel_deletes_partial_file() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));
        let (tx, mut rx) = broadcast::channel(8);
        download.attach(tx);

        download.try_write(0, segment(&data, 0), 0).unwrap();
        assert!(download.path().exists());

        assert!(download.cancel());
        assert!(!download.cancel());
        assert!(!download.is_active());
        assert!(!download.path().exists());
        assert!(matches!(rx.try_recv(), Ok(TransferEvent::FileRemoved(_))));

        assert_eq!(download.try_write(1, segment(&data, 1), 1).unwrap(), WriteOutcome::Rejected);
    }

    #[test]
    fn test_cancel_after_finish_is_noop() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));
        for index in 0..3 {
            download.try_write(index, segment(&data, index), 0).unwrap();
        }
        assert!(!download.cancel());
        assert!(download.path().exists());
    }

    #[test]
    fn test_missing_segments_after_idle_period() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));
        let (tx, mut rx) = broadcast::channel(8);
        download.attach(tx);

        download.try_write(1, segment(&data, 1), 1).unwrap();
        let now = Instant::now();
        assert!(download.poll_missing(now).is_none());

        let later = now + Duration::from_secs(16);
        assert_eq!(download.poll_missing(later), Some(vec![0, 2]));
        match rx.try_recv() {
            Ok(TransferEvent::MissingSegments { segments, peer, .. }) => {
                assert_eq!(segments, vec![0, 2]);
                assert_eq!(peer, PeerId(2));
            }
            other => panic!("Expected MissingSegments, got {:?}", other),
        }

        // The request itself restarts the period
        assert!(download.poll_missing(later + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_unwritable_destination_fails_open() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let result = Download::open(
            TransferId::from_bytes([5; 16]),
            PeerId(2),
            &entry(&data),
            dir.path().join("missing-dir").join("movie.mkv"),
            Duration::from_secs(15),
            20,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let mut huge = entry(&content());
        huge.size = (1u64 << 50) + 1;
        huge.segment_count = 1;
        let result = Download::open(
            TransferId::from_bytes([5; 16]),
            PeerId(2),
            &huge,
            dir.path().join("movie.mkv"),
            Duration::from_secs(15),
            20,
        );
        assert!(matches!(result, Err(Error::InvalidData(_))));
        assert!(!dir.path().join("movie.mkv").exists());
    }

    #[test]
    fn test_segment_count_must_match_size() {
        let dir = TempDir::new().unwrap();
        let mut lying = entry(&content());
        lying.segment_count = 1;
        let result = Download::open(
            TransferId::from_bytes([5; 16]),
            PeerId(2),
            &lying,
            dir.path().join("movie.mkv"),
            Duration::from_secs(15),
            20,
        );
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_existing_destination_not_truncated() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, &data).unwrap();

        let result = Download::open(
            TransferId::from_bytes([5; 16]),
            PeerId(2),
            &entry(&data),
            path.clone(),
            Duration::from_secs(15),
            20,
        );
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_speed_sampling() {
        let dir = TempDir::new().unwrap();
        let data = content();
        let download = open(&dir, &entry(&data));
        let start = Instant::now();

        download.try_write(0, segment(&data, 0), 0).unwrap();
        download.sample(start + Duration::from_secs(1));
        assert!(download.rate() > 0.0);
        assert!(download.average(start + Duration::from_secs(1)) > 0.0);
    }
}
