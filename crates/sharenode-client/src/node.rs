//! Node: message dispatch and timer service
//!
//! A node is client and server at once. It drains transport events, runs
//! the key exchange for every new peer, answers catalog and file requests,
//! writes incoming segments into downloads, and drives the periodic work
//! (handshake deadlines, throughput samples, missing-segment requests).
//!
//! Cleanup is driven by notifications: a peer that disconnects raises
//! [`PeerEvent::Removed`], and the node cancels every transfer with that
//! peer in both registries.

use dashmap::DashMap;
use sharenode_core::wire::{FileRequest, FileSegment, FilesList, Message, RequestKind};
use sharenode_core::{
    lock, CatalogEntry, ConnectionRequest, ContentHash, Error, PeerId, Result, TransferId,
    TransportEvent, TransportHandle, CHANNEL_COUNT,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::catalog::{SharedCatalog, SharedFile};
use crate::config::Config;
use crate::download::{Download, DownloadStatus, Verification, WriteOutcome};
use crate::peer::SecurePeer;
use crate::peers::{PeerEvent, PeerRegistry, EVENT_CAPACITY};
use crate::registry::{DownloadRegistry, Transfer, TransferEvent, UploadRegistry};
use crate::upload::{AckOutcome, Upload};

/// Channel used for catalog traffic and transfer control messages
const CONTROL_CHANNEL: u8 = 0;

/// Application-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Key exchange with the peer completed
    PeerReady(PeerId),
    PeerDisconnected(PeerId),
    CatalogReceived {
        peer: PeerId,
        entries: Vec<CatalogEntry>,
    },
    DownloadFinished(TransferId),
    DownloadVerified {
        id: TransferId,
        verification: Verification,
    },
    DownloadCancelled(TransferId),
    UploadFinished(TransferId),
}

/// Timing and identity settings of a node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub handshake_key: String,
    pub handshake_timeout: Duration,
    pub retry_interval: Duration,
    pub poll_interval: Duration,
    pub speed_tick: Duration,
    pub speed_window: usize,
}

impl From<&Config> for NodeSettings {
    fn from(config: &Config) -> Self {
        Self {
            handshake_key: config.network.handshake_key.clone(),
            handshake_timeout: config.network.handshake_timeout(),
            retry_interval: config.network.retry_interval(),
            poll_interval: config.network.poll_interval(),
            speed_tick: config.transfer.speed_tick(),
            speed_window: config.transfer.speed_window,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

struct Subscriptions {
    peers: broadcast::Receiver<PeerEvent>,
    downloads: broadcast::Receiver<TransferEvent>,
    uploads: broadcast::Receiver<TransferEvent>,
}

pub struct Node {
    settings: NodeSettings,
    transport: TransportHandle,
    peers: PeerRegistry,
    catalog: SharedCatalog,
    downloads: DownloadRegistry,
    uploads: UploadRegistry,
    remote_catalogs: DashMap<PeerId, Vec<CatalogEntry>>,
    /// Outbound connections awaiting `PeerConnected`, by expected endpoint
    pending: DashMap<PeerId, SocketAddr>,
    subscriptions: Mutex<Subscriptions>,
    last_speed_tick: Mutex<Instant>,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    pub fn new(transport: TransportHandle, settings: NodeSettings) -> Self {
        let peers = PeerRegistry::new();
        let downloads = DownloadRegistry::new();
        let uploads = UploadRegistry::new();
        let subscriptions = Subscriptions {
            peers: peers.subscribe(),
            downloads: downloads.subscribe(),
            uploads: uploads.subscribe(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(endpoint = %transport.local_endpoint(), "node created");
        Self {
            settings,
            transport,
            peers,
            catalog: SharedCatalog::new(),
            downloads,
            uploads,
            remote_catalogs: DashMap::new(),
            pending: DashMap::new(),
            subscriptions: Mutex::new(subscriptions),
            last_speed_tick: Mutex::new(Instant::now()),
            events,
        }
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.transport.local_endpoint()
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    pub fn downloads(&self) -> &DownloadRegistry {
        &self.downloads
    }

    pub fn uploads(&self) -> &UploadRegistry {
        &self.uploads
    }

    /// Last catalog received from a peer
    pub fn remote_catalog(&self, peer: PeerId) -> Option<Vec<CatalogEntry>> {
        self.remote_catalogs.get(&peer).map(|e| e.value().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Start connecting to a server. Refused if a connection to that endpoint exists.
    pub fn connect(&self, endpoint: SocketAddr) -> Result<PeerId> {
        let pending = self.pending.iter().any(|e| *e.value() == endpoint);
        if pending || self.peers.is_connected_to_endpoint(endpoint) {
            return Err(Error::ConnectionFailed(format!(
                "already connected to {}",
                endpoint
            )));
        }

        let peer = self
            .transport
            .connect(endpoint, &self.settings.handshake_key)?;
        self.pending.insert(peer, endpoint);
        tracing::info!(peer = %peer, endpoint = %endpoint, "connecting");
        Ok(peer)
    }

    /// Ask a peer for its catalog
    pub fn request_files_list(&self, peer: PeerId) -> Result<()> {
        let peer = self.established_peer(peer)?;
        peer.send(&Message::FilesListRequest, CONTROL_CHANNEL)
    }

    /// Start downloading a catalog entry from a peer into `dest`
    pub fn start_download(
        &self,
        peer: PeerId,
        entry: &CatalogEntry,
        dest: &Path,
    ) -> Result<Arc<Download>> {
        let server = self.established_peer(peer)?;
        if self.downloads.find_by_same_path(dest).is_some() {
            return Err(Error::InvalidData(format!(
                "{} is already being downloaded",
                dest.display()
            )));
        }

        let id = TransferId::generate()?;
        let download = Arc::new(Download::open(
            id,
            peer,
            entry,
            dest.to_path_buf(),
            self.settings.retry_interval,
            self.settings.speed_window,
        )?);
        self.downloads.add(download.clone());

        let request = Message::FileRequest(FileRequest {
            transfer_id: id,
            file_hash: download.file_hash(),
            kind: RequestKind::WholeFile,
        });
        if let Err(e) = server.send(&request, CONTROL_CHANNEL) {
            download.cancel();
            self.downloads.remove(id);
            return Err(e);
        }
        Ok(download)
    }

    /// Cancel a download and tell the server to stop sending
    pub fn cancel_download(&self, id: TransferId) -> bool {
        let Some(download) = self.downloads.get(id) else {
            return false;
        };
        let cancelled = download.cancel();
        if cancelled {
            if let Some(peer) = self.peers.get(download.peer()) {
                let message = Message::CancelDownload { transfer_id: id };
                if let Err(e) = peer.send(&message, CONTROL_CHANNEL) {
                    tracing::debug!(transfer = %id, error = %e, "could not notify server");
                }
            }
        }
        self.downloads.remove(id);
        cancelled
    }

    /// Add a file to the local catalog
    pub fn share(&self, path: &Path) -> Result<Arc<SharedFile>> {
        self.catalog.share(path)
    }

    /// Drain and handle all pending transport events
    pub fn poll(&self) {
        for event in self.transport.poll_events() {
            self.handle_transport_event(event);
        }
        self.drain_notifications();
    }

    /// Run the periodic work due at `now`
    pub fn tick(&self, now: Instant) {
        let sample = {
            let mut last = lock(&self.last_speed_tick);
            if now.saturating_duration_since(*last) >= self.settings.speed_tick {
                *last = now;
                true
            } else {
                false
            }
        };

        for peer in self.peers.all() {
            if peer.handshake_expired(now) {
                tracing::warn!(peer = %peer.id(), "handshake timed out");
                peer.force_disconnect();
            } else if sample {
                peer.tick(now);
            }
        }

        for download in self.downloads.list() {
            if sample {
                download.sample(now);
            }
            download.poll_missing(now);
        }

        self.drain_notifications();
    }

    /// Poll and tick until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("node shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.poll();
                    self.tick(Instant::now());
                }
            }
        }
    }

    fn established_peer(&self, id: PeerId) -> Result<Arc<SecurePeer>> {
        match self.peers.get(id) {
            Some(peer) if peer.is_enabled() => Ok(peer),
            Some(_) => Err(Error::NotEnabled),
            None => Err(Error::ConnectionFailed(format!("unknown peer {}", id))),
        }
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionRequest(request) => self.handle_connection_request(request),
            TransportEvent::PeerConnected { peer, endpoint } => {
                self.handle_peer_connected(peer, endpoint)
            }
            TransportEvent::PeerDisconnected { peer, reason } => {
                tracing::info!(peer = %peer, ?reason, "transport disconnected");
                self.pending.remove(&peer);
                if let Some(peer) = self.peers.get(peer) {
                    peer.disconnect();
                }
            }
            TransportEvent::Received {
                peer,
                channel,
                data,
            } => self.handle_received(peer, channel, &data),
        }
    }

    fn handle_connection_request(&self, request: ConnectionRequest) {
        if self
            .transport
            .accept_if_key(&request, &self.settings.handshake_key)
        {
            tracing::debug!(endpoint = %request.endpoint, "accepted connection request");
        } else {
            tracing::warn!(endpoint = %request.endpoint, "rejected connection request");
        }
    }

    fn handle_peer_connected(&self, id: PeerId, endpoint: SocketAddr) {
        if let Some((_, expected)) = self.pending.remove(&id) {
            if expected != endpoint {
                tracing::warn!(peer = %id, %expected, %endpoint, "unexpected server endpoint");
                self.transport.disconnect(id);
                return;
            }
        }

        let peer = match SecurePeer::new(
            id,
            endpoint,
            self.transport.clone(),
            self.settings.handshake_timeout,
        ) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                tracing::error!(peer = %id, error = %e, "failed to create session");
                self.transport.disconnect(id);
                return;
            }
        };

        if !self.peers.add(peer.clone()) {
            return;
        }
        if let Err(e) = peer.send_public_keys() {
            tracing::warn!(peer = %id, error = %e, "failed to send public keys");
        }
    }

    fn handle_received(&self, id: PeerId, channel: u8, data: &[u8]) {
        let Some(peer) = self.peers.get(id) else {
            tracing::debug!(peer = %id, "payload from unknown peer");
            return;
        };

        if !peer.is_enabled() {
            if channel != sharenode_core::HANDSHAKE_CHANNEL {
                tracing::warn!(peer = %id, channel, "payload before key exchange");
                return;
            }
            if peer.handle_handshake(data).is_ok() {
                self.emit(NodeEvent::PeerReady(id));
            }
            return;
        }

        if let Some(message) = peer.receive(data) {
            self.dispatch(&peer, message);
        }
    }

    fn dispatch(&self, peer: &Arc<SecurePeer>, message: Message) {
        match message {
            Message::FilesListRequest => self.send_files_list(peer),
            Message::FilesList(list) => self.handle_files_list(peer, list),
            Message::FileRequest(request) => self.handle_file_request(peer, request),
            Message::FileSegment(segment) => self.handle_segment(peer, segment),
            Message::FileSegmentAck {
                transfer_id,
                segment,
            } => self.handle_ack(peer, transfer_id, segment),
            Message::CancelDownload { transfer_id } => self.handle_cancel(peer, transfer_id),
        }
    }

    fn send_files_list(&self, peer: &SecurePeer) {
        let result = self
            .catalog
            .files_list()
            .and_then(|list| peer.send(&Message::FilesList(list), CONTROL_CHANNEL));
        if let Err(e) = result {
            tracing::warn!(peer = %peer.id(), error = %e, "failed to send catalog");
        }
    }

    fn handle_files_list(&self, peer: &SecurePeer, list: FilesList) {
        match list.entries() {
            Ok(entries) => {
                tracing::info!(peer = %peer.id(), files = entries.len(), "catalog received");
                self.remote_catalogs.insert(peer.id(), entries.clone());
                self.emit(NodeEvent::CatalogReceived {
                    peer: peer.id(),
                    entries,
                });
            }
            Err(e) => tracing::warn!(peer = %peer.id(), error = %e, "discarding catalog"),
        }
    }

    fn handle_file_request(&self, peer: &Arc<SecurePeer>, request: FileRequest) {
        match request.kind {
            RequestKind::WholeFile => self.start_upload(peer, request.transfer_id, &request.file_hash),
            RequestKind::Resend(segment) => {
                let Some(upload) = self.owned(&self.uploads, peer, request.transfer_id) else {
                    return;
                };
                if !upload.is_active() {
                    return;
                }
                upload.add_resend_count();
                let channel = (segment % CHANNEL_COUNT as u32) as u8;
                if let Err(e) = send_segment(peer, &upload, segment, channel) {
                    tracing::warn!(transfer = %upload.id(), segment, error = %e, "resend failed");
                }
            }
        }
    }

    fn start_upload(&self, peer: &Arc<SecurePeer>, id: TransferId, hash: &ContentHash) {
        if self.uploads.get(id).is_some() {
            tracing::debug!(transfer = %id, "upload already running");
            return;
        }

        let upload = self
            .catalog
            .find_by_hash(hash)
            .ok_or_else(|| Error::InvalidData(format!("not sharing {}", hex::encode(hash))))
            .and_then(|file| Upload::open(id, peer.id(), &file));
        let upload = match upload {
            Ok(upload) => Arc::new(upload),
            Err(e) => {
                tracing::warn!(peer = %peer.id(), transfer = %id, error = %e, "refusing file request");
                let refusal = Message::CancelDownload { transfer_id: id };
                if let Err(e) = peer.send(&refusal, CONTROL_CHANNEL) {
                    tracing::debug!(transfer = %id, error = %e, "could not send refusal");
                }
                return;
            }
        };

        if !self.uploads.add(upload.clone()) {
            return;
        }
        tracing::info!(peer = %peer.id(), transfer = %id, name = upload.name(), "upload started");

        let peer = peer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || stream_upload(&peer, &upload));
            }
            Err(_) => stream_upload(&peer, &upload),
        }
    }

    fn handle_segment(&self, peer: &SecurePeer, segment: FileSegment) {
        let id = segment.transfer_id;
        let Some(download) = self.owned(&self.downloads, peer, id) else {
            return;
        };

        // A finished download still acks late duplicates so the upload can finish
        let finished = download.status() == DownloadStatus::Downloaded;
        match download.try_write(segment.segment, &segment.data, segment.channel) {
            Ok(outcome) if outcome.should_ack() || finished => {
                let ack = Message::FileSegmentAck {
                    transfer_id: id,
                    segment: segment.segment,
                };
                if let Err(e) = peer.send(&ack, segment.channel % CHANNEL_COUNT) {
                    tracing::warn!(transfer = %id, segment = segment.segment, error = %e, "ack failed");
                }
                if outcome == WriteOutcome::Completed {
                    tracing::debug!(transfer = %id, "all segments received");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(transfer = %id, segment = segment.segment, error = %e, "segment write failed")
            }
        }
    }

    fn handle_ack(&self, peer: &SecurePeer, id: TransferId, segment: u32) {
        let Some(upload) = self.owned(&self.uploads, peer, id) else {
            return;
        };
        if upload.add_ack(segment) == AckOutcome::Finished {
            self.uploads.remove(id);
        }
    }

    fn handle_cancel(&self, peer: &SecurePeer, id: TransferId) {
        if let Some(upload) = self.owned(&self.uploads, peer, id) {
            upload.cancel();
            self.uploads.remove(id);
        } else if let Some(download) = self.owned(&self.downloads, peer, id) {
            tracing::info!(transfer = %id, "server refused or cancelled download");
            download.cancel();
            self.downloads.remove(id);
        }
    }

    /// Look up a transfer that belongs to `peer`
    fn owned<T: Transfer>(
        &self,
        registry: &crate::registry::TransferRegistry<T>,
        peer: &SecurePeer,
        id: TransferId,
    ) -> Option<Arc<T>> {
        let transfer = registry.get(id)?;
        if transfer.peer() != peer.id() {
            tracing::warn!(peer = %peer.id(), transfer = %id, "transfer belongs to another peer");
            return None;
        }
        Some(transfer)
    }

    fn drain_notifications(&self) {
        let mut subscriptions = lock(&self.subscriptions);

        while let Some(event) = next_event(&mut subscriptions.peers) {
            if let PeerEvent::Removed(peer) = event {
                self.remote_catalogs.remove(&peer);
                self.downloads.cancel_all_for_peer(peer);
                self.uploads.cancel_all_for_peer(peer);
                self.emit(NodeEvent::PeerDisconnected(peer));
            }
        }

        while let Some(event) = next_event(&mut subscriptions.downloads) {
            match event {
                TransferEvent::DownloadFinished(id) => self.emit(NodeEvent::DownloadFinished(id)),
                TransferEvent::DownloadVerified { id, verification } => {
                    self.emit(NodeEvent::DownloadVerified { id, verification })
                }
                TransferEvent::FileRemoved(id) => self.emit(NodeEvent::DownloadCancelled(id)),
                TransferEvent::MissingSegments {
                    id,
                    peer,
                    file_hash,
                    segments,
                } => self.request_missing(id, peer, file_hash, &segments),
                _ => {}
            }
        }

        while let Some(event) = next_event(&mut subscriptions.uploads) {
            if let TransferEvent::UploadFinished(id) = event {
                self.emit(NodeEvent::UploadFinished(id));
            }
        }
    }

    /// Re-request missing segments, spreading the requests over the channels
    fn request_missing(&self, id: TransferId, peer: PeerId, file_hash: ContentHash, segments: &[u32]) {
        let Some(peer) = self.peers.get(peer) else {
            return;
        };
        tracing::info!(transfer = %id, missing = segments.len(), "requesting resend");

        for (i, &segment) in segments.iter().enumerate() {
            let request = Message::FileRequest(FileRequest {
                transfer_id: id,
                file_hash,
                kind: RequestKind::Resend(segment),
            });
            let channel = (i % CHANNEL_COUNT as usize) as u8;
            if let Err(e) = peer.send(&request, channel) {
                tracing::warn!(transfer = %id, segment, error = %e, "resend request failed");
                return;
            }
        }
    }
}

/// Next buffered notification, skipping over any lag
fn next_event<E: Clone>(receiver: &mut broadcast::Receiver<E>) -> Option<E> {
    loop {
        match receiver.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification receiver lagged");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
        }
    }
}

fn send_segment(peer: &SecurePeer, upload: &Upload, segment: u32, channel: u8) -> Result<()> {
    let data = upload.read_segment(segment)?;
    let message = Message::FileSegment(FileSegment {
        transfer_id: upload.id(),
        segment,
        channel,
        data,
    });
    peer.send(&message, channel)
}

/// Send every unacknowledged segment, checking for cancellation before each one
fn stream_upload(peer: &SecurePeer, upload: &Upload) {
    for segment in 0..upload.segment_count() {
        if !upload.is_active() || peer.is_disconnected() {
            tracing::debug!(transfer = %upload.id(), segment, "upload stream stopped");
            return;
        }
        if upload.is_acked(segment) {
            continue;
        }

        let channel = (segment % CHANNEL_COUNT as u32) as u8;
        if let Err(e) = send_segment(peer, upload, segment, channel) {
            tracing::warn!(transfer = %upload.id(), segment, error = %e, "failed to send segment");
            return;
        }
    }
    tracing::debug!(transfer = %upload.id(), segments = upload.segment_count(), "upload stream complete");
}

/// Default destination for a catalog entry
pub fn download_path(dir: &Path, entry: &CatalogEntry) -> PathBuf {
    dir.join(sharenode_core::file::display_name(Path::new(&entry.name)))
}
