//! Integration tests for the Sharenode node
//!
//! Two or more nodes talk over the in-memory mock network. The tests drive
//! `poll`/`tick` by hand so each step can be observed.

use sharenode_client::{
    DownloadStatus, Node, NodeEvent, NodeSettings, Transfer, Verification,
};
use sharenode_core::transport::mock::{MockNetwork, MockTransport};
use sharenode_core::{
    hash_to_hex, Delivery, DisconnectReason, PeerId, Transport, TransportEvent, SEGMENT_SIZE,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

const FILE_SIZE: usize = 600_000;
const KEY: &str = "test-key";

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn settings(key: &str, disconnect_timeout: Duration) -> NodeSettings {
    NodeSettings {
        handshake_key: key.to_string(),
        handshake_timeout: disconnect_timeout,
        retry_interval: disconnect_timeout / 2,
        poll_interval: Duration::from_millis(5),
        speed_tick: Duration::from_millis(100),
        speed_window: 20,
    }
}

struct Harness {
    network: MockNetwork,
    server: Node,
    server_transport: Arc<MockTransport>,
    client: Node,
    client_transport: Arc<MockTransport>,
    dir: TempDir,
}

impl Harness {
    fn new(disconnect_timeout: Duration) -> Self {
        Self::with_keys(KEY, KEY, disconnect_timeout)
    }

    fn with_keys(server_key: &str, client_key: &str, disconnect_timeout: Duration) -> Self {
        let network = MockNetwork::new();
        let server_transport = network.transport(addr(1));
        let client_transport = network.transport(addr(2));
        let server = Node::new(server_transport.clone(), settings(server_key, disconnect_timeout));
        let client = Node::new(client_transport.clone(), settings(client_key, disconnect_timeout));
        Self {
            network,
            server,
            server_transport,
            client,
            client_transport,
            dir: TempDir::new().unwrap(),
        }
    }

    fn pump(&self) {
        for node in [&self.server, &self.client] {
            node.poll();
            node.tick(Instant::now());
        }
    }

    /// Pump both nodes until `done` holds or the deadline passes
    async fn pump_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.pump();
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Share an incompressible file on the server and wait for its hash
    fn share(&self, size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        blake3::Hasher::new()
            .update(b"sharenode test data")
            .finalize_xof()
            .fill(&mut data);
        let path = self.dir.path().join("movie.mkv");
        std::fs::write(&path, &data).unwrap();
        let file = self.server.share(&path).unwrap();
        file.compute_hash().unwrap();
        data
    }

    /// Connect the client and wait for the key exchange on both sides
    async fn connect(&self) -> PeerId {
        let peer = self.client.connect(addr(1)).unwrap();
        assert!(
            self.pump_until(Duration::from_secs(5), || {
                self.client.peers().list_established().len() == 1
                    && self.server.peers().list_established().len() == 1
            })
            .await,
            "key exchange did not complete"
        );
        peer
    }

    async fn fetch_catalog(&self, peer: PeerId) -> Vec<sharenode_core::CatalogEntry> {
        self.client.request_files_list(peer).unwrap();
        assert!(
            self.pump_until(Duration::from_secs(5), || self.client.remote_catalog(peer).is_some())
                .await
        );
        self.client.remote_catalog(peer).unwrap()
    }

    fn dest(&self) -> PathBuf {
        self.dir.path().join("downloaded.mkv")
    }
}

fn drain(events: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_end_to_end_transfer() {
    let h = Harness::new(Duration::from_secs(30));
    let data = h.share(FILE_SIZE);
    let mut client_events = h.client.subscribe();
    let mut server_events = h.server.subscribe();

    let peer = h.connect().await;
    let server_peer = h.server.peers().list_established()[0].clone();
    assert!(h.client.peers().get(peer).unwrap().is_enabled());
    assert!(server_peer.is_enabled());

    let entries = h.fetch_catalog(peer).await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.name, "movie.mkv");
    assert_eq!(entry.size, FILE_SIZE as u64);
    assert_eq!(entry.segment_count, 3);
    assert_eq!(entry.hash, hash_to_hex(blake3::hash(&data).as_bytes()));

    let download = h.client.start_download(peer, entry, &h.dest()).unwrap();
    assert!(
        h.pump_until(Duration::from_secs(10), || {
            download.verification() == Verification::Positive && h.server.uploads().is_empty()
        })
        .await,
        "download did not verify"
    );

    assert_eq!(download.status(), DownloadStatus::Downloaded);
    assert_eq!(download.bytes_downloaded(), FILE_SIZE as u64);
    assert!(download.missing().is_empty());
    assert_eq!(std::fs::read(h.dest()).unwrap(), data);

    // Finished downloads stay registered so the result can be inspected
    assert!(h.client.downloads().get(download.id()).is_some());

    // Segment k went out on channel k
    let segment_sends: Vec<_> = h
        .server_transport
        .sent()
        .into_iter()
        .filter(|(_, _, len)| *len > SEGMENT_SIZE / 4)
        .map(|(_, channel, _)| channel)
        .collect();
    assert_eq!(segment_sends, vec![0, 1, 2]);

    let client_events = drain(&mut client_events);
    assert!(client_events.contains(&NodeEvent::PeerReady(peer)));
    assert!(client_events.contains(&NodeEvent::DownloadFinished(download.id())));
    assert!(client_events.contains(&NodeEvent::DownloadVerified {
        id: download.id(),
        verification: Verification::Positive,
    }));
    assert!(drain(&mut server_events).contains(&NodeEvent::UploadFinished(download.id())));
}

#[tokio::test]
async fn test_server_disconnect_cancels_download() {
    let h = Harness::new(Duration::from_secs(30));
    h.share(FILE_SIZE);
    let mut client_events = h.client.subscribe();

    let peer = h.connect().await;
    let entries = h.fetch_catalog(peer).await;

    // Lose segments 1 and 2 so the transfer stalls after segment 0
    h.server_transport.drop_next(1, 10);
    h.server_transport.drop_next(2, 10);
    let download = h.client.start_download(peer, &entries[0], &h.dest()).unwrap();
    assert!(
        h.pump_until(Duration::from_secs(5), || {
            download.bytes_downloaded() == SEGMENT_SIZE as u64
        })
        .await
    );
    assert!(download.is_active());
    assert!(h.dest().exists());

    let server_peer = h.server.peers().list_established()[0].clone();
    server_peer.force_disconnect();

    assert!(
        h.pump_until(Duration::from_secs(5), || !download.is_active()).await,
        "download still active after disconnect"
    );
    assert_eq!(download.status(), DownloadStatus::Cancelled);
    assert!(!h.dest().exists());
    assert!(h.client.downloads().is_empty());
    assert!(h.client.peers().is_empty());
    assert!(h.server.uploads().is_empty());

    let events = drain(&mut client_events);
    assert!(events.contains(&NodeEvent::PeerDisconnected(peer)));
    assert!(events.contains(&NodeEvent::DownloadCancelled(download.id())));
}

#[tokio::test]
async fn test_lost_segment_is_requested_again() {
    let h = Harness::new(Duration::from_millis(400));
    let data = h.share(FILE_SIZE);
    let peer = h.connect().await;
    let entries = h.fetch_catalog(peer).await;

    h.server_transport.drop_next(1, 1);
    let download = h.client.start_download(peer, &entries[0], &h.dest()).unwrap();

    assert!(
        h.pump_until(Duration::from_secs(10), || {
            download.verification() == Verification::Positive
        })
        .await,
        "lost segment was never recovered"
    );
    assert_eq!(std::fs::read(h.dest()).unwrap(), data);

    let channel_one_sends = h
        .server_transport
        .sent()
        .iter()
        .filter(|(_, channel, len)| *channel == 1 && *len > SEGMENT_SIZE / 4)
        .count();
    assert!(channel_one_sends >= 2);
}

#[tokio::test]
async fn test_resend_requests_spread_over_channels() {
    // Eight segments; segments 3, 4 and 5 are lost on their way out
    const EIGHT_SEGMENTS: usize = 2_000_000;
    let h = Harness::new(Duration::from_millis(400));
    let data = h.share(EIGHT_SEGMENTS);
    let peer = h.connect().await;
    let entries = h.fetch_catalog(peer).await;
    assert_eq!(entries[0].segment_count, 8);

    for channel in 3..6 {
        h.server_transport.drop_next(channel, 1);
    }
    let download = h.client.start_download(peer, &entries[0], &h.dest()).unwrap();
    assert!(
        h.pump_until(Duration::from_secs(5), || download.missing() == vec![3, 4, 5])
            .await
    );
    let before = h.client_transport.sent().len();

    assert!(
        h.pump_until(Duration::from_secs(10), || {
            download.verification() == Verification::Positive
        })
        .await,
        "lost segments were never recovered"
    );
    assert_eq!(std::fs::read(h.dest()).unwrap(), data);

    // The three requests go out back to back, one per channel
    let request_channels: Vec<u8> = h.client_transport.sent()[before..]
        .iter()
        .take(3)
        .map(|(_, channel, _)| *channel)
        .collect();
    assert_eq!(request_channels, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_wrong_handshake_key_rejected() {
    let h = Harness::with_keys(KEY, "not-the-key", Duration::from_secs(30));
    h.client.connect(addr(1)).unwrap();

    // A second attempt while the first is pending is refused
    assert!(h.client.connect(addr(1)).is_err());

    h.pump_until(Duration::from_millis(200), || false).await;
    assert!(h.client.peers().is_empty());
    assert!(h.server.peers().is_empty());

    // The rejected attempt no longer blocks a new one
    assert!(h.client.connect(addr(1)).is_ok());
}

#[tokio::test]
async fn test_tampered_payload_is_dropped() {
    let h = Harness::new(Duration::from_secs(30));
    h.share(1_000);
    let peer = h.connect().await;

    // Garbage straight onto the wire, bypassing the secure channel
    h.client_transport
        .send(peer, vec![0xFF; 64], 3, Delivery::ReliableOrdered)
        .unwrap();
    h.pump();

    // The connection survives and still works
    assert_eq!(h.server.peers().list_established().len(), 1);
    assert_eq!(h.fetch_catalog(peer).await.len(), 1);
}

#[tokio::test]
async fn test_silent_peer_dropped_after_handshake_timeout() {
    let h = Harness::new(Duration::from_millis(100));
    let raw = h.network.transport(addr(9));
    let raw_peer = raw.connect(addr(1), KEY).unwrap();

    assert!(
        h.pump_until(Duration::from_secs(1), || h.server.peers().len() == 1)
            .await
    );
    assert!(
        h.pump_until(Duration::from_secs(5), || h.server.peers().is_empty())
            .await,
        "silent peer was never dropped"
    );

    let disconnected = raw.poll_events().into_iter().any(|event| {
        matches!(
            event,
            TransportEvent::PeerDisconnected {
                peer,
                reason: DisconnectReason::RemoteClosed,
            } if peer == raw_peer
        )
    });
    assert!(disconnected);
}

#[tokio::test]
async fn test_client_cancel_stops_upload() {
    let h = Harness::new(Duration::from_secs(30));
    h.share(FILE_SIZE);
    let peer = h.connect().await;
    let entries = h.fetch_catalog(peer).await;

    h.server_transport.drop_next(1, 10);
    h.server_transport.drop_next(2, 10);
    let download = h.client.start_download(peer, &entries[0], &h.dest()).unwrap();
    assert!(
        h.pump_until(Duration::from_secs(5), || h.server.uploads().len() == 1
            && download.bytes_downloaded() > 0)
            .await
    );

    assert!(h.client.cancel_download(download.id()));
    assert!(!h.client.cancel_download(download.id()));
    assert!(
        h.pump_until(Duration::from_secs(5), || h.server.uploads().is_empty())
            .await
    );
    assert!(!h.dest().exists());
    assert!(h.client.downloads().is_empty());
}

#[tokio::test]
async fn test_unknown_file_request_refused() {
    let h = Harness::new(Duration::from_secs(30));
    h.share(1_000);
    let peer = h.connect().await;
    let mut entry = h.fetch_catalog(peer).await.remove(0);
    entry.hash = hash_to_hex(&[0xAB; 32]);

    let download = h.client.start_download(peer, &entry, &h.dest()).unwrap();
    assert!(
        h.pump_until(Duration::from_secs(5), || !download.is_active())
            .await
    );
    assert!(h.client.downloads().is_empty());
    assert!(h.server.uploads().is_empty());
}

#[tokio::test]
async fn test_second_download_to_same_path_refused() {
    let h = Harness::new(Duration::from_secs(30));
    h.share(FILE_SIZE);
    let peer = h.connect().await;
    let entries = h.fetch_catalog(peer).await;

    let _first = h.client.start_download(peer, &entries[0], &h.dest()).unwrap();
    assert!(h.client.start_download(peer, &entries[0], &h.dest()).is_err());
    assert_eq!(h.client.downloads().len(), 1);
}
