//! Sharenode Client Library
//!
//! A file-sharing node built on `sharenode-core`: secure peers, the shared
//! catalog, uploads, downloads and the node that dispatches between them.

pub mod catalog;
pub mod config;
pub mod download;
pub mod node;
pub mod peer;
pub mod peers;
pub mod registry;
pub mod speed;
pub mod upload;

pub use catalog::{SharedCatalog, SharedFile};
pub use config::Config;
pub use download::{Download, DownloadStatus, Verification, WriteOutcome};
pub use node::{Node, NodeEvent, NodeSettings};
pub use peer::SecurePeer;
pub use peers::{PeerEvent, PeerRegistry};
pub use registry::{DownloadRegistry, Transfer, TransferEvent, UploadRegistry};
pub use upload::{AckOutcome, Upload, UploadStatus};
