//! Sharenode Core - Secure channel, wire codec and segment bookkeeping
//!
//! This crate provides the building blocks shared by every Sharenode peer:
//! the per-peer crypto session, the message codec, the segment map used by
//! uploads and downloads, and the transport abstraction.

pub mod crypto;
pub mod error;
pub mod file;
pub mod segment;
pub mod transport;
pub mod types;
pub mod wire;

pub use crypto::{CryptoSession, PublicKeys};
pub use error::{Error, Result};
pub use segment::{AddOutcome, SegmentMap};
pub use transport::{
    ConnectionRequest, Delivery, DisconnectReason, Transport, TransportEvent, TransportHandle,
};
pub use types::*;
pub use wire::{FileRequest, FileSegment, FilesList, HandshakeKeys, Message, MessageType, RequestKind, SecureFrame};

use std::sync::{Mutex, MutexGuard};

/// Segment size: 256 KiB
pub const SEGMENT_SIZE: usize = 1 << 18;

/// Most segments a single file may have (1 TiB at 256 KiB per segment)
pub const MAX_SEGMENT_COUNT: u32 = 1 << 22;

/// Number of logical transport channels
pub const CHANNEL_COUNT: u8 = 8;

/// Channel used for the cleartext key exchange
pub const HANDSHAKE_CHANNEL: u8 = 0;

/// Handshake and disconnect timeout in milliseconds
pub const DISCONNECT_TIMEOUT_MS: u64 = 30_000;

/// Lock a mutex, recovering the data if a previous holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
