//! Secure peer
//!
//! Wraps one transport connection and its [`CryptoSession`]. Outbound
//! messages are compressed, encrypted, signed and framed; inbound frames are
//! verified before anything is decrypted. A frame that fails any step is
//! dropped without surfacing an error.

use sharenode_core::wire::{HandshakeKeys, Message, SecureFrame};
use sharenode_core::{
    lock, CryptoSession, Delivery, Error, PeerId, PublicKeys, Result, TransportHandle,
    CHANNEL_COUNT, HANDSHAKE_CHANNEL,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::speed::{SpeedMeter, DEFAULT_WINDOW};

/// Callback run once when the peer disconnects
pub type DisconnectHook = Box<dyn FnOnce(PeerId) + Send>;

struct Rates {
    download: SpeedMeter,
    upload: SpeedMeter,
}

pub struct SecurePeer {
    id: PeerId,
    endpoint: SocketAddr,
    transport: TransportHandle,
    crypto: RwLock<CryptoSession>,
    connected_at: Instant,
    handshake_deadline: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    rates: Mutex<Rates>,
    disconnected: AtomicBool,
    on_disconnect: Mutex<Option<DisconnectHook>>,
}

impl fmt::Debug for SecurePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePeer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("enabled", &self.is_enabled())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl SecurePeer {
    /// Wrap a freshly connected transport peer with a new crypto session
    pub fn new(
        id: PeerId,
        endpoint: SocketAddr,
        transport: TransportHandle,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let now = Instant::now();
        Ok(Self {
            id,
            endpoint,
            transport,
            crypto: RwLock::new(CryptoSession::generate()?),
            connected_at: now,
            handshake_deadline: now + handshake_timeout,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            rates: Mutex::new(Rates {
                download: SpeedMeter::new(DEFAULT_WINDOW, now),
                upload: SpeedMeter::new(DEFAULT_WINDOW, now),
            }),
            disconnected: AtomicBool::new(false),
            on_disconnect: Mutex::new(None),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_enabled(&self) -> bool {
        self.crypto
            .read()
            .map(|crypto| crypto.is_enabled())
            .unwrap_or(false)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn public_keys(&self) -> Result<PublicKeys> {
        self.crypto
            .read()
            .map(|crypto| crypto.public_keys())
            .map_err(|_| Error::Crypto("session lock poisoned".to_string()))
    }

    /// Send our agreement and signing keys in the clear on the handshake channel
    pub fn send_public_keys(&self) -> Result<()> {
        let frame = HandshakeKeys::from(self.public_keys()?).encode();
        self.transmit(frame, HANDSHAKE_CHANNEL)?;
        tracing::debug!(peer = %self.id, "sent public keys");
        Ok(())
    }

    /// Handle a cleartext handshake frame from the remote side
    pub fn handle_handshake(&self, data: &[u8]) -> Result<()> {
        match HandshakeKeys::decode(data) {
            Ok(keys) => self.apply_keys(&keys.agreement, &keys.signing),
            Err(e) => {
                tracing::warn!(peer = %self.id, error = %e, "malformed handshake frame");
                self.force_disconnect();
                Err(e)
            }
        }
    }

    /// Apply the remote keys. Malformed key material drops the connection.
    pub fn apply_keys(&self, agreement: &[u8], signing: &[u8]) -> Result<()> {
        let result = match self.crypto.write() {
            Ok(mut crypto) => crypto.set_remote_keys(agreement, signing),
            Err(_) => Err(Error::Crypto("session lock poisoned".to_string())),
        };

        match result {
            Ok(()) => {
                tracing::info!(peer = %self.id, endpoint = %self.endpoint, "secure session established");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(peer = %self.id, error = %e, "rejecting peer keys");
                self.force_disconnect();
                Err(e)
            }
        }
    }

    /// Compress, encrypt, sign and frame a message, then hand it to the transport
    pub fn send(&self, message: &Message, channel: u8) -> Result<()> {
        let frame = self.seal(&message.encode())?;
        self.transmit(frame, channel)
    }

    /// Build the secure frame for an application payload
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = lz4_compress(plaintext);
        let crypto = self
            .crypto
            .read()
            .map_err(|_| Error::Crypto("session lock poisoned".to_string()))?;

        let (ciphertext, iv) = crypto.encrypt(&compressed)?;
        let signature = crypto.sign(&ciphertext);
        Ok(SecureFrame {
            ciphertext,
            signature: signature.to_vec(),
            iv: iv.to_vec(),
        }
        .encode())
    }

    /// Verify and decrypt a secure frame.
    ///
    /// Returns `None` for anything that fails: no session yet, bad framing,
    /// bad signature, bad ciphertext or bad compression.
    pub fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        let crypto = self.crypto.read().ok()?;
        if !crypto.is_enabled() {
            tracing::warn!(peer = %self.id, "dropping frame received before key exchange");
            return None;
        }

        let frame = match SecureFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %self.id, error = %e, "dropping malformed frame");
                return None;
            }
        };

        if !crypto.verify(&frame.ciphertext, &frame.signature) {
            tracing::warn!(peer = %self.id, "dropping frame with bad signature");
            return None;
        }

        let compressed = match crypto.decrypt(&frame.ciphertext, &frame.iv) {
            Ok(compressed) => compressed,
            Err(e) => {
                tracing::warn!(peer = %self.id, error = %e, "dropping undecryptable frame");
                return None;
            }
        };

        match lz4_decompress(&compressed) {
            Ok(plaintext) => {
                self.bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Some(plaintext)
            }
            Err(e) => {
                tracing::warn!(peer = %self.id, error = %e, "dropping frame");
                None
            }
        }
    }

    /// Open a frame and decode the application message inside it
    pub fn receive(&self, data: &[u8]) -> Option<Message> {
        let plaintext = self.open(data)?;
        match Message::decode(&plaintext) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(peer = %self.id, error = %e, "discarding invalid message");
                None
            }
        }
    }

    /// Register the callback run when this peer disconnects, replacing any previous one
    pub fn on_disconnect(&self, hook: DisconnectHook) {
        *lock(&self.on_disconnect) = Some(hook);
    }

    /// Drop the disconnect callback without running it
    pub fn clear_disconnect_hook(&self) {
        lock(&self.on_disconnect).take();
    }

    /// Mark the peer gone and notify the registered hook. Runs at most once.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(peer = %self.id, endpoint = %self.endpoint, "peer disconnected");

        // Take the hook first so it may call back into clear_disconnect_hook
        let hook = lock(&self.on_disconnect).take();
        if let Some(hook) = hook {
            hook(self.id);
        }
    }

    /// Close the transport connection and disconnect locally
    pub fn force_disconnect(&self) {
        self.transport.disconnect(self.id);
        self.disconnect();
    }

    /// Whether the key exchange missed its deadline
    pub fn handshake_expired(&self, now: Instant) -> bool {
        !self.is_disconnected() && !self.is_enabled() && now >= self.handshake_deadline
    }

    /// Sample the byte-rate counters
    pub fn tick(&self, now: Instant) {
        if self.is_disconnected() {
            return;
        }
        let mut rates = lock(&self.rates);
        rates
            .download
            .sample(now, self.bytes_received.load(Ordering::Relaxed));
        rates
            .upload
            .sample(now, self.bytes_sent.load(Ordering::Relaxed));
    }

    /// Smoothed inbound bytes per second
    pub fn download_rate(&self) -> f64 {
        lock(&self.rates).download.rate()
    }

    /// Smoothed outbound bytes per second
    pub fn upload_rate(&self) -> f64 {
        lock(&self.rates).upload.rate()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn transmit(&self, frame: Vec<u8>, channel: u8) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(Error::SendFailed(format!("no such channel {}", channel)));
        }
        if self.is_disconnected() {
            return Err(Error::SendFailed(format!("peer {} disconnected", self.id)));
        }
        let len = frame.len() as u64;
        self.transport
            .send(self.id, frame, channel, Delivery::ReliableOrdered)?;
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data).map_err(|e| Error::Compression(e.to_string()))
}
