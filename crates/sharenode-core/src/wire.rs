//! Wire codec
//!
//! Every application message is a single type tag byte followed by a body.
//! Variable-length fields (byte arrays, strings) carry a 4-byte little-endian
//! length prefix; fixed fields (segment index, channel) are written raw.
//!
//! Two frames sit outside the tagged messages:
//!
//! - [`HandshakeKeys`]: `[len|agreement key][len|signing key]`, sent in the
//!   clear on channel 0 right after connecting.
//! - [`SecureFrame`]: `[len|ciphertext][len|signature][len|iv]`, the envelope
//!   of every post-handshake message.

use bytes::{Buf, BufMut, BytesMut};

use crate::crypto::PublicKeys;
use crate::types::{CatalogEntry, ContentHash, TransferId};
use crate::{Error, Result};

/// Single-byte message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    FilesListRequest = 10,
    FilesList = 11,
    FileRequest = 12,
    FileSegment = 13,
    FileSegmentAck = 14,
    CancelDownload = 15,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            10 => MessageType::FilesListRequest,
            11 => MessageType::FilesList,
            12 => MessageType::FileRequest,
            13 => MessageType::FileSegment,
            14 => MessageType::FileSegmentAck,
            15 => MessageType::CancelDownload,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// Length-prefixed binary writer
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Length-prefixed binary reader over a borrowed buffer
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(value)
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|e| Error::Protocol(format!("invalid UTF-8: {}", e)))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fail if unread bytes are left over
    pub fn finish(self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after message body",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// What a `FileRequest` asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Start streaming the whole file
    WholeFile,
    /// Send one segment again
    Resend(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub transfer_id: TransferId,
    pub file_hash: ContentHash,
    pub kind: RequestKind,
}

#[derive(Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub transfer_id: TransferId,
    pub segment: u32,
    pub channel: u8,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSegment")
            .field("transfer_id", &self.transfer_id)
            .field("segment", &self.segment)
            .field("channel", &self.channel)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A catalog as carried by `FilesList`: CRC-32 of the JSON, then the JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesList {
    pub checksum: u32,
    pub json: String,
}

impl FilesList {
    /// Serialize a catalog and compute its checksum
    pub fn from_entries(entries: &[CatalogEntry]) -> Result<Self> {
        let json = serde_json::to_string(entries)?;
        Ok(Self {
            checksum: crc32fast::hash(json.as_bytes()),
            json,
        })
    }

    /// Check the CRC, then parse the catalog
    pub fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let actual = crc32fast::hash(self.json.as_bytes());
        if actual != self.checksum {
            return Err(Error::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(serde_json::from_str(&self.json)?)
    }
}

/// A decoded application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FilesListRequest,
    FilesList(FilesList),
    FileRequest(FileRequest),
    FileSegment(FileSegment),
    FileSegmentAck { transfer_id: TransferId, segment: u32 },
    CancelDownload { transfer_id: TransferId },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::FilesListRequest => MessageType::FilesListRequest,
            Message::FilesList(_) => MessageType::FilesList,
            Message::FileRequest(_) => MessageType::FileRequest,
            Message::FileSegment(_) => MessageType::FileSegment,
            Message::FileSegmentAck { .. } => MessageType::FileSegmentAck,
            Message::CancelDownload { .. } => MessageType::CancelDownload,
        }
    }

    /// Encode tag and body
    pub fn encode(&self) -> Vec<u8> {
        let capacity = match self {
            Message::FileSegment(seg) => seg.data.len() + 32,
            Message::FilesList(list) => list.json.len() + 16,
            _ => 64,
        };
        let mut w = WireWriter::with_capacity(capacity);
        w.put_u8(self.message_type() as u8);

        match self {
            Message::FilesListRequest => {}
            Message::FilesList(list) => {
                w.put_u32(list.checksum).put_str(&list.json);
            }
            Message::FileRequest(req) => {
                w.put_bytes(req.transfer_id.as_bytes())
                    .put_bytes(&req.file_hash);
                match req.kind {
                    RequestKind::WholeFile => w.put_u8(0).put_u32(0),
                    RequestKind::Resend(segment) => w.put_u8(1).put_u32(segment),
                };
            }
            Message::FileSegment(seg) => {
                w.put_bytes(seg.transfer_id.as_bytes())
                    .put_u32(seg.segment)
                    .put_u8(seg.channel)
                    .put_bytes(&seg.data);
            }
            Message::FileSegmentAck {
                transfer_id,
                segment,
            } => {
                w.put_bytes(transfer_id.as_bytes()).put_u32(*segment);
            }
            Message::CancelDownload { transfer_id } => {
                w.put_bytes(transfer_id.as_bytes());
            }
        }

        w.into_vec()
    }

    /// Decode a tagged message. Tag 0 and unknown tags are rejected.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let message_type = MessageType::try_from(r.get_u8()?)?;

        let message = match message_type {
            MessageType::FilesListRequest => Message::FilesListRequest,
            MessageType::FilesList => {
                let checksum = r.get_u32()?;
                let json = r.get_str()?.to_string();
                Message::FilesList(FilesList { checksum, json })
            }
            MessageType::FileRequest => {
                let transfer_id = TransferId::from_slice(r.get_bytes()?)?;
                let file_hash: ContentHash = r.get_bytes()?.try_into().map_err(|_| {
                    Error::Protocol("file hash must be 32 bytes".to_string())
                })?;
                let kind = match (r.get_u8()?, r.get_u32()?) {
                    (0, _) => RequestKind::WholeFile,
                    (1, segment) => RequestKind::Resend(segment),
                    (other, _) => {
                        return Err(Error::Protocol(format!("unknown request kind {}", other)))
                    }
                };
                Message::FileRequest(FileRequest {
                    transfer_id,
                    file_hash,
                    kind,
                })
            }
            MessageType::FileSegment => {
                let transfer_id = TransferId::from_slice(r.get_bytes()?)?;
                let segment = r.get_u32()?;
                let channel = r.get_u8()?;
                let data = r.get_bytes()?.to_vec();
                Message::FileSegment(FileSegment {
                    transfer_id,
                    segment,
                    channel,
                    data,
                })
            }
            MessageType::FileSegmentAck => {
                let transfer_id = TransferId::from_slice(r.get_bytes()?)?;
                let segment = r.get_u32()?;
                Message::FileSegmentAck {
                    transfer_id,
                    segment,
                }
            }
            MessageType::CancelDownload => {
                let transfer_id = TransferId::from_slice(r.get_bytes()?)?;
                Message::CancelDownload { transfer_id }
            }
        };

        r.finish()?;
        Ok(message)
    }
}

/// Cleartext handshake frame carrying a session's public keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeKeys {
    pub agreement: Vec<u8>,
    pub signing: Vec<u8>,
}

impl HandshakeKeys {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(self.agreement.len() + self.signing.len() + 8);
        w.put_bytes(&self.agreement).put_bytes(&self.signing);
        w.into_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let agreement = r.get_bytes()?.to_vec();
        let signing = r.get_bytes()?.to_vec();
        r.finish()?;
        Ok(Self { agreement, signing })
    }
}

impl From<PublicKeys> for HandshakeKeys {
    fn from(keys: PublicKeys) -> Self {
        Self {
            agreement: keys.agreement.to_vec(),
            signing: keys.signing.to_vec(),
        }
    }
}

/// Authenticated, encrypted envelope of one application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureFrame {
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
    pub iv: Vec<u8>,
}

impl SecureFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(
            self.ciphertext.len() + self.signature.len() + self.iv.len() + 12,
        );
        w.put_bytes(&self.ciphertext)
            .put_bytes(&self.signature)
            .put_bytes(&self.iv);
        w.into_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let ciphertext = r.get_bytes()?.to_vec();
        let signature = r.get_bytes()?.to_vec();
        let iv = r.get_bytes()?.to_vec();
        r.finish()?;
        Ok(Self {
            ciphertext,
            signature,
            iv,
        })
    }
}
