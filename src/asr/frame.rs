//! Binary frame codec for the streaming recognition protocol.
//!
//! Every message exchanged with the recognition service is one frame:
//!
//! ```text
//! byte 0: version (high nibble) | header size in 4-byte words (low nibble)
//! byte 1: message type (high nibble) | flags (low nibble)
//! byte 2: serialization method (high nibble) | compression method (low nibble)
//! byte 3: reserved
//! bytes 4..8: payload length, big-endian u32 (length of the possibly
//!             compressed payload)
//! bytes 8..: payload
//! ```
//!
//! The service runs a fixed configuration: version 1, one-word (4-byte)
//! header. Header fields are constructed from the named types below, never
//! from literal byte constants, so encode and decode stay symmetric.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::errors::FrameError;

/// Protocol version nibble. The service only speaks version 1.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size nibble, in 4-byte words. Fixed at 1 (a 4-byte header).
pub const HEADER_SIZE_WORDS: u8 = 0b0001;

/// Flags bit 0: this is the last packet of the stream. Remaining flag
/// bits are reserved.
pub const FLAG_LAST_PACKET: u8 = 0b0001;

// ── Header field types ───────────────────────────────────────────

/// Message type nibble (byte 1, high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Handshake carrying the session's JSON configuration.
    FullClientRequest = 0b0001,
    /// One chunk of audio, no JSON envelope.
    AudioOnlyRequest = 0b0010,
    /// Recognition result from the service.
    ServerResponse = 0b1001,
    /// Explicit error from the service.
    Error = 0b1111,
}

impl MessageType {
    fn from_nibble(nibble: u8) -> Result<Self, FrameError> {
        match nibble {
            0b0001 => Ok(Self::FullClientRequest),
            0b0010 => Ok(Self::AudioOnlyRequest),
            0b1001 => Ok(Self::ServerResponse),
            0b1111 => Ok(Self::Error),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Payload serialization method nibble (byte 2, high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    None = 0b0000,
    Json = 0b0001,
}

/// Payload compression method nibble (byte 2, low nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None = 0b0000,
    Gzip = 0b0001,
}

impl Compression {
    fn from_nibble(nibble: u8) -> Result<Self, FrameError> {
        match nibble {
            0b0000 => Ok(Self::None),
            0b0001 => Ok(Self::Gzip),
            other => Err(FrameError::UnknownCompression(other)),
        }
    }
}

/// A decoded inbound frame. The payload is already decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: u8,
    pub compression: Compression,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Whether the last-packet flag bit is set.
    pub fn is_last_packet(&self) -> bool {
        self.flags & FLAG_LAST_PACKET != 0
    }
}

// ── Encode / decode ──────────────────────────────────────────────

/// Encode one outbound frame. If `compression` is gzip, the payload is
/// compressed before the length field is computed.
pub fn encode(
    message_type: MessageType,
    flags: u8,
    serialization: Serialization,
    compression: Compression,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let body = match compression {
        Compression::Gzip => gzip_compress(payload)?,
        Compression::None => payload.to_vec(),
    };

    let mut out = Vec::with_capacity(8 + body.len());
    out.push((PROTOCOL_VERSION << 4) | HEADER_SIZE_WORDS);
    out.push(((message_type as u8) << 4) | (flags & 0x0F));
    out.push(((serialization as u8) << 4) | (compression as u8));
    out.push(0x00);
    out.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one inbound frame, decompressing the payload when the header
/// says so. The length field must match the bytes actually present.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < 8 {
        return Err(FrameError::Truncated { len: bytes.len() });
    }

    let message_type = MessageType::from_nibble(bytes[1] >> 4)?;
    let flags = bytes[1] & 0x0F;
    let compression = Compression::from_nibble(bytes[2] & 0x0F)?;

    let declared = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let available = bytes.len() - 8;
    if declared > available {
        return Err(FrameError::PayloadOverrun {
            declared,
            available,
        });
    }

    let raw = &bytes[8..8 + declared];
    let payload = match compression {
        Compression::Gzip => gzip_decompress(raw)?,
        Compression::None => raw.to_vec(),
    };

    Ok(Frame {
        message_type,
        flags,
        compression,
        payload,
    })
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: &[MessageType] = &[
        MessageType::FullClientRequest,
        MessageType::AudioOnlyRequest,
        MessageType::ServerResponse,
        MessageType::Error,
    ];

    #[test]
    fn roundtrip_all_header_combinations() {
        let payloads: &[&[u8]] = &[b"", b"\x00", b"hello", &[0xFF; 300]];
        for &message_type in ALL_TYPES {
            for flags in [0, FLAG_LAST_PACKET, 0b1111] {
                for compression in [Compression::None, Compression::Gzip] {
                    for payload in payloads {
                        let encoded = encode(
                            message_type,
                            flags,
                            Serialization::Json,
                            compression,
                            payload,
                        )
                        .unwrap();
                        let frame = decode(&encoded).unwrap();
                        assert_eq!(frame.message_type, message_type);
                        assert_eq!(frame.flags, flags);
                        assert_eq!(frame.compression, compression);
                        assert_eq!(frame.payload, *payload);
                    }
                }
            }
        }
    }

    #[test]
    fn header_layout_matches_wire_format() {
        let encoded = encode(
            MessageType::FullClientRequest,
            0,
            Serialization::Json,
            Compression::None,
            b"{}",
        )
        .unwrap();
        // version 1, header size 1 word
        assert_eq!(encoded[0], 0x11);
        // FullClientRequest, no flags
        assert_eq!(encoded[1], 0x10);
        // JSON serialization, no compression
        assert_eq!(encoded[2], 0x10);
        assert_eq!(encoded[3], 0x00);
        // big-endian length of the uncompressed payload
        assert_eq!(&encoded[4..8], &[0, 0, 0, 2]);
        assert_eq!(&encoded[8..], b"{}");
    }

    #[test]
    fn gzip_payload_length_is_compressed_length() {
        let payload = [0u8; 1024];
        let encoded = encode(
            MessageType::AudioOnlyRequest,
            0,
            Serialization::None,
            Compression::Gzip,
            &payload,
        )
        .unwrap();
        let declared =
            u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]) as usize;
        assert_eq!(declared, encoded.len() - 8);
        // a kilobyte of zeros compresses well below its raw size
        assert!(declared < payload.len());
    }

    #[test]
    fn last_packet_flag_roundtrips() {
        let encoded = encode(
            MessageType::AudioOnlyRequest,
            FLAG_LAST_PACKET,
            Serialization::None,
            Compression::Gzip,
            b"",
        )
        .unwrap();
        let frame = decode(&encoded).unwrap();
        assert!(frame.is_last_packet());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn decode_rejects_short_input() {
        for len in 0..8 {
            let bytes = vec![0x11; len];
            assert!(matches!(
                decode(&bytes),
                Err(FrameError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn decode_rejects_overlong_declared_length() {
        let mut encoded = encode(
            MessageType::ServerResponse,
            0,
            Serialization::Json,
            Compression::None,
            b"abc",
        )
        .unwrap();
        // claim more payload than is present
        encoded[7] = 200;
        assert!(matches!(
            decode(&encoded),
            Err(FrameError::PayloadOverrun { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let mut encoded = encode(
            MessageType::ServerResponse,
            0,
            Serialization::Json,
            Compression::None,
            b"",
        )
        .unwrap();
        encoded[1] = 0b0111 << 4;
        assert!(matches!(
            decode(&encoded),
            Err(FrameError::UnknownMessageType(0b0111))
        ));
    }

    #[test]
    fn decode_rejects_corrupt_gzip() {
        let mut encoded = encode(
            MessageType::ServerResponse,
            0,
            Serialization::Json,
            Compression::Gzip,
            b"some payload",
        )
        .unwrap();
        // stomp the gzip magic
        encoded[8] = 0x00;
        encoded[9] = 0x00;
        assert!(matches!(decode(&encoded), Err(FrameError::Gzip(_))));
    }

    #[test]
    fn error_frames_decode_like_any_other() {
        let encoded = encode(
            MessageType::Error,
            0,
            Serialization::Json,
            Compression::None,
            br#"{"message":"quota exhausted"}"#,
        )
        .unwrap();
        let frame = decode(&encoded).unwrap();
        assert_eq!(frame.message_type, MessageType::Error);
        assert!(String::from_utf8_lossy(&frame.payload).contains("quota"));
    }
}
