//! Transfer frame encoding and decoding.
//!
//! Wire format, network byte order:
//!
//! ```text
//! +---------+------+----------+-----------+-------------+--------+-------+-----------+---------+
//! | version | type | sequence | timestamp | payload_len | crc16  | flags | hmac64    | payload |
//! | 1 byte  | 1 B  | 2 B (BE) | 4 B (BE)  | 2 B (BE)    | 2 B    | 2 B   | 8 bytes   | N bytes |
//! +---------+------+----------+-----------+-------------+--------+-------+-----------+---------+
//! ```
//!
//! The CRC is computed over the whole frame with the CRC and token fields
//! zeroed; the token is the first 8 bytes of HMAC-SHA-256 over the
//! CRC-filled frame with the token field zeroed. Timestamps are milliseconds
//! since session start. Sequence numbers wrap at 65536.

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::crc::crc16_ibm;
use super::WireError;
use crate::PROTOCOL_VERSION;

type HmacSha256 = Hmac<Sha256>;

/// Fixed transfer-frame header length in bytes.
pub const FRAME_HEADER_LEN: usize = 22;

/// Truncated HMAC token length in bytes.
pub const AUTH_TOKEN_LEN: usize = 8;

/// Upper bound for a payload length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

const SEQ_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = 4;
const LEN_OFFSET: usize = 8;
const CRC_OFFSET: usize = 10;
const FLAGS_OFFSET: usize = 12;
const TOKEN_OFFSET: usize = 14;

/// Transfer frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Encrypted file chunk.
    Data = 0x01,
    /// Cumulative acknowledgment.
    Ack = 0x02,
    /// Session initiation carrying transfer metadata.
    Init = 0x03,
    /// End of data, requesting validation.
    Fin = 0x04,
    /// Hard abort.
    Rst = 0x05,
    /// Standalone metadata update.
    Metadata = 0x06,
    /// Fatal session error with a reason payload.
    Error = 0x07,
    /// Receiver-driven send suspension.
    Pause = 0x08,
    /// Resume after PAUSE.
    Resume = 0x09,
}

impl FrameType {
    /// Parse a frame type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::Init),
            0x04 => Some(Self::Fin),
            0x05 => Some(Self::Rst),
            0x06 => Some(Self::Metadata),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::Pause),
            0x09 => Some(Self::Resume),
            _ => None,
        }
    }

    /// Byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Transfer frame flags (bits 6..=15 reserved, must be zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Payload is an encrypted envelope.
    pub const ENCRYPTED: Self = Self(1 << 0);
    /// Payload is one fragment of a larger unit.
    pub const FRAGMENTED: Self = Self(1 << 1);
    /// Final fragment.
    pub const LAST_FRAGMENT: Self = Self(1 << 2);
    /// Frame belongs to a high-priority session.
    pub const HIGH_PRIORITY: Self = Self(1 << 3);
    /// Sender expects an acknowledgment.
    pub const REQUIRES_ACK: Self = Self(1 << 4);
    /// Payload is compressed before encryption.
    pub const COMPRESSED: Self = Self(1 << 5);

    const RESERVED: u16 = !0x003F;

    /// Create flags from a raw value.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw value.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Check whether all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check that no reserved bit is set.
    pub fn is_valid(self) -> bool {
        self.0 & Self::RESERVED == 0
    }
}

/// A decoded transfer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Sequence number (wraps at 65536).
    pub sequence: u16,
    /// Milliseconds since session start; ACK frames echo the acknowledged
    /// DATA frame's timestamp here.
    pub timestamp: u32,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Payload bytes (may be an encrypted envelope).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: FrameType, sequence: u16, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            sequence,
            timestamp,
            flags: FrameFlags::NONE,
            payload,
        }
    }

    /// Create an encrypted DATA frame that expects an acknowledgment.
    pub fn data(sequence: u16, timestamp: u32, envelope: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::Data, sequence, timestamp, envelope);
        frame.flags = FrameFlags::ENCRYPTED.with(FrameFlags::REQUIRES_ACK);
        frame
    }

    /// Create a cumulative ACK. `echo` is the acknowledged frame's
    /// timestamp, used for RTT sampling on the sender.
    pub fn ack(cumulative: u16, echo: u32) -> Self {
        Self::new(FrameType::Ack, cumulative, echo, Vec::new())
    }

    /// Frame length on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Encode to bytes, filling the CRC and authentication token under
    /// `mac_key`.
    pub fn encode(&self, mac_key: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; FRAME_HEADER_LEN + self.payload.len()];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.frame_type.as_byte();
        buf[SEQ_OFFSET..SEQ_OFFSET + 2].copy_from_slice(&self.sequence.to_be_bytes());
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[LEN_OFFSET..LEN_OFFSET + 2]
            .copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[FRAME_HEADER_LEN..].copy_from_slice(&self.payload);

        let crc = crc16_ibm(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 2].copy_from_slice(&crc.to_be_bytes());

        let token = auth_token(&buf, mac_key);
        buf[TOKEN_OFFSET..TOKEN_OFFSET + AUTH_TOKEN_LEN].copy_from_slice(&token);
        buf
    }

    /// Decode and validate one complete frame.
    ///
    /// Validation order is strict: version, declared length against
    /// `max_payload`, CRC, HMAC token, then type and flags.
    pub fn decode(bytes: &[u8], mac_key: &[u8], max_payload: usize) -> Result<Self, WireError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated {
                expected: FRAME_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(bytes[0]));
        }

        let declared = u16::from_be_bytes([bytes[LEN_OFFSET], bytes[LEN_OFFSET + 1]]) as usize;
        if declared > max_payload {
            return Err(WireError::LengthExceedsBuffer {
                declared,
                bound: max_payload,
            });
        }
        let total = FRAME_HEADER_LEN + declared;
        if bytes.len() < total {
            return Err(WireError::Truncated {
                expected: total,
                actual: bytes.len(),
            });
        }
        let bytes = &bytes[..total];

        let expected_crc = u16::from_be_bytes([bytes[CRC_OFFSET], bytes[CRC_OFFSET + 1]]);
        let mut scratch = bytes.to_vec();
        scratch[CRC_OFFSET..CRC_OFFSET + 2].fill(0);
        scratch[TOKEN_OFFSET..TOKEN_OFFSET + AUTH_TOKEN_LEN].fill(0);
        let got_crc = crc16_ibm(&scratch);
        if got_crc != expected_crc {
            return Err(WireError::CrcMismatch {
                expected: expected_crc,
                got: got_crc,
            });
        }

        // Restore the CRC for token verification; the token domain is the
        // CRC-filled frame with the token field zeroed.
        scratch[CRC_OFFSET..CRC_OFFSET + 2].copy_from_slice(&expected_crc.to_be_bytes());
        let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
        mac.update(&scratch);
        let received = &bytes[TOKEN_OFFSET..TOKEN_OFFSET + AUTH_TOKEN_LEN];
        mac.verify_truncated_left(received)
            .map_err(|_| WireError::TokenMismatch)?;

        let frame_type = FrameType::from_byte(bytes[1]).ok_or(WireError::UnknownType(bytes[1]))?;
        let flags = FrameFlags::from_bits(u16::from_be_bytes([
            bytes[FLAGS_OFFSET],
            bytes[FLAGS_OFFSET + 1],
        ]));
        if !flags.is_valid() {
            return Err(WireError::InvalidFlags(flags.bits()));
        }

        Ok(Self {
            frame_type,
            sequence: u16::from_be_bytes([bytes[SEQ_OFFSET], bytes[SEQ_OFFSET + 1]]),
            timestamp: u32::from_be_bytes([
                bytes[TIMESTAMP_OFFSET],
                bytes[TIMESTAMP_OFFSET + 1],
                bytes[TIMESTAMP_OFFSET + 2],
                bytes[TIMESTAMP_OFFSET + 3],
            ]),
            flags,
            payload: bytes[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

fn auth_token(frame_with_zero_token: &[u8], mac_key: &[u8]) -> [u8; AUTH_TOKEN_LEN] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(frame_with_zero_token);
    let digest = mac.finalize().into_bytes();
    let mut token = [0u8; AUTH_TOKEN_LEN];
    token.copy_from_slice(&digest[..AUTH_TOKEN_LEN]);
    token
}

/// Incremental decoder for transfer frames arriving on a byte stream.
///
/// Bytes are appended as they arrive; [`FrameCodec::next_frame`] yields a
/// frame only once it is complete, leaving partial frames buffered.
#[derive(Debug)]
pub struct FrameCodec {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec bounded by `max_payload` bytes per frame payload.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(2 * (FRAME_HEADER_LEN + max_payload)),
            max_payload: max_payload.min(MAX_PAYLOAD_LEN),
        }
    }

    /// Append received bytes to the decode buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame. On a
    /// decode error the offending bytes are left in place; transfer-frame
    /// errors are fatal to the session, so no resynchronization is
    /// attempted.
    pub fn next_frame(&mut self, mac_key: &[u8]) -> Result<Option<Frame>, WireError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(self.buf[0]));
        }
        let declared =
            u16::from_be_bytes([self.buf[LEN_OFFSET], self.buf[LEN_OFFSET + 1]]) as usize;
        if declared > self.max_payload {
            return Err(WireError::LengthExceedsBuffer {
                declared,
                bound: self.max_payload,
            });
        }
        let total = FRAME_HEADER_LEN + declared;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame = Frame::decode(&self.buf[..total], mac_key, self.max_payload)?;
        self.buf.advance(total);
        Ok(Some(frame))
    }

    /// Discard the complete frame at the head of the buffer.
    ///
    /// Used after a token-mismatch error, where the framing itself is
    /// intact and the caller drops the frame without processing it.
    /// Returns `false` when no complete frame is buffered.
    pub fn skip_frame(&mut self) -> bool {
        if self.buf.len() < FRAME_HEADER_LEN {
            return false;
        }
        let declared =
            u16::from_be_bytes([self.buf[LEN_OFFSET], self.buf[LEN_OFFSET + 1]]) as usize;
        let total = FRAME_HEADER_LEN + declared;
        if declared > self.max_payload || self.buf.len() < total {
            return false;
        }
        self.buf.advance(total);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"frame codec unit test key";

    #[test]
    fn test_frame_type_roundtrip() {
        for t in [
            FrameType::Data,
            FrameType::Ack,
            FrameType::Init,
            FrameType::Fin,
            FrameType::Rst,
            FrameType::Metadata,
            FrameType::Error,
            FrameType::Pause,
            FrameType::Resume,
        ] {
            assert_eq!(FrameType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(FrameType::from_byte(0x00), None);
        assert_eq!(FrameType::from_byte(0xFF), None);
    }

    #[test]
    fn test_flags() {
        let flags = FrameFlags::ENCRYPTED.with(FrameFlags::REQUIRES_ACK);
        assert!(flags.contains(FrameFlags::ENCRYPTED));
        assert!(flags.contains(FrameFlags::REQUIRES_ACK));
        assert!(!flags.contains(FrameFlags::COMPRESSED));
        assert!(flags.is_valid());
        assert!(!FrameFlags::from_bits(1 << 9).is_valid());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = Frame::data(42, 1234, vec![0xAA; 100]);
        let bytes = frame.encode(KEY);
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 100);

        let decoded = Frame::decode(&bytes, KEY, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bytes = Frame::ack(7, 99).encode(KEY);
        let first = Frame::decode(&bytes, KEY, MAX_PAYLOAD_LEN).unwrap();
        let second = Frame::decode(&bytes, KEY, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_version_rejected_first() {
        let mut bytes = Frame::ack(1, 0).encode(KEY);
        bytes[0] = 0x7F;
        assert_eq!(
            Frame::decode(&bytes, KEY, MAX_PAYLOAD_LEN),
            Err(WireError::UnsupportedVersion(0x7F))
        );
    }

    #[test]
    fn test_length_bound_checked_before_crc() {
        let mut bytes = Frame::data(1, 0, vec![0u8; 64]).encode(KEY);
        // Corrupt both length and payload; the length bound must win.
        bytes[LEN_OFFSET] = 0xFF;
        bytes[LEN_OFFSET + 1] = 0xFF;
        assert!(matches!(
            Frame::decode(&bytes, KEY, 128),
            Err(WireError::LengthExceedsBuffer { declared: 0xFFFF, bound: 128 })
        ));
    }

    #[test]
    fn test_corrupted_payload_fails_crc() {
        let mut bytes = Frame::data(1, 0, vec![0x55; 32]).encode(KEY);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            Frame::decode(&bytes, KEY, MAX_PAYLOAD_LEN),
            Err(WireError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails_token() {
        let bytes = Frame::data(1, 0, vec![0x55; 32]).encode(KEY);
        assert_eq!(
            Frame::decode(&bytes, b"a different key", MAX_PAYLOAD_LEN),
            Err(WireError::TokenMismatch)
        );
    }

    #[test]
    fn test_codec_buffers_partial_frames() {
        let bytes = Frame::data(3, 500, vec![0x11; 200]).encode(KEY);
        let mut codec = FrameCodec::new(MAX_PAYLOAD_LEN);

        codec.extend(&bytes[..10]);
        assert_eq!(codec.next_frame(KEY).unwrap(), None);

        codec.extend(&bytes[10..FRAME_HEADER_LEN + 50]);
        assert_eq!(codec.next_frame(KEY).unwrap(), None);

        codec.extend(&bytes[FRAME_HEADER_LEN + 50..]);
        let frame = codec.next_frame(KEY).unwrap().unwrap();
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.payload.len(), 200);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_codec_skip_frame_resynchronizes() {
        let good = Frame::data(1, 10, vec![1, 2, 3]).encode(KEY);
        let bad = Frame::data(2, 11, vec![4, 5, 6]).encode(b"other key");
        let mut codec = FrameCodec::new(MAX_PAYLOAD_LEN);
        codec.extend(&bad);
        codec.extend(&good);

        assert_eq!(codec.next_frame(KEY), Err(WireError::TokenMismatch));
        assert!(codec.skip_frame());
        let frame = codec.next_frame(KEY).unwrap().unwrap();
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn test_codec_yields_back_to_back_frames() {
        let first = Frame::data(1, 10, vec![1, 2, 3]).encode(KEY);
        let second = Frame::ack(1, 10).encode(KEY);
        let mut codec = FrameCodec::new(MAX_PAYLOAD_LEN);
        codec.extend(&first);
        codec.extend(&second);

        assert_eq!(
            codec.next_frame(KEY).unwrap().unwrap().frame_type,
            FrameType::Data
        );
        assert_eq!(
            codec.next_frame(KEY).unwrap().unwrap().frame_type,
            FrameType::Ack
        );
        assert_eq!(codec.next_frame(KEY).unwrap(), None);
    }
}
