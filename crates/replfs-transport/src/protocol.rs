//! Frame format for the replfs connection protocol.
//!
//! Every message is a fixed 24-byte header followed by the payload:
//!
//! ```text
//! magic:4 | version:1 | flags:1 | opcode:2 | request_id:8 | payload_length:4 | crc32:4
//! ```
//!
//! All integers are big-endian. The CRC32 covers the payload only.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0x5246_5301;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single frame may carry (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Flag bit marking a frame as a response.
pub const FLAG_RESPONSE: u8 = 0x01;

/// Message kinds carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// A control command.
    Command = 0x0101,
    /// Result envelope answering a command.
    CommandResult = 0x0102,
    /// One file chunk.
    Chunk = 0x0201,
    /// Acknowledgement of a received chunk.
    ChunkAck = 0x0202,
}

impl Opcode {
    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Opcode {
    type Error = TransportError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0101 => Ok(Opcode::Command),
            0x0102 => Ok(Opcode::CommandResult),
            0x0201 => Ok(Opcode::Chunk),
            0x0202 => Ok(Opcode::ChunkAck),
            other => Err(TransportError::UnknownOpcode(other)),
        }
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Control flags
    pub flags: u8,
    /// Operation code
    pub opcode: Opcode,
    /// Request ID echoed by the response
    pub request_id: u64,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 of the payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Serializes the header into its 24-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.opcode.as_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parses and validates a header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header too short: {} bytes", buf.len()),
            });
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let opcode = Opcode::try_from(u16::from_be_bytes([buf[6], buf[7]]))?;
        let mut request_id = [0u8; 8];
        request_id.copy_from_slice(&buf[8..16]);
        Ok(Self {
            magic,
            version,
            flags: buf[5],
            opcode,
            request_id: u64::from_be_bytes(request_id),
            payload_length: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            checksum: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

/// A single frame in the connection protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a request frame, computing the payload CRC.
    pub fn new(opcode: Opcode, request_id: u64, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags: 0,
            opcode,
            request_id,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Builds a frame whose payload is the bincode encoding of `message`.
    pub fn from_message<T: Serialize>(opcode: Opcode, request_id: u64, message: &T) -> Result<Self> {
        let payload = bincode::serialize(message)?;
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len() as u32,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self::new(opcode, request_id, payload))
    }

    /// Builds the response frame for this request.
    pub fn make_response(&self, opcode: Opcode, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(opcode, self.header.request_id, payload);
        frame.header.flags |= FLAG_RESPONSE;
        frame
    }

    /// Operation code of this frame.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// True if the response flag is set.
    pub fn is_response(&self) -> bool {
        self.header.flags & FLAG_RESPONSE != 0
    }

    /// Checks length and CRC against the header.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() != self.header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    self.payload.len(),
                    self.header.payload_length
                ),
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::FrameChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Decodes the bincode payload.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Header followed by payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses a complete frame from a buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(buf)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let end = FRAME_HEADER_SIZE + header.payload_length as usize;
        if buf.len() < end {
            return Err(TransportError::InvalidFrame {
                reason: format!("truncated frame: {} of {} bytes", buf.len(), end),
            });
        }
        let frame = Self {
            header,
            payload: buf[FRAME_HEADER_SIZE..end].to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(Opcode::Chunk, 0x0102030405060708, vec![9; 3]);
        let bytes = frame.header.encode();
        assert_eq!(&bytes[0..4], &MAGIC.to_be_bytes());
        assert_eq!(bytes[4], PROTOCOL_VERSION);
        assert_eq!(&bytes[6..8], &[0x02, 0x01]);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = Frame::new(Opcode::Command, 1, vec![]).encode();
        bytes[0] = 0;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut bytes = Frame::new(Opcode::Command, 1, vec![]).encode();
        bytes[6] = 0xEE;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(TransportError::UnknownOpcode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_corrupted_payload() {
        let mut bytes = Frame::new(Opcode::Command, 1, b"hello".to_vec()).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x20;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(TransportError::FrameChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let bytes = Frame::new(Opcode::Command, 1, b"hello".to_vec()).encode();
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 2]),
            Err(TransportError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_response_keeps_request_id() {
        let req = Frame::new(Opcode::Command, 42, vec![]);
        let resp = req.make_response(Opcode::CommandResult, vec![1]);
        assert!(resp.is_response());
        assert!(!req.is_response());
        assert_eq!(resp.header.request_id, 42);
        assert_eq!(resp.opcode(), Opcode::CommandResult);
    }

    #[test]
    fn test_message_payload() {
        let frame = Frame::from_message(Opcode::Command, 7, &("ls".to_string(), 3u32)).unwrap();
        let decoded: (String, u32) = frame.decode_payload().unwrap();
        assert_eq!(decoded, ("ls".to_string(), 3));
    }

    proptest! {
        #[test]
        fn prop_any_single_byte_flip_is_detected(payload in proptest::collection::vec(any::<u8>(), 1..256), pos in any::<prop::sample::Index>()) {
            let mut bytes = Frame::new(Opcode::Chunk, 5, payload.clone()).encode();
            let i = FRAME_HEADER_SIZE + pos.index(payload.len());
            bytes[i] ^= 0x01;
            prop_assert!(Frame::decode(&bytes).is_err());
        }
    }
}
