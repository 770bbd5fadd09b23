//! The Casparian Flow wire protocol (§6).
//!
//! Every message is a 16-byte fixed header followed by a payload frame.
//! Control messages (IDENTIFY, DISPATCH, HEARTBEAT, CONCLUDE, ERROR, CANCEL,
//! RELOAD) carry a JSON payload; DATA frames carry an Arrow IPC stream chunk.
//!
//! ```text
//! Offset  Size  Field
//! 0       1     protocol_version (0x04)
//! 1       1     op_code
//! 2       2     flags (bit 0: payload_compressed; bits 1..2: content_type)
//! 4       8     job_id (big-endian u64)
//! 12      4     payload_length (big-endian u32)
//! ```

pub mod error;
pub mod types;

pub use error::{ProtocolError, Result};
pub use types::{
    CancelPayload, ConcludePayload, DispatchPayload, ErrorKind, ErrorPayload, HeartbeatPayload,
    HeartbeatStatus, IdentifyPayload, ReloadPayload, SinkMode, SinkTarget,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use casparian_ids::JobId;
use std::io::Cursor;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x04;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size: 4 GiB - 1, the largest value a u32 length can hold.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Operation codes (§6). Any other value on the wire is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Identify = 1,
    Dispatch = 2,
    Heartbeat = 3,
    Data = 4,
    Conclude = 5,
    Error = 6,
    Cancel = 7,
    Reload = 8,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Identify),
            2 => Ok(OpCode::Dispatch),
            3 => Ok(OpCode::Heartbeat),
            4 => Ok(OpCode::Data),
            5 => Ok(OpCode::Conclude),
            6 => Ok(OpCode::Error),
            7 => Ok(OpCode::Cancel),
            8 => Ok(OpCode::Reload),
            other => Err(ProtocolError::InvalidOpCode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// `content_type`, packed into flags bits 1..2 (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Opaque = 0,
    Utf8 = 1,
    Json = 2,
    Arrow = 3,
}

impl ContentType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ContentType::Opaque),
            1 => Ok(ContentType::Utf8),
            2 => Ok(ContentType::Json),
            3 => Ok(ContentType::Arrow),
            other => Err(ProtocolError::InvalidContentType(other)),
        }
    }
}

/// Decoded `flags` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub compressed: bool,
    pub content_type: ContentType,
}

impl Flags {
    pub fn new(content_type: ContentType) -> Self {
        Self { compressed: false, content_type }
    }

    fn pack(self) -> u16 {
        let compressed_bit = if self.compressed { 1u16 } else { 0 };
        let content_bits = (self.content_type as u16) << 1;
        compressed_bit | content_bits
    }

    fn unpack(raw: u16) -> Result<Self> {
        let compressed = raw & 0b1 != 0;
        let content_type = ContentType::from_u8(((raw >> 1) & 0b11) as u8)?;
        Ok(Self { compressed, content_type })
    }
}

/// The 16-byte fixed header (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub flags: Flags,
    pub job_id: JobId,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, flags: Flags, job_id: JobId, payload_len: u32) -> Self {
        Self { version: PROTOCOL_VERSION, opcode, flags, job_id, payload_len }
    }

    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.flags.pack())?;
        cursor.write_u64::<BigEndian>(self.job_id.as_u64())?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;
        Ok(buf)
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort { expected: HEADER_SIZE, got: data.len() });
        }
        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);
        let version = cursor.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch { expected: PROTOCOL_VERSION, got: version });
        }
        let op_raw = cursor.read_u8()?;
        let opcode = OpCode::from_u8(op_raw)?;
        let flags_raw = cursor.read_u16::<BigEndian>()?;
        let flags = Flags::unpack(flags_raw)?;
        let job_id = JobId::new(cursor.read_u64::<BigEndian>()?);
        let payload_len = cursor.read_u32::<BigEndian>()?;
        Ok(Self { version, opcode, flags, job_id, payload_len })
    }
}

/// A full message: header plus payload bytes.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: OpCode, content_type: ContentType, job_id: JobId, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max: MAX_PAYLOAD_SIZE });
        }
        let header = Header::new(opcode, Flags::new(content_type), job_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Build a control-plane message by JSON-encoding `body`.
    pub fn json(opcode: OpCode, job_id: JobId, body: &impl serde::Serialize) -> Result<Self> {
        let payload = serde_json::to_vec(body)?;
        Self::new(opcode, ContentType::Json, job_id, payload)
    }

    /// Decode a JSON control-plane payload.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Pack into the two wire frames (header, payload).
    pub fn pack(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.header.pack()?.to_vec(), self.payload.clone()))
    }

    /// Unpack from the two wire frames, validating `payload_length` (§8
    /// protocol-strictness invariant).
    pub fn unpack(frames: &[Vec<u8>]) -> Result<Self> {
        if frames.len() != 2 {
            return Err(ProtocolError::InvalidFrameCount { expected: 2, got: frames.len() });
        }
        let header = Header::unpack(&frames[0])?;
        let payload = frames[1].clone();
        if payload.len() != header.payload_len as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected: header.payload_len as usize,
                got: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_for_every_opcode() {
        for opcode in [
            OpCode::Identify,
            OpCode::Dispatch,
            OpCode::Heartbeat,
            OpCode::Data,
            OpCode::Conclude,
            OpCode::Error,
            OpCode::Cancel,
            OpCode::Reload,
        ] {
            let header = Header::new(opcode, Flags::new(ContentType::Json), JobId::new(9999), 512);
            let packed = header.pack().unwrap();
            let unpacked = Header::unpack(&packed).unwrap();
            assert_eq!(header, unpacked);
        }
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0xFF;
        assert!(matches!(Header::unpack(&buf), Err(ProtocolError::VersionMismatch { .. })));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = 0xEE;
        assert!(matches!(Header::unpack(&buf), Err(ProtocolError::InvalidOpCode(0xEE))));
    }

    #[test]
    fn rejects_header_too_short() {
        let buf = [0u8; 8];
        assert!(matches!(Header::unpack(&buf), Err(ProtocolError::HeaderTooShort { .. })));
    }

    #[test]
    fn flags_roundtrip_content_type_and_compression_bit() {
        for content_type in [ContentType::Opaque, ContentType::Utf8, ContentType::Json, ContentType::Arrow] {
            let mut flags = Flags::new(content_type);
            flags.compressed = true;
            let raw = flags.pack();
            let decoded = Flags::unpack(raw).unwrap();
            assert_eq!(decoded, flags);
        }
    }

    #[test]
    fn message_roundtrip_with_json_payload() {
        let body = IdentifyPayload {
            worker_id: "w1".into(),
            capabilities: vec!["abc123".into()],
            current_job_id: None,
        };
        let msg = Message::json(OpCode::Identify, JobId::new(42), &body).unwrap();
        let (header_bytes, payload_bytes) = msg.pack().unwrap();
        let unpacked = Message::unpack(&[header_bytes, payload_bytes]).unwrap();
        assert_eq!(unpacked.header.opcode, OpCode::Identify);
        let decoded: IdentifyPayload = unpacked.json_body().unwrap();
        assert_eq!(decoded.worker_id, "w1");
    }

    #[test]
    fn rejects_payload_length_mismatch() {
        let header = Header::new(OpCode::Data, Flags::new(ContentType::Arrow), JobId::new(1), 10);
        let header_bytes = header.pack().unwrap().to_vec();
        let wrong_payload = vec![0u8; 3];
        assert!(matches!(
            Message::unpack(&[header_bytes, wrong_payload]),
            Err(ProtocolError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_wrong_frame_count() {
        let only_one = vec![vec![0u8; HEADER_SIZE]];
        assert!(matches!(Message::unpack(&only_one), Err(ProtocolError::InvalidFrameCount { .. })));
    }
}
