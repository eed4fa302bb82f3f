//! Frame header

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::constants::{MsgType, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Frame header preceding every rank-to-rank payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version of the sender
    pub version: u8,
    /// Message type
    pub msg_type: MsgType,
    /// Payload length in bytes
    pub payload_len: u32,
    /// CRC32 of payload
    pub crc32: u32,
}

impl Header {
    /// Create a header for the current protocol version
    pub fn new(msg_type: MsgType, payload_len: u32, crc32: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
            crc32,
        }
    }

    /// Create header for payload with automatic CRC calculation
    pub fn for_payload(msg_type: MsgType, payload: &[u8]) -> Self {
        let crc32 = crc32fast::hash(payload);
        Self::new(msg_type, payload.len() as u32, crc32)
    }

    /// Encode header to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        // Writes into a Vec cannot fail.
        buf.extend_from_slice(&MAGIC);
        buf.write_u8(self.version).unwrap();
        buf.write_u8(0).unwrap(); // reserved
        buf.write_u16::<LittleEndian>(self.msg_type as u16).unwrap();
        buf.write_u32::<LittleEndian>(self.payload_len).unwrap();
        buf.write_u32::<LittleEndian>(self.crc32).unwrap();
    }

    /// Decode header from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidPayloadLength {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        if data[0..4] != MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        let mut cursor = Cursor::new(&data[4..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let _ = cursor.read_u8()?; // reserved

        let msg_type_raw = cursor.read_u16::<LittleEndian>()?;
        let msg_type = MsgType::from_u16(msg_type_raw)
            .ok_or(ProtocolError::UnknownMessageType(msg_type_raw))?;

        let payload_len = cursor.read_u32::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;

        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                got: payload_len as usize,
            });
        }

        Ok(Self {
            version,
            msg_type,
            payload_len,
            crc32,
        })
    }

    /// Verify payload CRC
    pub fn verify_crc(&self, payload: &[u8]) -> Result<()> {
        let computed = crc32fast::hash(payload);
        if computed != self.crc32 {
            return Err(ProtocolError::CrcMismatch {
                expected: self.crc32,
                got: computed,
            });
        }
        Ok(())
    }
}
