//! Rank-to-rank messages

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::command::Command;
use crate::constants::{MsgType, HEADER_SIZE, MAX_REASON_LEN};
use crate::error::{ProtocolError, Result};
use crate::header::Header;

/// Rank announcement exchanged once when a follower joins the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub rank: u32,
    pub world_size: u32,
}

impl Hello {
    const LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.write_u32::<LittleEndian>(self.rank).unwrap();
        buf.write_u32::<LittleEndian>(self.world_size).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        expect_len(data, Self::LEN)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            rank: cursor.read_u32::<LittleEndian>()?,
            world_size: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Receipt of a broadcast message. `round` echoes the command's round, or 0
/// for a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub round: u64,
}

impl Ack {
    const LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        self.round.to_le_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        expect_len(data, Self::LEN)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            round: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Outcome of one round on one follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    /// The engine ran and its sequence was drained
    Completed { tokens: u32 },
    /// The engine failed while running this round
    Failed { reason: String },
    /// The command was not executed (stale or duplicate round)
    Rejected { reason: String },
}

impl ReportStatus {
    fn code(&self) -> u8 {
        match self {
            Self::Completed { .. } => 0,
            Self::Failed { .. } => 1,
            Self::Rejected { .. } => 2,
        }
    }
}

/// Per-round report sent by every follower after it finished (or refused)
/// the round's command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub rank: u32,
    pub status: ReportStatus,
}

impl RoundReport {
    /// round(8) + rank(4) + status(1) + tokens(4) + reason_len(4)
    const FIXED_LEN: usize = 21;

    pub fn completed(round: u64, rank: u32, tokens: u32) -> Self {
        Self {
            round,
            rank,
            status: ReportStatus::Completed { tokens },
        }
    }

    pub fn failed(round: u64, rank: u32, reason: impl Into<String>) -> Self {
        Self {
            round,
            rank,
            status: ReportStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn rejected(round: u64, rank: u32, reason: impl Into<String>) -> Self {
        Self {
            round,
            rank,
            status: ReportStatus::Rejected {
                reason: reason.into(),
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (tokens, reason) = match &self.status {
            ReportStatus::Completed { tokens } => (*tokens, ""),
            ReportStatus::Failed { reason } | ReportStatus::Rejected { reason } => (0, reason.as_str()),
        };
        let reason = truncate_utf8(reason, MAX_REASON_LEN).as_bytes();

        let mut buf = Vec::with_capacity(Self::FIXED_LEN + reason.len());
        buf.write_u64::<LittleEndian>(self.round).unwrap();
        buf.write_u32::<LittleEndian>(self.rank).unwrap();
        buf.write_u8(self.status.code()).unwrap();
        buf.write_u32::<LittleEndian>(tokens).unwrap();
        buf.write_u32::<LittleEndian>(reason.len() as u32).unwrap();
        buf.extend_from_slice(reason);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_LEN {
            return Err(ProtocolError::InvalidPayloadLength {
                expected: Self::FIXED_LEN,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let round = cursor.read_u64::<LittleEndian>()?;
        let rank = cursor.read_u32::<LittleEndian>()?;
        let code = cursor.read_u8()?;
        let tokens = cursor.read_u32::<LittleEndian>()?;
        let reason_len = cursor.read_u32::<LittleEndian>()? as usize;

        expect_len(data, Self::FIXED_LEN + reason_len)?;
        let mut reason = vec![0u8; reason_len];
        cursor.read_exact(&mut reason)?;
        let reason = String::from_utf8(reason).map_err(|_| ProtocolError::InvalidUtf8("reason"))?;

        let status = match code {
            0 => ReportStatus::Completed { tokens },
            1 => ReportStatus::Failed { reason },
            2 => ReportStatus::Rejected { reason },
            other => {
                return Err(ProtocolError::InvalidField {
                    field: "status",
                    reason: format!("unknown status code {other}"),
                })
            }
        };

        Ok(Self { round, rank, status })
    }
}

/// Any message exchanged between ranks
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Command(Command),
    Ack(Ack),
    RoundReport(RoundReport),
    Shutdown,
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Hello(_) => MsgType::Hello,
            Self::Command(_) => MsgType::Command,
            Self::Ack(_) => MsgType::Ack,
            Self::RoundReport(_) => MsgType::RoundReport,
            Self::Shutdown => MsgType::Shutdown,
        }
    }

    /// Round this message belongs to, if any
    pub fn round(&self) -> Option<u64> {
        match self {
            Self::Command(command) => Some(command.round),
            Self::Ack(ack) => Some(ack.round),
            Self::RoundReport(report) => Some(report.round),
            Self::Hello(_) | Self::Shutdown => None,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Hello(hello) => hello.encode(),
            Self::Command(command) => command.encode(),
            Self::Ack(ack) => ack.encode(),
            Self::RoundReport(report) => report.encode(),
            Self::Shutdown => Vec::new(),
        }
    }

    /// Encode as a complete frame (header + payload)
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let header = Header::for_payload(self.msg_type(), &payload);

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        header.encode_into(&mut buf);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decode a complete frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = Header::decode(data)?;
        Self::decode_payload(&header, &data[HEADER_SIZE..])
    }

    /// Decode the payload that followed `header` on the wire
    pub fn decode_payload(header: &Header, payload: &[u8]) -> Result<Self> {
        expect_len(payload, header.payload_len as usize)?;
        header.verify_crc(payload)?;

        match header.msg_type {
            MsgType::Hello => Ok(Self::Hello(Hello::decode(payload)?)),
            MsgType::Command => Ok(Self::Command(Command::decode(payload)?)),
            MsgType::Ack => Ok(Self::Ack(Ack::decode(payload)?)),
            MsgType::RoundReport => Ok(Self::RoundReport(RoundReport::decode(payload)?)),
            MsgType::Shutdown => {
                expect_len(payload, 0)?;
                Ok(Self::Shutdown)
            }
        }
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(ProtocolError::InvalidPayloadLength {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
