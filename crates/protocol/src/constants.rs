//! Protocol constants

/// Protocol magic bytes: "LKST"
pub const MAGIC: [u8; 4] = [0x4C, 0x4B, 0x53, 0x54];

/// Current protocol version. Bumped on any payload layout change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (64MB, prompts are the only unbounded field)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Maximum length of a free-form reason string in a report
pub const MAX_REASON_LEN: usize = 4096;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    // Group membership (0x000x)
    /// Rank announcement during bootstrap (both directions)
    Hello = 0x0001,

    // Rounds (0x001x)
    /// Generation command (leader → followers)
    Command = 0x0010,
    /// Receipt of a broadcast message (follower → leader)
    Ack = 0x0011,
    /// Per-round outcome (follower → leader)
    RoundReport = 0x0012,
    /// Orderly shutdown of the group (leader → followers)
    Shutdown = 0x001F,
}

impl MsgType {
    /// Parse from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0010 => Some(Self::Command),
            0x0011 => Some(Self::Ack),
            0x0012 => Some(Self::RoundReport),
            0x001F => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Whether the receiver must acknowledge this message before the
    /// broadcast counts as delivered
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Command | Self::Shutdown)
    }
}
