//! lockstep protocol - messages exchanged between the leader and follower ranks
//!
//! The leader pushes one [`Command`] per generation round to every follower
//! and collects one [`RoundReport`] back from each of them. Client-facing
//! token events ([`TokenEvent`]) are serialized as JSON and live here too so
//! that the server and any client agree on one shape.
//!
//! # Wire Format
//!
//! All rank-to-rank messages use little-endian encoding with the following
//! header:
//!
//! ```text
//! +----------+---------+----------+----------+---------+----------+
//! | Magic(4) | Ver(1)  | Rsvd(1)  | Type(2)  | Len(4)  | CRC32(4) |
//! +----------+---------+----------+----------+---------+----------+
//! |                    Payload (Len bytes)                        |
//! +---------------------------------------------------------------+
//! ```
//!
//! Every field has a fixed position inside its payload and the header carries
//! the protocol version, so a leader and a follower built from different
//! revisions fail loudly at decode time instead of silently reading the wrong
//! field.

pub mod command;
pub mod constants;
pub mod error;
pub mod event;
pub mod header;
pub mod messages;

pub use command::{Command, GenerationParams};
pub use constants::{MsgType, HEADER_SIZE, MAGIC, PROTOCOL_VERSION};
pub use error::{ProtocolError, Result};
pub use event::{Alternative, TokenEvent, EOS_SENTINEL, MAX_ALTERNATIVES};
pub use header::Header;
pub use messages::{Ack, Hello, Message, ReportStatus, RoundReport};
