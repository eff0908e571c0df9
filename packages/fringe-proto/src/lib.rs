//! # fringe-proto
//!
//! Wire protocol shared by the fringe backend and its clients.
//!
//! Three pieces live here:
//!   - the u16 length framing used on the TCP command port
//!   - the command-code and status-byte tables
//!   - the UDP correlation datagram layout
//!
//! Everything on the wire is big-endian.

pub mod command;
pub mod frame;
pub mod packet;

pub use command::{Command, STATUS_BAD_LENGTH, STATUS_INVALID, STATUS_OK};
pub use frame::{encode_frame, read_frame, write_frame, FrameDecoder, FrameError, MAX_FRAME_SIZE, MAX_PAYLOAD};
pub use packet::{CorrelationPacket, PacketError, HEADER_SIZE};
