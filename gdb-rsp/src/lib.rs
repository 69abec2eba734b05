//! GDB remote serial protocol (RSP) wire layer.
//!
//! This crate knows nothing about debugging targets. It converts between
//! octet streams and packet bodies (`packetizer`, `packet_util`) and between
//! packet bodies and typed packets (`packets`).

pub mod blob;
pub mod packet_util;
pub mod packetizer;
pub mod packets;

pub use blob::Blob;
pub use packet_util::{add_envelope, remove_envelope};
pub use packetizer::{PacketConsumer, Packetizer};
pub use packets::{Packet, ParseError, ReplyHint, StopReply, ThreadSubject};

/// Largest packet body the server advertises in `qSupported`.
pub const MAX_PACKET_SIZE: usize = 4096;
