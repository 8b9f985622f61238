//! Wire protocol for the Parlo voice-message relay.
//!
//! Defines the datagram packet format and its codec.
//!
//! ## Packet Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Version (1) │ Type (1) │           Message ID (16)               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Chunk Index (4) │ Total Chunks (4) │       Sender ID (16)        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Recipient ID (16) │ Checksum (4) │ Payload Len (2) │ Payload ... │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte integers are big-endian; identities are the 16 raw bytes
//! of a UUID. The checksum is CRC-32 (IEEE) over the payload only.

mod message_info;
mod packet;

pub use message_info::MessageInfo;
pub use packet::{Packet, PacketType, ProtoError};

/// Wire protocol revision accepted by the engine.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Maximum payload carried by a single datagram.
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Receive buffer bound; larger datagrams are truncated by the kernel.
pub const MAX_PACKET_SIZE: usize = 2048;

/// CRC-32 (IEEE) checksum of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
