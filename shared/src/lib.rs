//! # Shared RCON protocol definitions
//!
//! Everything in this crate is pure: no sockets, no timers, no runtime. The
//! client library, the simulated responder and the process watcher all build
//! on the same wire format and retry policy defined here.
//!
//! ## Wire format
//!
//! ```text
//! +--------+-----------+-----------+------+----------+-----------------+---------+
//! | "BE"   | CRC32 LE  | 0xFF      | type | sequence | 0x00 total idx  | payload |
//! | 2 B    | 4 B       | 1 B       | 1 B  | 1 B      | 3 B (optional)  | n B     |
//! +--------+-----------+-----------+------+----------+-----------------+---------+
//! ```
//!
//! The checksum covers everything from the separator to the end of the
//! datagram. Login packets have no sequence byte. The multipart header only
//! appears on responses that did not fit into a single datagram.

pub mod packet;
pub mod retry;

pub use packet::{decode, split_response, CodecError, Multipart, Packet, PacketType};
pub use retry::RetryPolicy;

/// Protocol identifier at the start of every datagram.
pub const MARKER: [u8; 2] = *b"BE";
/// Sentinel byte that starts the checksummed section.
pub const SEPARATOR: u8 = 0xFF;
/// Marker + checksum + separator + type.
pub const HEADER_LEN: usize = 8;
/// First byte of a multipart header.
pub const MULTIPART_FLAG: u8 = 0x00;
/// Login response payload for accepted credentials.
pub const LOGIN_SUCCESS: u8 = 0x01;
/// Login response payload for rejected credentials.
pub const LOGIN_FAILURE: u8 = 0x00;
/// Size of the receive buffer used for a single datagram.
pub const MAX_DATAGRAM: usize = 4096;
/// Largest payload the responder puts into one datagram before splitting.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

/// Computes the CRC32 (IEEE) checksum used in the packet header.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
