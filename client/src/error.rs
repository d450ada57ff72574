//! Error types for the RCON client
//!
//! Only [`SessionError`] ever reaches callers of the session. Packet-level
//! problems ([`shared::CodecError`], [`TableError`]) are logged and absorbed
//! by the read loop.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Connection-level failures surfaced to the caller
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("no login response within {0:?}")]
    Timeout(Duration),

    #[error("login rejected by server")]
    InvalidLogin,

    #[error("session is not authenticated")]
    NotConnected,

    #[error("all 256 sequence numbers are outstanding")]
    Saturated,

    #[error("session has been shut down")]
    Shutdown,
}

/// Bookkeeping failures inside the transmission table
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("sequence {0} is already outstanding")]
    Collision(u8),

    #[error("no outstanding transmission for sequence {0}")]
    Unknown(u8),

    #[error("sequence {sequence}: part claims {got} total parts, expected {expected}")]
    PartMismatch { sequence: u8, expected: u8, got: u8 },

    #[error("sequence {sequence}: part {index} out of range for {total} parts")]
    IndexOutOfRange { sequence: u8, index: u8, total: u8 },
}
