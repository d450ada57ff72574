//! Packet encoding and decoding
//!
//! Decoding is strict about the header and lenient about the payload: the
//! payload is opaque bytes. Every decode failure is a [`CodecError`], which
//! callers treat as transport noise and drop.

use crate::{checksum, HEADER_LEN, MARKER, MULTIPART_FLAG, SEPARATOR};
use thiserror::Error;

/// Reasons a datagram could not be turned into a [`Packet`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("bad protocol marker {0:02x?}")]
    BadMarker([u8; 2]),

    #[error("checksum mismatch: header {expected:#010x}, computed {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("bad separator byte {0:#04x}")]
    BadSeparator(u8),

    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl CodecError {
    /// True for corruption detected by the checksum rather than by framing.
    pub fn is_checksum(&self) -> bool {
        matches!(self, CodecError::Checksum { .. })
    }
}

/// Type byte of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Login = 0,
    Command = 1,
    ServerMessage = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Login),
            1 => Ok(PacketType::Command),
            2 => Ok(PacketType::ServerMessage),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// Position of one datagram inside a split response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multipart {
    pub total: u8,
    pub index: u8,
}

/// A decoded RCON packet
///
/// Requests and responses share the same shapes: a login request carries the
/// password as payload while the login response carries a single status
/// byte; a command request carries the command text while its response
/// carries the server's answer, possibly split into several parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Login {
        payload: Vec<u8>,
    },
    Command {
        sequence: u8,
        multipart: Option<Multipart>,
        payload: Vec<u8>,
    },
    ServerMessage {
        sequence: u8,
        multipart: Option<Multipart>,
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Builds a login request carrying the password.
    pub fn login(password: &str) -> Self {
        Packet::Login {
            payload: password.as_bytes().to_vec(),
        }
    }

    /// Builds a single-part command packet. An empty command is a keepalive.
    pub fn command(sequence: u8, text: &str) -> Self {
        Packet::Command {
            sequence,
            multipart: None,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Builds the acknowledgement a client owes for every server message.
    pub fn server_ack(sequence: u8) -> Self {
        Packet::ServerMessage {
            sequence,
            multipart: None,
            payload: Vec::new(),
        }
    }

    pub fn kind(&self) -> PacketType {
        match self {
            Packet::Login { .. } => PacketType::Login,
            Packet::Command { .. } => PacketType::Command,
            Packet::ServerMessage { .. } => PacketType::ServerMessage,
        }
    }

    /// Sequence byte, absent for login packets.
    pub fn sequence(&self) -> Option<u8> {
        match self {
            Packet::Login { .. } => None,
            Packet::Command { sequence, .. } | Packet::ServerMessage { sequence, .. } => {
                Some(*sequence)
            }
        }
    }

    pub fn multipart(&self) -> Option<Multipart> {
        match self {
            Packet::Login { .. } => None,
            Packet::Command { multipart, .. } | Packet::ServerMessage { multipart, .. } => {
                *multipart
            }
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Packet::Login { payload }
            | Packet::Command { payload, .. }
            | Packet::ServerMessage { payload, .. } => payload,
        }
    }

    /// Serializes the packet into a datagram, computing the checksum.
    ///
    /// A single-part payload that would read as a multipart header (`0x00`
    /// followed by two or more bytes) is written behind an explicit
    /// one-of-one header, which [`decode`] folds back into `None`.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut body = Vec::with_capacity(payload.len() + 6);
        body.push(SEPARATOR);
        body.push(self.kind() as u8);

        if let Some(sequence) = self.sequence() {
            body.push(sequence);
            match self.multipart() {
                Some(part) => body.extend_from_slice(&[MULTIPART_FLAG, part.total, part.index]),
                None if looks_multipart(payload) => {
                    body.extend_from_slice(&[MULTIPART_FLAG, 1, 0]);
                }
                None => {}
            }
        }
        body.extend_from_slice(payload);

        let mut datagram = Vec::with_capacity(HEADER_LEN - 2 + body.len());
        datagram.extend_from_slice(&MARKER);
        datagram.extend_from_slice(&checksum(&body).to_le_bytes());
        datagram.extend_from_slice(&body);
        datagram
    }
}

/// Parses and verifies one datagram.
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::TooShort(bytes.len()));
    }

    let marker = [bytes[0], bytes[1]];
    if marker != MARKER {
        return Err(CodecError::BadMarker(marker));
    }

    let expected = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let actual = checksum(&bytes[6..]);
    if expected != actual {
        return Err(CodecError::Checksum { expected, actual });
    }

    if bytes[6] != SEPARATOR {
        return Err(CodecError::BadSeparator(bytes[6]));
    }

    let kind = PacketType::try_from(bytes[7])?;
    let rest = &bytes[HEADER_LEN..];

    if kind == PacketType::Login {
        return Ok(Packet::Login {
            payload: rest.to_vec(),
        });
    }

    let (&sequence, rest) = rest
        .split_first()
        .ok_or(CodecError::Malformed("missing sequence byte"))?;
    let (multipart, payload) = split_multipart(rest)?;

    Ok(match kind {
        PacketType::Command => Packet::Command {
            sequence,
            multipart,
            payload: payload.to_vec(),
        },
        _ => Packet::ServerMessage {
            sequence,
            multipart,
            payload: payload.to_vec(),
        },
    })
}

fn looks_multipart(payload: &[u8]) -> bool {
    payload.len() >= 3 && payload[0] == MULTIPART_FLAG
}

fn split_multipart(rest: &[u8]) -> Result<(Option<Multipart>, &[u8]), CodecError> {
    if !looks_multipart(rest) {
        return Ok((None, rest));
    }

    let part = Multipart {
        total: rest[1],
        index: rest[2],
    };
    if part.total == 0 {
        return Err(CodecError::Malformed("multipart total is zero"));
    }
    if part.index >= part.total {
        return Err(CodecError::Malformed("multipart index out of range"));
    }
    if part.total == 1 {
        return Ok((None, &rest[3..]));
    }
    Ok((Some(part), &rest[3..]))
}

/// Splits a command response into as many packets as needed so that no
/// payload exceeds `max_payload` bytes.
pub fn split_response(
    sequence: u8,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<Packet>, CodecError> {
    if max_payload == 0 {
        return Err(CodecError::Malformed("max payload is zero"));
    }
    if payload.len() <= max_payload {
        return Ok(vec![Packet::Command {
            sequence,
            multipart: None,
            payload: payload.to_vec(),
        }]);
    }

    let chunks: Vec<&[u8]> = payload.chunks(max_payload).collect();
    let total = u8::try_from(chunks.len())
        .map_err(|_| CodecError::Malformed("response needs more than 255 parts"))?;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Packet::Command {
            sequence,
            multipart: Some(Multipart {
                total,
                index: index as u8,
            }),
            payload: chunk.to_vec(),
        })
        .collect())
}
