//! Payload decoders.
//!
//! A payload is decoded in one pass into a list of per-packet results:
//! a packet that cannot be decoded yields an error item but does not prevent the following
//! packets from being read. Only framing errors, which make it impossible to find where the
//! next packet starts, fail the whole payload.

use bytes::Bytes;

use super::{BINARY_PACKET_SEPARATOR_V3, PACKET_SEPARATOR_V4, STRING_PACKET_SEPARATOR_V3};
use crate::{Packet, PacketParseError, ProtocolVersion, packet::BINARY_MARKER_V3};

/// Error that makes a whole payload unreadable.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload is bigger than the configured `max_payload`.
    #[error("payload too large: max {max}")]
    PayloadTooLarge {
        /// The maximum allowed payload size
        max: u64,
    },
    /// A V3 length prefix is missing or is not a number.
    #[error("invalid packet length prefix")]
    InvalidLengthPrefix,
    /// A V3 binary entry starts with something else than `0` or `1`.
    #[error("invalid binary entry type: {0}")]
    InvalidEntryType(u8),
    /// A V3 string payload is not valid utf8.
    #[error("invalid utf8 payload: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Decode a long-polling payload.
///
/// `binary` is set when the request body was sent with a binary content type,
/// it only matters for V3.
pub fn decode(
    data: &[u8],
    protocol: ProtocolVersion,
    binary: bool,
    max_payload: u64,
) -> Result<Vec<Result<Packet, PacketParseError>>, PayloadError> {
    if data.len() as u64 > max_payload {
        return Err(PayloadError::PayloadTooLarge { max: max_payload });
    }
    match protocol {
        ProtocolVersion::V4 => Ok(v4_decoder(data)),
        ProtocolVersion::V3 if binary => v3_binary_decoder(data),
        ProtocolVersion::V3 => v3_string_decoder(std::str::from_utf8(data)?),
    }
}

fn v4_decoder(data: &[u8]) -> Vec<Result<Packet, PacketParseError>> {
    if data.is_empty() {
        return Vec::new();
    }
    data.split(|b| *b == PACKET_SEPARATOR_V4)
        .map(|chunk| -> Result<Packet, PacketParseError> {
            let chunk = std::str::from_utf8(chunk)?;
            Packet::decode(chunk, ProtocolVersion::V4)
        })
        .collect()
}

fn v3_string_decoder(data: &str) -> Result<Vec<Result<Packet, PacketParseError>>, PayloadError> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (len, after) = rest
            .split_once(STRING_PACKET_SEPARATOR_V3 as char)
            .ok_or(PayloadError::InvalidLengthPrefix)?;
        let len = parse_ascii_len(len.as_bytes().iter().map(|b| b.wrapping_sub(b'0')))?;

        // the length is a number of chars, not bytes
        let end = match len {
            0 => 0,
            n => match after.char_indices().nth(n - 1) {
                Some((idx, c)) => idx + c.len_utf8(),
                None => {
                    packets.push(Err(PacketParseError::InvalidPacketLen));
                    break;
                }
            },
        };
        let (packet, next) = after.split_at(end);
        packets.push(Packet::decode(packet, ProtocolVersion::V3));
        rest = next;
    }
    Ok(packets)
}

fn v3_binary_decoder(data: &[u8]) -> Result<Vec<Result<Packet, PacketParseError>>, PayloadError> {
    let mut packets = Vec::new();
    let mut rest = data;
    while let Some((&kind, tail)) = rest.split_first() {
        if kind > 1 {
            return Err(PayloadError::InvalidEntryType(kind));
        }
        let sep = tail
            .iter()
            .position(|b| *b == BINARY_PACKET_SEPARATOR_V3)
            .ok_or(PayloadError::InvalidLengthPrefix)?;
        let len = parse_ascii_len(tail[..sep].iter().copied())?;

        let body = &tail[sep + 1..];
        if body.len() < len {
            packets.push(Err(PacketParseError::InvalidPacketLen));
            break;
        }
        let (entry, next) = body.split_at(len);
        let packet = if kind == 0 {
            std::str::from_utf8(entry)
                .map_err(PacketParseError::from)
                .and_then(|packet| Packet::decode(packet, ProtocolVersion::V3))
        } else {
            match entry.split_first() {
                Some((&BINARY_MARKER_V3, bin)) => Ok(Packet::Binary(Bytes::copy_from_slice(bin))),
                Some((&b, _)) => Err(PacketParseError::InvalidPacketType(Some(b as char))),
                None => Err(PacketParseError::InvalidPacketType(None)),
            }
        };
        packets.push(packet);
        rest = next;
    }
    Ok(packets)
}

/// Read a length from a list of decimal digit values (0 to 9).
fn parse_ascii_len(digits: impl Iterator<Item = u8>) -> Result<usize, PayloadError> {
    let mut len: Option<usize> = None;
    for digit in digits {
        if digit > 9 {
            return Err(PayloadError::InvalidLengthPrefix);
        }
        len = len
            .unwrap_or(0)
            .checked_mul(10)
            .and_then(|l| l.checked_add(digit as usize));
        if len.is_none() {
            return Err(PayloadError::InvalidLengthPrefix);
        }
    }
    len.ok_or(PayloadError::InvalidLengthPrefix)
}
