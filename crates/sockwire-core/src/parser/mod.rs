//! The socket.io text codec.
//!
//! Packets are encoded with [`encode`]. Incoming text and binary frames go through a [`Decoder`],
//! one per connection, which holds binary packets until all their attachments were received.
//!
//! ```rust
//! # use bytes::Bytes;
//! # use sockwire_core::{packet::{Packet, PacketData}, parser::{encode, Decoder}, value::Value};
//! # use sockwire_core::{ParseError, ProtocolVersion};
//! let args = vec![Value::Binary(Bytes::from_static(&[1, 2, 3]))];
//! let (text, attachments) = encode(Packet::event("/", "file", args), ProtocolVersion::V4);
//! assert_eq!(text, r#"51-["file",{"_placeholder":true,"num":0}]"#);
//!
//! let mut decoder = Decoder::default();
//! assert!(matches!(decoder.decode_str(&text), Err(ParseError::NeedsMoreBinaryData)));
//! let packet = decoder.decode_bin(attachments[0].clone()).unwrap();
//! assert!(matches!(packet.inner, PacketData::BinaryEvent(..)));
//! ```
use bytes::Bytes;
use sockwire_engine_core::ProtocolVersion;

use crate::{
    attachments,
    errors::ParseError,
    packet::{Packet, PacketData},
};

mod de;
mod ser;

/// Encode a packet into its text form and its binary attachments, in the order they must be sent.
pub fn encode(packet: Packet, protocol: ProtocolVersion) -> (String, Vec<Bytes>) {
    ser::serialize_packet(packet, protocol)
}

/// Decodes packets and reassembles binary packets with their attachments.
#[derive(Debug, Default)]
pub struct Decoder {
    partial: Option<PartialPacket>,
}

/// A binary packet waiting for its attachments
#[derive(Debug)]
struct PartialPacket {
    packet: Packet,
    expected: usize,
    attachments: Vec<Bytes>,
}

impl Decoder {
    /// Create a decoder without any pending packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a text packet.
    ///
    /// If the packet needs binary attachments it is kept and [`ParseError::NeedsMoreBinaryData`]
    /// is returned. The attachments must then be given to [`Decoder::decode_bin`].
    pub fn decode_str(&mut self, data: &str) -> Result<Packet, ParseError> {
        if self.partial.take().is_some() {
            return Err(ParseError::UnexpectedStringPacket);
        }
        let (packet, attachments) = de::deserialize_packet(data)?;
        match attachments {
            Some(expected) if expected > 0 => {
                self.partial = Some(PartialPacket {
                    packet,
                    expected,
                    attachments: Vec::new(),
                });
                Err(ParseError::NeedsMoreBinaryData)
            }
            Some(_) => resolve(packet, &[]),
            None => Ok(packet),
        }
    }

    /// Decode a binary attachment of the pending packet.
    ///
    /// Returns the complete packet once the last attachment is received,
    /// [`ParseError::NeedsMoreBinaryData`] before that.
    pub fn decode_bin(&mut self, bin: Bytes) -> Result<Packet, ParseError> {
        let partial = self
            .partial
            .as_mut()
            .ok_or(ParseError::UnexpectedBinaryPacket)?;
        partial.attachments.push(bin);
        if partial.attachments.len() < partial.expected {
            return Err(ParseError::NeedsMoreBinaryData);
        }
        match self.partial.take() {
            Some(partial) => resolve(partial.packet, &partial.attachments),
            None => Err(ParseError::UnexpectedBinaryPacket),
        }
    }

    /// Returns true if a binary packet is waiting for attachments.
    pub fn is_pending(&self) -> bool {
        self.partial.is_some()
    }
}

fn resolve(mut packet: Packet, bins: &[Bytes]) -> Result<Packet, ParseError> {
    match &mut packet.inner {
        PacketData::BinaryEvent(data, _) | PacketData::BinaryAck(data, _) => {
            *data = attachments::resolve(std::mem::take(data), bins)?;
        }
        _ => (),
    }
    Ok(packet)
}
