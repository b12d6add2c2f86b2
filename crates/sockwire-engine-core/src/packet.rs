use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ProtocolVersion, Sid};

/// Marker byte prepended to V3 binary data. It is the `message` packet type as a raw byte.
pub(crate) const BINARY_MARKER_V3: u8 = 0x04;

/// An Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Handshake packet, sent by the server when a session is opened.
    Open(OpenPacket),
    /// Closes the session.
    Close,
    /// Heartbeat ping. Sent by the server with V4 and by the client with V3.
    Ping,
    /// Heartbeat pong.
    Pong,
    /// `2probe`, first packet sent by a client on a websocket it wants to upgrade to.
    PingProbe,
    /// `3probe`, answer to [`Packet::PingProbe`].
    PongProbe,
    /// Text message.
    Message(String),
    /// Completes an upgrade to websocket.
    Upgrade,
    /// Does nothing. Used to release a pending long-polling request during an upgrade.
    Noop,
    /// Binary message.
    ///
    /// With polling it is written as base64 text, with websocket it is sent in a binary frame.
    Binary(Bytes),
}

/// Error returned when a single packet cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum PacketParseError {
    /// The open packet payload is not a valid handshake object.
    #[error("invalid open packet: {0}")]
    InvalidOpenPacket(#[from] serde_json::Error),
    /// The leading char does not map to any packet type.
    #[error("invalid packet type: {0:?}")]
    InvalidPacketType(Option<char>),
    /// The packet is shorter than its declared length.
    #[error("invalid packet length")]
    InvalidPacketLen,
    /// The packet is not valid utf8.
    #[error("invalid utf8 packet: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    /// The base64 encoded binary packet cannot be decoded.
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl From<std::string::FromUtf8Error> for PacketParseError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        PacketParseError::InvalidUtf8(err.utf8_error())
    }
}

/// A websocket frame, independently of the websocket implementation used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

impl Packet {
    /// Check if the packet is a binary packet.
    pub fn is_binary(&self) -> bool {
        matches!(self, Packet::Binary(_))
    }

    /// Upper bound of the packet length once encoded as text.
    ///
    /// If `b64` is false, binary packets are counted with their raw length.
    pub fn size_hint(&self, protocol: ProtocolVersion, b64: bool) -> usize {
        match self {
            // max length of an encoded handshake with u64::MAX values
            Packet::Open(_) => 157,
            Packet::Close
            | Packet::Ping
            | Packet::Pong
            | Packet::Upgrade
            | Packet::Noop => 1,
            Packet::PingProbe | Packet::PongProbe => 6,
            Packet::Message(msg) => 1 + msg.len(),
            Packet::Binary(data) if b64 => {
                let prefix = match protocol {
                    ProtocolVersion::V3 => 2,
                    ProtocolVersion::V4 => 1,
                };
                prefix + base64::encoded_len(data.len(), true).unwrap_or(usize::MAX - prefix)
            }
            Packet::Binary(data) => 1 + data.len(),
        }
    }

    /// Encode the packet in its text form.
    ///
    /// Binary packets are base64 encoded with a `b` prefix for V4 and a `b4` prefix for V3.
    pub fn encode(&self, protocol: ProtocolVersion) -> String {
        let mut buf = String::with_capacity(self.size_hint(protocol, true));
        match self {
            Packet::Open(open) => {
                buf.push('0');
                // OpenPacket only holds strings and integers, it cannot fail to serialize.
                buf.push_str(&serde_json::to_string(open).unwrap_or_default());
            }
            Packet::Close => buf.push('1'),
            Packet::Ping => buf.push('2'),
            Packet::Pong => buf.push('3'),
            Packet::PingProbe => buf.push_str("2probe"),
            Packet::PongProbe => buf.push_str("3probe"),
            Packet::Message(msg) => {
                buf.push('4');
                buf.push_str(msg);
            }
            Packet::Upgrade => buf.push('5'),
            Packet::Noop => buf.push('6'),
            Packet::Binary(data) => {
                buf.push_str(match protocol {
                    ProtocolVersion::V3 => "b4",
                    ProtocolVersion::V4 => "b",
                });
                STANDARD.encode_string(data, &mut buf);
            }
        }
        buf
    }

    /// Decode a packet from its text form.
    pub fn decode(value: &str, protocol: ProtocolVersion) -> Result<Packet, PacketParseError> {
        let mut chars = value.chars();
        let Some(kind) = chars.next() else {
            return Err(PacketParseError::InvalidPacketType(None));
        };
        let rest = chars.as_str();
        let packet = match kind {
            '0' => Packet::Open(serde_json::from_str(rest)?),
            '1' => Packet::Close,
            '2' if rest == "probe" => Packet::PingProbe,
            '2' => Packet::Ping,
            '3' if rest == "probe" => Packet::PongProbe,
            '3' => Packet::Pong,
            '4' => Packet::Message(rest.to_owned()),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            'b' => {
                let data = match protocol {
                    ProtocolVersion::V3 => rest
                        .strip_prefix('4')
                        .ok_or(PacketParseError::InvalidPacketType(Some('b')))?,
                    ProtocolVersion::V4 => rest,
                };
                Packet::Binary(STANDARD.decode(data)?.into())
            }
            c => return Err(PacketParseError::InvalidPacketType(Some(c))),
        };
        Ok(packet)
    }

    /// Encode the packet as a websocket frame.
    pub fn into_frame(self, protocol: ProtocolVersion) -> Frame {
        match (self, protocol) {
            (Packet::Binary(data), ProtocolVersion::V4) => Frame::Binary(data),
            (Packet::Binary(data), ProtocolVersion::V3) => {
                let mut buf = BytesMut::with_capacity(data.len() + 1);
                buf.put_u8(BINARY_MARKER_V3);
                buf.put_slice(&data);
                Frame::Binary(buf.freeze())
            }
            (packet, protocol) => Frame::Text(packet.encode(protocol)),
        }
    }

    /// Decode a packet from a websocket frame.
    pub fn from_frame(frame: Frame, protocol: ProtocolVersion) -> Result<Packet, PacketParseError> {
        match (frame, protocol) {
            (Frame::Text(text), protocol) => Packet::decode(&text, protocol),
            (Frame::Binary(data), ProtocolVersion::V4) => Ok(Packet::Binary(data)),
            (Frame::Binary(mut data), ProtocolVersion::V3) => match data.first().copied() {
                Some(BINARY_MARKER_V3) => Ok(Packet::Binary(data.split_off(1))),
                Some(b) => Err(PacketParseError::InvalidPacketType(Some(b as char))),
                None => Err(PacketParseError::InvalidPacketType(None)),
            },
        }
    }
}

/// Handshake payload of the [`Packet::Open`] packet.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    /// The session id.
    pub sid: Sid,
    /// The transports the session may upgrade to.
    pub upgrades: Vec<String>,
    /// Heartbeat interval in milliseconds.
    pub ping_interval: u64,
    /// Heartbeat timeout in milliseconds.
    pub ping_timeout: u64,
    /// Maximum number of bytes in a long-polling payload.
    /// V3 servers may omit it.
    #[serde(default = "default_max_payload")]
    pub max_payload: u64,
}

fn default_max_payload() -> u64 {
    100_000
}

impl Default for OpenPacket {
    fn default() -> Self {
        Self {
            sid: Sid::ZERO,
            upgrades: vec!["websocket".to_string()],
            ping_interval: 25_000,
            ping_timeout: 20_000,
            max_payload: default_max_payload(),
        }
    }
}

/// A group of packets that must be sent without any other packet in between.
///
/// A socket.io binary event is made of one text packet followed by its attachments,
/// they are queued together so they cannot interleave with other messages.
pub type PacketBuf = SmallVec<[Packet; 2]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_packet_encode() {
        let sid: Sid = "AA9AAA0AAzAAAAHs".parse().unwrap();
        let packet = Packet::Open(OpenPacket {
            sid,
            ..Default::default()
        });
        assert_eq!(
            packet.encode(ProtocolVersion::V4),
            "0{\"sid\":\"AA9AAA0AAzAAAAHs\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":20000,\"maxPayload\":100000}"
        );
    }

    #[test]
    fn open_packet_decode_without_max_payload() {
        let raw = "0{\"sid\":\"AA9AAA0AAzAAAAHs\",\"upgrades\":[],\"pingInterval\":300,\"pingTimeout\":200}";
        let Packet::Open(open) = Packet::decode(raw, ProtocolVersion::V3).unwrap() else {
            panic!("expected open packet");
        };
        assert_eq!(open.ping_interval, 300);
        assert_eq!(open.max_payload, 100_000);
        assert!(open.upgrades.is_empty());
    }

    #[test]
    fn packet_text_forms() {
        use ProtocolVersion::*;
        let cases = [
            (Packet::Close, "1"),
            (Packet::Ping, "2"),
            (Packet::Pong, "3"),
            (Packet::PingProbe, "2probe"),
            (Packet::PongProbe, "3probe"),
            (Packet::Message("hello€".into()), "4hello€"),
            (Packet::Upgrade, "5"),
            (Packet::Noop, "6"),
        ];
        for (packet, text) in cases {
            for protocol in [V3, V4] {
                assert_eq!(packet.encode(protocol), text);
                assert_eq!(Packet::decode(text, protocol).unwrap(), packet);
            }
        }
    }

    #[test]
    fn binary_text_form_depends_on_version() {
        let packet = Packet::Binary(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(packet.encode(ProtocolVersion::V4), "bAQID");
        assert_eq!(packet.encode(ProtocolVersion::V3), "b4AQID");
        assert_eq!(Packet::decode("b4AQID", ProtocolVersion::V3).unwrap(), packet);
        assert_eq!(Packet::decode("bAQID", ProtocolVersion::V4).unwrap(), packet);

        // "4AQID" is valid base64 on its own, V4 must not strip it
        let decoded = Packet::decode("b4AQI", ProtocolVersion::V4).unwrap();
        assert_eq!(decoded, Packet::Binary(STANDARD.decode("4AQI").unwrap().into()));
        assert!(Packet::decode("bAQID", ProtocolVersion::V3).is_err());
    }

    #[test]
    fn binary_frames() {
        let packet = Packet::Binary(Bytes::from_static(&[1, 2, 3]));
        let v3 = packet.clone().into_frame(ProtocolVersion::V3);
        assert_eq!(v3, Frame::Binary(Bytes::from_static(&[4, 1, 2, 3])));
        assert_eq!(Packet::from_frame(v3, ProtocolVersion::V3).unwrap(), packet);

        let v4 = packet.clone().into_frame(ProtocolVersion::V4);
        assert_eq!(v4, Frame::Binary(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(Packet::from_frame(v4, ProtocolVersion::V4).unwrap(), packet);

        let bad = Frame::Binary(Bytes::from_static(&[2, 1]));
        assert!(Packet::from_frame(bad, ProtocolVersion::V3).is_err());
    }

    #[test]
    fn invalid_packets() {
        assert!(matches!(
            Packet::decode("", ProtocolVersion::V4),
            Err(PacketParseError::InvalidPacketType(None))
        ));
        assert!(matches!(
            Packet::decode("9", ProtocolVersion::V4),
            Err(PacketParseError::InvalidPacketType(Some('9')))
        ));
        assert!(matches!(
            Packet::decode("0{}", ProtocolVersion::V4),
            Err(PacketParseError::InvalidOpenPacket(_))
        ));
        assert!(matches!(
            Packet::decode("b$$$", ProtocolVersion::V4),
            Err(PacketParseError::Base64Decode(_))
        ));
    }

    #[test]
    fn size_hint_bounds_encoding() {
        let packets = [
            Packet::Open(OpenPacket {
                sid: Sid::new(),
                upgrades: vec!["websocket".into()],
                ping_interval: u64::MAX,
                ping_timeout: u64::MAX,
                max_payload: u64::MAX,
            }),
            Packet::Message("hello".into()),
            Packet::Binary(Bytes::from_static(&[1, 2, 3, 4, 5])),
            Packet::PongProbe,
        ];
        for packet in packets {
            for protocol in [ProtocolVersion::V3, ProtocolVersion::V4] {
                assert!(packet.encode(protocol).len() <= packet.size_hint(protocol, true));
            }
        }
    }
}
