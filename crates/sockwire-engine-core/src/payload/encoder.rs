//! Payload encoders.
//!
//! There are three layouts:
//! * V4: `<packet>\x1e<packet>`;
//! * V3 string: `<char count>:<packet><char count>:<packet>`, binary packets are written `b4<base64>`;
//! * V3 binary: `<0|1><length digits as raw bytes>\xff<packet>` entries, used only when the
//!   client supports binary and at least one binary packet is sent.
//!
//! Every encoder takes packet groups from a [`PacketSource`] as long as they fit in `max_payload`.
//! The first group is always taken, even if it is bigger than `max_payload`, so a large
//! message cannot block the queue forever.

use bytes::{BufMut, BytesMut};

use super::{
    BINARY_PACKET_SEPARATOR_V3, PACKET_SEPARATOR_V4, PacketSource, Payload,
    STRING_PACKET_SEPARATOR_V3,
};
use crate::{Packet, PacketBuf, ProtocolVersion, packet::BINARY_MARKER_V3};

/// Encode the packets available in `source` into a single payload.
///
/// `b64` is set when a V3 client asked for base64 binary packets (`b64=1` query param).
/// It is ignored with V4, which always encodes binary packets as base64.
pub fn encode(
    source: &mut impl PacketSource,
    protocol: ProtocolVersion,
    b64: bool,
    max_payload: u64,
) -> Payload {
    match protocol {
        ProtocolVersion::V4 => v4_encoder(source, max_payload),
        ProtocolVersion::V3 if b64 => v3_string_encoder(source, max_payload),
        ProtocolVersion::V3 => v3_binary_encoder(source, max_payload),
    }
}

/// Pop the next group from the source if it fits in the payload.
///
/// `overhead` is the framing size added to each packet of the group.
fn take_fitting(
    source: &mut impl PacketSource,
    payload_len: usize,
    overhead: usize,
    max_payload: u64,
    hint: impl Fn(&Packet) -> usize,
) -> Option<PacketBuf> {
    let size: usize = source.peek()?.iter().map(|p| hint(p) + overhead).sum();
    if payload_len > 0 && (payload_len + size) as u64 > max_payload {
        return None;
    }
    source.pop()
}

/// Number of digits needed to write any packet length allowed by `max_payload`.
fn max_len_digits(max_payload: u64) -> usize {
    max_payload.checked_ilog10().unwrap_or(0) as usize + 1
}

fn v4_encoder(source: &mut impl PacketSource, max_payload: u64) -> Payload {
    let mut data = String::new();
    let hint = |p: &Packet| p.size_hint(ProtocolVersion::V4, true);
    while let Some(packets) = take_fitting(source, data.len(), 1, max_payload, hint) {
        for packet in packets {
            if !data.is_empty() {
                data.push(PACKET_SEPARATOR_V4 as char);
            }
            data.push_str(&packet.encode(ProtocolVersion::V4));
        }
    }
    Payload::new(data.into(), false)
}

fn v3_string_encoder(source: &mut impl PacketSource, max_payload: u64) -> Payload {
    let mut data = BytesMut::new();
    let overhead = max_len_digits(max_payload) + 1;
    let hint = |p: &Packet| p.size_hint(ProtocolVersion::V3, true);
    while let Some(packets) = take_fitting(source, data.len(), overhead, max_payload, hint) {
        for packet in packets {
            write_string_entry(packet, &mut data);
        }
    }
    Payload::new(data.freeze(), false)
}

fn v3_binary_encoder(source: &mut impl PacketSource, max_payload: u64) -> Payload {
    let overhead = max_len_digits(max_payload) + 2;
    let hint = |p: &Packet| p.size_hint(ProtocolVersion::V3, false);

    // The layout depends on the presence of a binary packet so everything is buffered first.
    let mut packets: Vec<Packet> = Vec::new();
    let mut estimated = 0;
    while let Some(group) = take_fitting(source, estimated, overhead, max_payload, hint) {
        for packet in group {
            estimated += hint(&packet) + overhead;
            packets.push(packet);
        }
    }

    let has_binary = packets.iter().any(Packet::is_binary);
    let mut data = BytesMut::with_capacity(estimated);
    for packet in packets {
        if has_binary {
            write_binary_entry(packet, &mut data);
        } else {
            write_string_entry(packet, &mut data);
        }
    }
    Payload::new(data.freeze(), has_binary)
}

/// `<char count>:<packet>`
fn write_string_entry(packet: Packet, data: &mut BytesMut) {
    let packet = packet.encode(ProtocolVersion::V3);
    let mut itoa = itoa::Buffer::new();
    data.put_slice(itoa.format(packet.chars().count()).as_bytes());
    data.put_u8(STRING_PACKET_SEPARATOR_V3);
    data.put_slice(packet.as_bytes());
}

/// `<0|1><length digits>\xff<packet>`
///
/// The length of a binary entry counts the leading message marker byte.
fn write_binary_entry(packet: Packet, data: &mut BytesMut) {
    let mut itoa = itoa::Buffer::new();
    let mut put_len = |data: &mut BytesMut, len: usize| {
        for digit in itoa.format(len).bytes() {
            data.put_u8(digit - b'0');
        }
        data.put_u8(BINARY_PACKET_SEPARATOR_V3);
    };
    match packet {
        Packet::Binary(bin) => {
            data.put_u8(0x01);
            put_len(data, bin.len() + 1);
            data.put_u8(BINARY_MARKER_V3);
            data.put_slice(&bin);
        }
        packet => {
            let packet = packet.encode(ProtocolVersion::V3);
            data.put_u8(0x00);
            put_len(data, packet.len());
            data.put_slice(packet.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;
    use smallvec::smallvec;

    use super::*;

    const MAX_PAYLOAD: u64 = 100_000;

    fn queue() -> VecDeque<PacketBuf> {
        VecDeque::from([
            smallvec![Packet::Message("hello€".into())],
            smallvec![Packet::Binary(Bytes::from_static(&[1, 2, 3, 4]))],
            smallvec![Packet::Message("hello€".into())],
        ])
    }

    #[test]
    fn encode_v4_payload() {
        let payload = encode(&mut queue(), ProtocolVersion::V4, false, MAX_PAYLOAD);
        assert_eq!(payload.data, "4hello€\x1ebAQIDBA==\x1e4hello€".as_bytes());
        assert!(!payload.has_binary);
        assert_eq!(payload.content_type(), "text/plain; charset=UTF-8");
    }

    #[test]
    fn encode_v3_b64_payload() {
        let payload = encode(&mut queue(), ProtocolVersion::V3, true, MAX_PAYLOAD);
        assert_eq!(payload.data, "7:4hello€10:b4AQIDBA==7:4hello€".as_bytes());
        assert!(!payload.has_binary);
    }

    #[test]
    fn encode_v3_binary_payload() {
        let mut expected = vec![0, 9, 0xff];
        expected.extend_from_slice("4hello€".as_bytes());
        expected.extend_from_slice(&[1, 5, 0xff, 4, 1, 2, 3, 4]);
        expected.extend_from_slice(&[0, 9, 0xff]);
        expected.extend_from_slice("4hello€".as_bytes());

        let payload = encode(&mut queue(), ProtocolVersion::V3, false, MAX_PAYLOAD);
        assert_eq!(payload.data, expected);
        assert!(payload.has_binary);
        assert_eq!(payload.content_type(), "application/octet-stream");
    }

    #[test]
    fn v3_without_binary_packet_uses_string_layout() {
        let mut source: VecDeque<PacketBuf> =
            VecDeque::from([smallvec![Packet::Message("hello€".into())]]);
        let payload = encode(&mut source, ProtocolVersion::V3, false, MAX_PAYLOAD);
        assert_eq!(payload.data, "7:4hello€".as_bytes());
        assert!(!payload.has_binary);
    }

    #[test]
    fn max_payload_splits_v4_payloads() {
        const MAX_PAYLOAD: u64 = 10;
        let mut source = queue();
        source.push_back(smallvec![Packet::Message("hello€".into())]);

        let payload = encode(&mut source, ProtocolVersion::V4, false, MAX_PAYLOAD);
        assert_eq!(payload.data, "4hello€".as_bytes());
        let payload = encode(&mut source, ProtocolVersion::V4, false, MAX_PAYLOAD + 10);
        assert_eq!(payload.data, "bAQIDBA==\x1e4hello€".as_bytes());
        let payload = encode(&mut source, ProtocolVersion::V4, false, MAX_PAYLOAD + 10);
        assert_eq!(payload.data, "4hello€".as_bytes());
        assert!(source.is_empty());
    }

    #[test]
    fn oversized_group_is_still_sent_alone() {
        let mut source: VecDeque<PacketBuf> = VecDeque::from([
            smallvec![
                Packet::Message("451-[\"bin\",{\"_placeholder\":true,\"num\":0}]".into()),
                Packet::Binary(Bytes::from_static(&[0; 64]))
            ],
            smallvec![Packet::Noop],
        ]);
        let payload = encode(&mut source, ProtocolVersion::V4, false, 8);
        let text = std::str::from_utf8(&payload.data).unwrap();
        assert_eq!(text.split('\x1e').count(), 2);
        assert_eq!(source.len(), 1);
    }
}
