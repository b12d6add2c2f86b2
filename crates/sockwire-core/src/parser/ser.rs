use bytes::Bytes;
use sockwire_engine_core::ProtocolVersion;

use crate::{
    attachments,
    packet::{Packet, PacketData},
    value::Value,
};

/// Encode a packet into its text form and its binary attachments.
///
/// Events and acks whose data holds binary values are always written as binary packets.
pub fn serialize_packet(packet: Packet, protocol: ProtocolVersion) -> (String, Vec<Bytes>) {
    let mut buffer = String::with_capacity(packet.ns.len() + 16);

    let (index, data, ack, bins) = match packet.inner {
        PacketData::Connect(data) => {
            let data = data.filter(|_| protocol == ProtocolVersion::V4);
            (0, data, None, Vec::new())
        }
        PacketData::Disconnect => (1, None, None, Vec::new()),
        PacketData::ConnectError(message) => {
            let data = match protocol {
                ProtocolVersion::V3 => Value::String(message),
                ProtocolVersion::V4 => {
                    Value::Object(vec![("message".into(), Value::String(message))])
                }
            };
            (4, Some(data), None, Vec::new())
        }
        PacketData::Event(data, ack) | PacketData::BinaryEvent(data, ack) => {
            let (data, bins) = attachments::extract(data);
            let index = if bins.is_empty() { 2 } else { 5 };
            (index, Some(data), ack, bins)
        }
        PacketData::EventAck(data, ack) | PacketData::BinaryAck(data, ack) => {
            let (data, bins) = attachments::extract(data);
            let index = if bins.is_empty() { 3 } else { 6 };
            (index, Some(data), Some(ack), bins)
        }
    };

    buffer.push(char::from(b'0' + index));
    if !bins.is_empty() {
        serialize_attachments(&mut buffer, bins.len());
    }
    serialize_nsp(&mut buffer, &packet.ns);
    serialize_ack(&mut buffer, ack);
    if let Some(data) = data {
        serialize_data(&mut buffer, &data);
    }
    (buffer, bins)
}

/// Adds binary attachment count prefix for binary packets
fn serialize_attachments(buffer: &mut String, attachments: usize) {
    let mut itoa_buf = itoa::Buffer::new();
    buffer.push_str(itoa_buf.format(attachments));
    buffer.push('-');
}

/// The default namespace is never written
fn serialize_nsp(buffer: &mut String, nsp: &str) {
    if !nsp.is_empty() && nsp != "/" {
        if !nsp.starts_with('/') {
            buffer.push('/');
        }
        buffer.push_str(nsp);
        buffer.push(',');
    }
}

fn serialize_ack(buffer: &mut String, ack: Option<i64>) {
    if let Some(ack) = ack {
        let mut itoa_buf = itoa::Buffer::new();
        buffer.push_str(itoa_buf.format(ack));
    }
}

fn serialize_data(buffer: &mut String, data: &Value) {
    // A value tree only has string keys and finite numbers, it always serializes.
    if let Ok(data) = serde_json::to_string(data) {
        buffer.push_str(&data);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sockwire_engine_core::Sid;

    use super::*;
    use crate::{
        packet::ConnectPacket,
        value::{to_args, to_value},
    };

    fn encode(packet: Packet, protocol: ProtocolVersion) -> String {
        let (data, bins) = serialize_packet(packet, protocol);
        assert!(bins.is_empty());
        data
    }

    #[test]
    fn connect() {
        let sid = Sid::new();
        let value = to_value(&ConnectPacket { sid }).unwrap();
        let packet = Packet::connect("/", Some(value.clone()));
        assert_eq!(
            encode(packet.clone(), ProtocolVersion::V4),
            format!("0{{\"sid\":\"{sid}\"}}")
        );
        assert_eq!(encode(packet, ProtocolVersion::V3), "0");

        let packet = Packet::connect("/admin", Some(value));
        assert_eq!(
            encode(packet.clone(), ProtocolVersion::V4),
            format!("0/admin,{{\"sid\":\"{sid}\"}}")
        );
        assert_eq!(encode(packet, ProtocolVersion::V3), "0/admin,");
    }

    #[test]
    fn disconnect() {
        assert_eq!(encode(Packet::disconnect("/"), ProtocolVersion::V4), "1");
        assert_eq!(encode(Packet::disconnect("/admin"), ProtocolVersion::V4), "1/admin,");
    }

    #[test]
    fn connect_error() {
        let packet = Packet::connect_error("/admin", "Invalid namespace");
        assert_eq!(
            encode(packet.clone(), ProtocolVersion::V4),
            "4/admin,{\"message\":\"Invalid namespace\"}"
        );
        assert_eq!(
            encode(packet, ProtocolVersion::V3),
            "4/admin,\"Invalid namespace\""
        );
    }

    #[test]
    fn event() {
        let args = to_args(&json!({ "data": "value™" })).unwrap();
        let packet = Packet::event("/", "event", args.clone());
        assert_eq!(
            encode(packet, ProtocolVersion::V4),
            "2[\"event\",{\"data\":\"value™\"}]"
        );

        let mut packet = Packet::event("/admin", "event", args);
        packet.inner.set_ack_id(7);
        assert_eq!(
            encode(packet, ProtocolVersion::V4),
            "2/admin,7[\"event\",{\"data\":\"value™\"}]"
        );
    }

    #[test]
    fn ack() {
        let packet = Packet::ack("/", to_args(&("hi", 1)).unwrap(), 54);
        assert_eq!(encode(packet, ProtocolVersion::V3), "354[\"hi\",1]");
    }

    #[test]
    fn binary_event() {
        let args = to_args(&(json!({ "data": 1 }), Bytes::from_static(&[1]))).unwrap();
        let mut packet = Packet::event("/chat", "event", args);
        packet.inner.set_ack_id(3);
        let (data, bins) = serialize_packet(packet, ProtocolVersion::V4);
        assert_eq!(
            data,
            "51-/chat,3[\"event\",{\"data\":1},{\"_placeholder\":true,\"num\":0}]"
        );
        assert_eq!(bins, vec![Bytes::from_static(&[1])]);
    }

    #[test]
    fn binary_ack() {
        let args = vec![
            Value::Binary(Bytes::from_static(&[1])),
            Value::Binary(Bytes::from_static(&[2])),
        ];
        let (data, bins) = serialize_packet(Packet::ack("/", args, 12), ProtocolVersion::V4);
        assert_eq!(
            data,
            "62-12[{\"_placeholder\":true,\"num\":0},{\"_placeholder\":true,\"num\":1}]"
        );
        assert_eq!(bins.len(), 2);
    }
}
