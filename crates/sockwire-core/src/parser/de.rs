use std::io::Cursor;

use bytes::Buf;

use crate::{
    errors::ParseError,
    packet::{Packet, PacketData},
    value::Value,
};

/// Decode the text form of a packet.
///
/// Binary packets are returned with their placeholders and the number of attachments to wait for.
pub fn deserialize_packet(data: &str) -> Result<(Packet, Option<usize>), ParseError> {
    if data.is_empty() {
        return Err(ParseError::InvalidPacketType);
    }
    // It is possible to parse the packet from a byte slice because separators are only ASCII
    let mut reader = Cursor::new(data);
    let index = reader.get_u8();
    let index = (b'0'..=b'6')
        .contains(&index)
        .then_some(index)
        .ok_or(ParseError::InvalidPacketType)?;

    let attachments: Option<usize> = if index == b'5' || index == b'6' {
        // Every attachment has a placeholder in the payload, so the count is bounded by its length
        let count = read_attachments(&mut reader)
            .filter(|&count| count <= data.len())
            .ok_or(ParseError::InvalidAttachments)?;
        Some(count)
    } else {
        None
    };

    // Custom nsps will start with a slash
    let ns = if reader.has_remaining() && reader.chunk()[0] == b'/' {
        read_nsp(&mut reader)
    } else {
        "/"
    };
    let ack = read_ack(&mut reader);

    let payload = &data[reader.position() as usize..];
    let value = if payload.is_empty() {
        None
    } else {
        Some(serde_json::from_str::<Value>(payload)?)
    };

    let inner = match index {
        b'0' => PacketData::Connect(value),
        b'1' => PacketData::Disconnect,
        b'2' => PacketData::Event(event_data(value)?, ack),
        b'3' => PacketData::EventAck(ack_data(value)?, ack.ok_or(ParseError::InvalidData)?),
        b'4' => PacketData::ConnectError(error_message(value)?),
        b'5' => PacketData::BinaryEvent(event_data(value)?, ack),
        b'6' => PacketData::BinaryAck(ack_data(value)?, ack.ok_or(ParseError::InvalidData)?),
        _ => return Err(ParseError::InvalidPacketType),
    };
    let packet = Packet {
        inner,
        ns: ns.to_string(),
    };
    Ok((packet, attachments))
}

fn event_data(value: Option<Value>) -> Result<Value, ParseError> {
    match value {
        Some(Value::Array(values)) if matches!(values.first(), Some(Value::String(_))) => {
            Ok(Value::Array(values))
        }
        _ => Err(ParseError::InvalidEventName),
    }
}

fn ack_data(value: Option<Value>) -> Result<Value, ParseError> {
    match value {
        Some(value @ Value::Array(_)) => Ok(value),
        _ => Err(ParseError::InvalidData),
    }
}

/// V4 servers send `{"message": "..."}`, V3 servers send a bare string.
fn error_message(value: Option<Value>) -> Result<String, ParseError> {
    match value {
        None => Ok(String::new()),
        Some(Value::String(message)) => Ok(message),
        Some(Value::Object(entries)) => entries
            .into_iter()
            .find_map(|(k, v)| match v {
                Value::String(message) if k == "message" => Some(message),
                _ => None,
            })
            .ok_or(ParseError::InvalidData),
        Some(_) => Err(ParseError::InvalidData),
    }
}

fn read_attachments(reader: &mut Cursor<&str>) -> Option<usize> {
    let data = *reader.get_ref();
    let start_index = reader.position() as usize;
    loop {
        match reader.has_remaining().then(|| reader.get_u8()) {
            Some(c) if c.is_ascii_digit() => (),
            Some(b'-') if reader.position() as usize > start_index + 1 => {
                break data[start_index..reader.position() as usize - 1]
                    .parse()
                    .ok();
            }
            _ => break None,
        }
    }
}

/// The namespace ends with a comma, or with the end of the packet (e.g `1/custom`).
/// A V3 query string (`/custom?token=1,`) is dropped.
fn read_nsp<'a>(reader: &mut Cursor<&'a str>) -> &'a str {
    let data: &'a str = *reader.get_ref();
    let start_index = reader.position() as usize;
    let end_index = loop {
        match reader.has_remaining().then(|| reader.get_u8()) {
            Some(b',') => break reader.position() as usize - 1,
            None => break reader.position() as usize,
            Some(_) => (),
        }
    };
    let nsp = &data[start_index..end_index];
    nsp.split_once('?').map_or(nsp, |(nsp, _)| nsp)
}

/// The ack id is the run of digits right before the json payload.
fn read_ack(reader: &mut Cursor<&str>) -> Option<i64> {
    let start_index = reader.position() as usize;
    let data = *reader.get_ref();
    loop {
        match reader.has_remaining().then(|| reader.chunk()[0]) {
            Some(c) if c.is_ascii_digit() => reader.advance(1),
            Some(b'[' | b'{') if reader.position() as usize > start_index => {
                break data[start_index..reader.position() as usize].parse().ok();
            }
            _ => {
                reader.set_position(start_index as u64);
                break None;
            }
        }
    }
}
