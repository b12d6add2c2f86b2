//! Socket.io packet implementation.
//! The [`Packet`] is the base unit of data that is sent over an engine.io session.
use serde::{Deserialize, Serialize};
use sockwire_engine_core::Sid;

use crate::value::Value;

/// The socket.io packet type.
/// Each packet has a type and a namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// The packet data
    pub inner: PacketData,
    /// The namespace the packet belongs to
    pub ns: String,
}

impl Packet {
    /// Create a connect packet, with an optional payload.
    ///
    /// The payload is only written with V4: the socket id when sent by a server,
    /// the auth object when sent by a client.
    pub fn connect(ns: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            inner: PacketData::Connect(value),
            ns: ns.into(),
        }
    }

    /// Create a disconnect packet for the given namespace
    pub fn disconnect(ns: impl Into<String>) -> Self {
        Self {
            inner: PacketData::Disconnect,
            ns: ns.into(),
        }
    }

    /// Create a connect error packet for the given namespace with a message
    pub fn connect_error(ns: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            inner: PacketData::ConnectError(message.into()),
            ns: ns.into(),
        }
    }

    /// Create an event packet for the given namespace.
    /// If the arguments contain binary data, it will be a binary packet.
    pub fn event(ns: impl Into<String>, event: impl Into<String>, args: Vec<Value>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(event.into()));
        data.extend(args);
        let data = Value::Array(data);
        Self {
            inner: if data.has_binary() {
                PacketData::BinaryEvent(data, None)
            } else {
                PacketData::Event(data, None)
            },
            ns: ns.into(),
        }
    }

    /// Create an ack packet for the given namespace.
    /// If the arguments contain binary data, it will be a binary packet.
    pub fn ack(ns: impl Into<String>, args: Vec<Value>, ack: i64) -> Self {
        let data = Value::Array(args);
        Self {
            inner: if data.has_binary() {
                PacketData::BinaryAck(data, ack)
            } else {
                PacketData::EventAck(data, ack)
            },
            ns: ns.into(),
        }
    }
}

/// | Type          | ID  | Usage                                                        |
/// |---------------|-----|--------------------------------------------------------------|
/// | CONNECT       | 0   | Used during the connection to a namespace.                   |
/// | DISCONNECT    | 1   | Used when disconnecting from a namespace.                    |
/// | EVENT         | 2   | Used to send data to the other side.                         |
/// | ACK           | 3   | Used to acknowledge an event.                                |
/// | CONNECT_ERROR | 4   | Used during the connection to a namespace.                   |
/// | BINARY_EVENT  | 5   | Used to send binary data to the other side.                  |
/// | BINARY_ACK    | 6   | Used to acknowledge an event (the response includes binary). |
///
/// Event data is an array `[event, ...args]`, ack data is the array of arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    /// Connect packet with optional payload
    Connect(Option<Value>),
    /// Disconnect packet, used to disconnect from a namespace
    Disconnect,
    /// Event packet with optional ack id, to request an ack from the other side
    Event(Value, Option<i64>),
    /// Event ack packet, to acknowledge an event
    EventAck(Value, i64),
    /// Connect error packet, sent when the namespace is invalid or a middleware failed
    ConnectError(String),
    /// Binary event packet with optional ack id, to request an ack from the other side
    BinaryEvent(Value, Option<i64>),
    /// Binary ack packet, to acknowledge an event with binary data
    BinaryAck(Value, i64),
}

impl PacketData {
    /// Returns the index of the packet type
    pub fn index(&self) -> usize {
        match self {
            PacketData::Connect(_) => 0,
            PacketData::Disconnect => 1,
            PacketData::Event(_, _) => 2,
            PacketData::EventAck(_, _) => 3,
            PacketData::ConnectError(_) => 4,
            PacketData::BinaryEvent(_, _) => 5,
            PacketData::BinaryAck(_, _) => 6,
        }
    }

    /// Set the ack id for the packet
    /// It will only set the ack id for the packets that support it
    pub fn set_ack_id(&mut self, ack_id: i64) {
        match self {
            PacketData::Event(_, ack) | PacketData::BinaryEvent(_, ack) => *ack = Some(ack_id),
            _ => {}
        };
    }

    /// Check if the packet is a binary packet (either binary event or binary ack)
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            PacketData::BinaryEvent(_, _) | PacketData::BinaryAck(_, _)
        )
    }
}

/// Connect packet payload sent by a V4 server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPacket {
    /// The socket ID
    pub sid: Sid,
}

/// Split event data into the event name and its arguments.
///
/// Returns `None` if the data is not an array starting with a string.
pub fn split_event(data: Value) -> Option<(String, Vec<Value>)> {
    match data {
        Value::Array(mut values) if matches!(values.first(), Some(Value::String(_))) => {
            match values.remove(0) {
                Value::String(event) => Some((event, values)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Get the arguments of ack data.
pub fn ack_args(data: Value) -> Vec<Value> {
    match data {
        Value::Array(values) => values,
        value => vec![value],
    }
}
