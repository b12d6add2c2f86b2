use std::{fmt, str::FromStr};

/// The Engine.IO protocol revision spoken on a session.
///
/// It drives the payload framing, the binary frame layout and the heartbeat direction:
/// with V3 the client pings the server, with V4 the server pings the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Engine.IO protocol revision 3 (socket.io v2 clients)
    V3 = 3,
    /// Engine.IO protocol revision 4 (socket.io v3 and v4 clients)
    V4 = 4,
}

impl ProtocolVersion {
    /// The value used for the `EIO` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V3 => "3",
            ProtocolVersion::V4 => "4",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `EIO` query parameter holds something else than `3` or `4`.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("unknown protocol version")]
pub struct UnknownProtocolVersionError;

impl FromStr for ProtocolVersion {
    type Err = UnknownProtocolVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3" => Ok(ProtocolVersion::V3),
            "4" => Ok(ProtocolVersion::V4),
            _ => Err(UnknownProtocolVersionError),
        }
    }
}

/// The transport carrying a session.
///
/// The discriminants are bit flags so a set of allowed transports fits in a `u8`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// HTTP long-polling
    Polling = 0x01,
    /// Websocket
    Websocket = 0x02,
}

impl TransportType {
    /// The value used for the `transport` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Polling => "polling",
            TransportType::Websocket => "websocket",
        }
    }
}

impl From<u8> for TransportType {
    fn from(t: u8) -> Self {
        if t == TransportType::Websocket as u8 {
            TransportType::Websocket
        } else {
            TransportType::Polling
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `transport` query parameter holds something else than `polling` or `websocket`.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("unknown transport type")]
pub struct UnknownTransportError;

impl FromStr for TransportType {
    type Err = UnknownTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportType::Polling),
            "websocket" => Ok(TransportType::Websocket),
            _ => Err(UnknownTransportError),
        }
    }
}
