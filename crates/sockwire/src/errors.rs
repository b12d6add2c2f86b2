use sockwire_core::{ParseError, Sid, value};
use sockwire_engine::DisconnectReason as EIoDisconnectReason;

/// Error type for the socket.io router.
#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("invalid event name")]
    InvalidEventName,

    #[error("invalid namespace")]
    InvalidNamespace,

    #[error("cannot find socket.io socket: {0}")]
    SocketGone(Sid),

    #[error("error parsing packet: {0}")]
    Parse(#[from] ParseError),
}

/// Convert an [`Error`] to an [`EIoDisconnectReason`] if possible.
///
/// If the error cannot be converted, the engine.io session is kept open.
impl From<&Error> for Option<EIoDisconnectReason> {
    fn from(value: &Error) -> Self {
        use EIoDisconnectReason::*;
        match value {
            Error::SocketGone(_) => Some(TransportClose),
            Error::InvalidPacketType | Error::InvalidEventName | Error::Parse(_) => {
                Some(PacketParsingError)
            }
            Error::InvalidNamespace => None,
        }
    }
}

/// Error type for ack operations.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The ack response cannot be decoded into the expected type.
    #[error("cannot deserialize ack response: {0}")]
    Decode(#[from] value::Error),

    /// The peer didn't respond to the ack in time.
    #[error("ack timeout error")]
    Timeout,

    /// The socket was closed before the ack was received.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

/// Error type for the underlying session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The socket is disconnected or its session is closed
    #[error("socket closed")]
    Closed,
}

/// Error type for sending operations.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    /// The data cannot be serialized.
    #[error("cannot serialize data: {0}")]
    Serialize(#[from] value::Error),

    /// The socket cannot send the packet.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

/// Error type for broadcast operations.
///
/// Every selected socket is tried, the failures are collected.
#[derive(thiserror::Error, Debug)]
pub enum BroadcastError {
    /// The data cannot be serialized.
    #[error("cannot serialize data: {0}")]
    Serialize(#[from] value::Error),

    /// Sending failed for some of the selected sockets.
    #[error("error sending data through the sockets: {0:?}")]
    Socket(Vec<SocketError>),
}

impl From<Vec<SocketError>> for BroadcastError {
    fn from(value: Vec<SocketError>) -> Self {
        Self::Socket(value)
    }
}

/// Error type when disconnecting a socket from a namespace.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectError {
    /// The socket is not connected to the namespace anymore.
    #[error("socket already disconnected")]
    AlreadyDisconnected,
}

/// Error returned when a [`SocketClient`](crate::client::SocketClient) cannot connect to a namespace.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    /// The engine.io session cannot be opened.
    #[error("engine.io error: {0}")]
    Engine(#[from] sockwire_engine::client::ConnectError),

    /// The server refused the connection, with the reason it gave.
    #[error("connection refused: {0}")]
    Rejected(String),

    /// The server did not answer the connect packet in time.
    #[error("connect timeout")]
    Timeout,

    /// The session was closed during the connection.
    #[error("session closed during the connection")]
    Closed,

    /// The server sent a packet that cannot be decoded.
    #[error("error parsing packet: {0}")]
    Parse(#[from] ParseError),
}
