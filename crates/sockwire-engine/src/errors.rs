use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode, header::CONTENT_TYPE};
use sockwire_engine_core::{Packet, PacketBuf, PacketParseError, Sid, payload::PayloadError};

use crate::{DisconnectReason, service::QueryError, transport::TransportError};

/// Engine.IO errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error decoding packet: {0}")]
    PacketParse(#[from] PacketParseError),
    #[error("error decoding payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("bad packet received: {0:?}")]
    BadPacket(Packet),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("upgrade error")]
    Upgrade,
    #[error("upgrade timeout")]
    UpgradeTimeout,
    #[error("multiple http polling error")]
    MultipleHttpPolling,
    #[error("unknown session id: {0}")]
    UnknownSessionID(Sid),
    #[error("transport mismatch")]
    TransportMismatch,
    #[error("invalid request: {0}")]
    Query(#[from] QueryError),
    #[error("session closed")]
    Aborted,
}

/// Error returned when a packet is sent to a closed session.
/// It gives back the packets that could not be sent.
#[derive(thiserror::Error, Debug)]
#[error("session closed")]
pub struct SendError(pub PacketBuf);

impl From<SendError> for Error {
    fn from(_: SendError) -> Self {
        Error::Aborted
    }
}

/// Convert an [`Error`] to a [`DisconnectReason`] if possible.
///
/// If the error cannot be converted, it is not fatal and the session can be kept alive.
impl From<&Error> for Option<DisconnectReason> {
    fn from(err: &Error) -> Self {
        use Error::*;
        match err {
            Transport(_) => Some(DisconnectReason::TransportError),
            BadPacket(_) | PacketParse(_) | Payload(_) => Some(DisconnectReason::PacketParsingError),
            HeartbeatTimeout => Some(DisconnectReason::HeartbeatTimeout),
            MultipleHttpPolling => Some(DisconnectReason::MultipleHttpPollingError),
            Upgrade | UpgradeTimeout | UnknownSessionID(_) | TransportMismatch | Query(_)
            | Aborted => None,
        }
    }
}

fn response(status: StatusCode, body: Bytes) -> Response<Bytes> {
    let mut res = Response::new(body);
    *res.status_mut() = status;
    res
}

fn conn_err_response(code: u8, message: &str) -> Response<Bytes> {
    let body = format!("{{\"code\":\"{code}\",\"message\":\"{message}\"}}");
    let mut res = response(StatusCode::BAD_REQUEST, body.into());
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    res
}

/// Convert an error into an http response.
///
/// Known errors are answered with the engine.io error codes, everything else is a 500.
impl From<Error> for Response<Bytes> {
    fn from(err: Error) -> Self {
        match err {
            Error::Payload(PayloadError::PayloadTooLarge { .. }) => {
                response(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new())
            }
            Error::Query(err) => conn_err_response(err.code(), err.message()),
            Error::UnknownSessionID(_) => conn_err_response(1, "Session ID unknown"),
            Error::TransportMismatch => conn_err_response(3, "Bad request"),
            Error::BadPacket(_)
            | Error::PacketParse(_)
            | Error::Payload(_)
            | Error::MultipleHttpPolling => response(StatusCode::BAD_REQUEST, Bytes::new()),
            Error::Transport(TransportError::Http(status)) => response(status, Bytes::new()),
            _e => {
                #[cfg(feature = "tracing")]
                tracing::debug!("uncaught error {_e:?}");
                response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
            }
        }
    }
}
