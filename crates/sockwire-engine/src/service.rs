//! Request parsing and the long-polling dispatcher.
//!
//! [`handle_request`] serves any `http::Request<Bytes>` whose path starts with the configured
//! `req_path`:
//! * `GET` without `sid` opens a session
//! * `GET` with `sid` reads the session queue
//! * `POST` with `sid` writes packets to the session
//!
//! Websocket requests are upgraded by the host and handed over to
//! [`EngineIo::on_ws_connection`].
use std::{str::FromStr, sync::Arc};

use bytes::Bytes;
use http::{
    HeaderValue, Method, Request, Response, StatusCode,
    header::CONTENT_TYPE,
    request::Parts,
};
use sockwire_engine_core::{
    ProtocolVersion, Sid, TransportType,
    payload::{BINARY_CONTENT_TYPE, Payload},
};

use crate::{config::EngineIoConfig, engine::EngineIo, errors::Error, handler::EngineIoHandler};

/// Errors raised by an invalid engine.io query.
/// Each one maps to an engine.io error code.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    #[error("transport unknown")]
    UnknownTransport,
    #[error("session id unknown")]
    UnknownSessionID,
    #[error("bad handshake method")]
    BadHandshakeMethod,
    #[error("bad request")]
    BadRequest,
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,
}

impl QueryError {
    /// The engine.io error code
    pub fn code(&self) -> u8 {
        use QueryError::*;
        match self {
            UnknownTransport => 0,
            UnknownSessionID => 1,
            BadHandshakeMethod => 2,
            BadRequest => 3,
            UnsupportedProtocolVersion => 5,
        }
    }

    /// The engine.io error message
    pub fn message(&self) -> &'static str {
        use QueryError::*;
        match self {
            UnknownTransport => "Transport unknown",
            UnknownSessionID => "Session ID unknown",
            BadHandshakeMethod => "Bad handshake method",
            BadRequest => "Bad request",
            UnsupportedProtocolVersion => "Unsupported protocol version",
        }
    }
}

/// The request information extracted from the request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// The protocol version used by the client.
    pub protocol: ProtocolVersion,
    /// The session id if present in the request.
    pub sid: Option<Sid>,
    /// The transport type used by the client.
    pub transport: TransportType,
    /// The request method.
    pub method: Method,
    /// If the client asked for base64 encoding of binary packets (V3 only).
    pub b64: bool,
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

impl RequestInfo {
    /// Parse the request URI to extract the protocol, the transport and the session id.
    pub fn parse(req: &Parts, config: &EngineIoConfig) -> Result<Self, QueryError> {
        use QueryError::*;
        let query = req.uri.query().unwrap_or_default();

        let protocol = query_param(query, "EIO")
            .and_then(|v| ProtocolVersion::from_str(v).ok())
            .filter(|p| config.allowed_protocol(*p))
            .ok_or(UnsupportedProtocolVersion)?;

        let transport = query_param(query, "transport")
            .ok_or(UnknownTransport)
            .and_then(|t| TransportType::from_str(t).map_err(|_| UnknownTransport))?;

        if !config.allowed_transport(transport) {
            return Err(BadRequest);
        }

        let sid = query_param(query, "sid")
            .map(|sid| sid.parse().map_err(|_| UnknownSessionID))
            .transpose()?;

        let b64 = query_param(query, "b64").is_some_and(|v| v != "0" && v != "false");

        let method = req.method.clone();
        match (&method, sid) {
            (&Method::GET, _) | (&Method::POST, Some(_)) => Ok(RequestInfo {
                protocol,
                sid,
                transport,
                method,
                b64,
            }),
            (_, None) => Err(BadHandshakeMethod),
            (_, Some(_)) => Err(BadRequest),
        }
    }
}

fn payload_response(payload: Payload) -> Response<Bytes> {
    let content_type = HeaderValue::from_static(payload.content_type());
    let mut res = Response::new(payload.data);
    res.headers_mut().insert(CONTENT_TYPE, content_type);
    res
}

fn ok_response() -> Response<Bytes> {
    let mut res = Response::new(Bytes::from_static(b"ok"));
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    res
}

/// Dispatch a long-polling request to the engine and build its response.
pub async fn handle_request<H: EngineIoHandler>(
    engine: &Arc<EngineIo<H>>,
    req: Request<Bytes>,
) -> Response<Bytes> {
    if !req.uri().path().starts_with(&engine.config.req_path) {
        let mut res = Response::new(Bytes::new());
        *res.status_mut() = StatusCode::NOT_FOUND;
        return res;
    }

    let (parts, body) = req.into_parts();
    let info = match RequestInfo::parse(&parts, &engine.config) {
        Ok(info) => info,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("error parsing request: {:?}", e);
            return Error::from(e).into();
        }
    };

    let res = match info {
        RequestInfo {
            transport: TransportType::Websocket,
            ..
        } => Err(Error::Query(QueryError::BadRequest)),
        RequestInfo {
            protocol,
            sid: None,
            b64,
            ..
        } => engine
            .polling_open(protocol, parts, !b64)
            .map(payload_response),
        RequestInfo {
            sid: Some(sid),
            method: Method::GET,
            ..
        } => engine.polling_read(sid).await.map(payload_response),
        RequestInfo { sid: Some(sid), .. } => {
            let binary = parts
                .headers
                .get(CONTENT_TYPE)
                .is_some_and(|ct| ct.as_bytes().starts_with(BINARY_CONTENT_TYPE.as_bytes()));
            engine
                .polling_write(sid, body, binary)
                .map(|_| ok_response())
        }
    };
    res.unwrap_or_else(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(uri: &str) -> Result<RequestInfo, QueryError> {
        let req = Request::get(uri).body(()).unwrap().into_parts().0;
        RequestInfo::parse(&req, &EngineIoConfig::default())
    }

    #[test]
    fn request_info_polling() {
        let info = parse("http://localhost:3000/engine.io/?EIO=4&transport=polling").unwrap();
        assert_eq!(info.sid, None);
        assert_eq!(info.transport, TransportType::Polling);
        assert_eq!(info.protocol, ProtocolVersion::V4);
        assert_eq!(info.method, Method::GET);
        assert!(!info.b64);
    }

    #[test]
    fn request_info_websocket_with_sid() {
        let info =
            parse("http://localhost/engine.io/?EIO=3&transport=websocket&sid=AAAAAAAAAAAAAAHs&b64=1")
                .unwrap();
        assert_eq!(info.sid, Some("AAAAAAAAAAAAAAHs".parse().unwrap()));
        assert_eq!(info.transport, TransportType::Websocket);
        assert_eq!(info.protocol, ProtocolVersion::V3);
        assert!(info.b64);
    }

    #[test]
    fn query_errors() {
        assert_eq!(
            parse("http://localhost/engine.io/?EIO=4").unwrap_err(),
            QueryError::UnknownTransport
        );
        assert_eq!(
            parse("http://localhost/engine.io/?EIO=4&transport=grpc").unwrap_err(),
            QueryError::UnknownTransport
        );
        assert_eq!(
            parse("http://localhost/engine.io/?EIO=5&transport=polling").unwrap_err(),
            QueryError::UnsupportedProtocolVersion
        );
        assert_eq!(
            parse("http://localhost/engine.io/?transport=polling").unwrap_err(),
            QueryError::UnsupportedProtocolVersion
        );
        assert_eq!(
            parse("http://localhost/engine.io/?EIO=4&transport=polling&sid=nope").unwrap_err(),
            QueryError::UnknownSessionID
        );

        let req = Request::post("http://localhost/engine.io/?EIO=4&transport=polling")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(
            RequestInfo::parse(&req, &EngineIoConfig::default()).unwrap_err(),
            QueryError::BadHandshakeMethod
        );
    }

    #[test]
    fn disallowed_transport_is_a_bad_request() {
        let config = EngineIoConfig::builder()
            .transports([TransportType::Websocket])
            .build();
        let req = Request::get("http://localhost/engine.io/?EIO=4&transport=polling")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let err = RequestInfo::parse(&req, &config).unwrap_err();
        assert_eq!(err, QueryError::BadRequest);
        assert_eq!(err.code(), 3);
    }
}
