use std::{future::Future, sync::Arc};

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, header::CONTENT_TYPE};
use sockwire_engine_core::payload::{BINARY_CONTENT_TYPE, Payload};

use crate::{
    engine::EngineIo,
    handler::EngineIoHandler,
    service,
    transport::{MemoryChannel, RawChannel, TransportError, memory_channel},
};

/// Body of a long-polling response.
#[derive(Debug, Clone)]
pub struct PollResponse {
    /// The payload
    pub data: Bytes,
    /// Whether it was sent with a binary content type
    pub binary: bool,
}

/// The network primitives an [`EngineClient`](super::EngineClient) needs.
///
/// `query` is the engine.io query string (`EIO=4&transport=polling&sid=...`),
/// the connector is responsible for the host and the path.
pub trait Connector: Send + Sync + 'static {
    /// The persistent socket type
    type Channel: RawChannel;

    /// Send a long-polling read request.
    fn get(&self, query: &str) -> impl Future<Output = Result<PollResponse, TransportError>> + Send;

    /// Send a long-polling write request.
    fn post(
        &self,
        query: &str,
        payload: Payload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Open a websocket.
    fn open_socket(
        &self,
        query: &str,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}

/// A [`Connector`] bound to an [`EngineIo`] server of the same process.
///
/// Requests go through [`service::handle_request`] and websockets are [`memory_channel`]s.
#[derive(Debug)]
pub struct InProcessConnector<H: EngineIoHandler> {
    engine: Arc<EngineIo<H>>,
}

impl<H: EngineIoHandler> InProcessConnector<H> {
    /// Connect to `engine`
    pub fn new(engine: Arc<EngineIo<H>>) -> Self {
        Self { engine }
    }

    fn request(&self, method: Method, query: &str, body: Bytes) -> Result<Request<Bytes>, TransportError> {
        Request::builder()
            .method(method)
            .uri(format!("{}/?{}", self.engine.config.req_path, query))
            .body(body)
            .map_err(|e| TransportError::Other(Box::new(e)))
    }
}

fn check_status(res: &Response<Bytes>) -> Result<(), TransportError> {
    match res.status() {
        StatusCode::OK => Ok(()),
        status => Err(TransportError::Http(status)),
    }
}

impl<H: EngineIoHandler> Connector for InProcessConnector<H> {
    type Channel = MemoryChannel;

    async fn get(&self, query: &str) -> Result<PollResponse, TransportError> {
        let req = self.request(Method::GET, query, Bytes::new())?;
        let res = service::handle_request(&self.engine, req).await;
        check_status(&res)?;
        let binary = res
            .headers()
            .get(CONTENT_TYPE)
            .is_some_and(|ct| ct == BINARY_CONTENT_TYPE);
        Ok(PollResponse {
            data: res.into_body(),
            binary,
        })
    }

    async fn post(&self, query: &str, payload: Payload) -> Result<(), TransportError> {
        let content_type = HeaderValue::from_static(payload.content_type());
        let mut req = self.request(Method::POST, query, payload.data)?;
        req.headers_mut().insert(CONTENT_TYPE, content_type);
        let res = service::handle_request(&self.engine, req).await;
        check_status(&res)
    }

    async fn open_socket(&self, query: &str) -> Result<MemoryChannel, TransportError> {
        let (parts, _) = self.request(Method::GET, query, Bytes::new())?.into_parts();
        let (client, server) = memory_channel();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(_e) = engine.on_ws_connection(server, parts).await {
                #[cfg(feature = "tracing")]
                tracing::debug!("in-process websocket rejected: {_e}");
            }
        });
        Ok(client)
    }
}
