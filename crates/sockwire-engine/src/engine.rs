use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use sockwire_engine_core::{Packet, ProtocolVersion, Sid, TransportType, payload::Payload};

use crate::{
    config::EngineIoConfig,
    errors::Error,
    handler::EngineIoHandler,
    registry::SessionRegistry,
    service::RequestInfo,
    session::{DisconnectReason, Session},
    transport::{RawChannel, polling, ws},
};

/// The [`EngineIo`] struct holds the state of the engine.io server
/// as well as the entry points of the transports.
pub struct EngineIo<H: EngineIoHandler> {
    /// All the sessions opened on the server
    sessions: SessionRegistry<Session<H::Data>>,

    /// The handler called when events are received
    pub handler: Arc<H>,

    /// The config of the engine.io server
    pub config: EngineIoConfig,
}

impl<H: EngineIoHandler> std::fmt::Debug for EngineIo<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineIo")
            .field("sessions", &self.sessions)
            .field("handler", &self.handler)
            .field("config", &self.config)
            .finish()
    }
}

impl<H: EngineIoHandler> EngineIo<H> {
    /// Create a new Engine.IO server with a [`EngineIoHandler`] and a [`EngineIoConfig`]
    pub fn new(handler: Arc<H>, config: EngineIoConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            config,
            handler,
        }
    }

    /// Create a new session, register it and notify the handler.
    pub(crate) fn create_session(
        self: &Arc<Self>,
        protocol: ProtocolVersion,
        transport: TransportType,
        req: Parts,
        supports_binary: bool,
    ) -> Arc<Session<H::Data>> {
        let engine = Arc::downgrade(self);
        let close_fn = Box::new(move |sid, reason| {
            if let Some(engine) = engine.upgrade() {
                engine.close_session(sid, reason);
            }
        });

        let session = Arc::new(Session::new(
            protocol,
            transport,
            &self.config,
            req,
            close_fn,
            supports_binary,
        ));
        self.sessions.insert(session.id, session.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?session.id, ?protocol, ?transport, "new session");

        self.handler.clone().on_connect(session.clone());
        session
    }

    /// Get a session by its sid
    pub fn get_session(&self, sid: Sid) -> Option<Arc<Session<H::Data>>> {
        self.sessions.get(&sid)
    }

    /// A snapshot of all the open sessions
    pub fn sessions(&self) -> Vec<Arc<Session<H::Data>>> {
        self.sessions.all()
    }

    /// Remove a closed session from the registry and notify the handler.
    ///
    /// It is only called by [`Session::close`] so it runs once per session.
    fn close_session(&self, sid: Sid, reason: DisconnectReason) {
        let Some(session) = self.sessions.remove(&sid) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(?sid, "session not found");
            return;
        };

        // With polling the queue is not always locked, it is closed here so nothing
        // can be queued anymore. The close packet already queued can still be read.
        session.internal_rx.try_lock().map(|mut rx| rx.close()).ok();
        self.handler.on_disconnect(session, reason);

        #[cfg(feature = "tracing")]
        tracing::debug!(remaining = self.sessions.len(), "session closed");
    }

    /// Close every session with [`DisconnectReason::ClosingServer`].
    pub fn close(&self) {
        for session in self.sessions.all() {
            session.close(DisconnectReason::ClosingServer);
        }
    }

    /// Handle a packet received from a client, whatever the transport.
    pub(crate) fn handle_packet(
        &self,
        packet: Packet,
        session: &Arc<Session<H::Data>>,
    ) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::trace!(sid = ?session.id, ?packet, "received packet");

        match (packet, session.protocol) {
            (Packet::Close, _) => {
                session.close(DisconnectReason::TransportClose);
                Ok(())
            }
            (Packet::Pong, ProtocolVersion::V4) | (Packet::Ping, ProtocolVersion::V3) => {
                session.heartbeat.notify();
                Ok(())
            }
            (Packet::Message(msg), _) => {
                self.handler.on_message(msg, session.clone());
                Ok(())
            }
            (Packet::Binary(data), _) => {
                self.handler.on_binary(data, session.clone());
                Ok(())
            }
            (Packet::Noop, _) => Ok(()),
            (packet, _) => Err(Error::BadPacket(packet)),
        }
    }

    /// Open a new long-polling session and return the handshake payload.
    ///
    /// `supports_binary` is false when a V3 client asked for base64 binary packets.
    pub fn polling_open(
        self: &Arc<Self>,
        protocol: ProtocolVersion,
        req: Parts,
        supports_binary: bool,
    ) -> Result<Payload, Error> {
        polling::open_req(self, protocol, req, supports_binary)
    }

    /// Long-polling read: wait for packets of the session and encode them in a payload.
    pub async fn polling_read(self: &Arc<Self>, sid: Sid) -> Result<Payload, Error> {
        let session = self.get_session(sid).ok_or(Error::UnknownSessionID(sid))?;
        polling::polling_req(self, &session).await
    }

    /// Long-polling write: decode a payload posted by the client and handle its packets.
    ///
    /// `binary` is set when the body was sent with a binary content type (V3 only).
    pub fn polling_write(self: &Arc<Self>, sid: Sid, body: Bytes, binary: bool) -> Result<(), Error> {
        let session = self.get_session(sid).ok_or(Error::UnknownSessionID(sid))?;
        polling::post_req(self, &session, body, binary)
    }

    /// Serve a websocket connection accepted by the host.
    ///
    /// `req` is the http upgrade request, its query is parsed the same way as long-polling
    /// requests. With a `sid`, the existing session is upgraded, otherwise a new session is opened.
    /// It returns when the connection is closed.
    pub async fn on_ws_connection<C: RawChannel>(
        self: Arc<Self>,
        channel: C,
        req: Parts,
    ) -> Result<(), Error> {
        let info = RequestInfo::parse(&req, &self.config)?;
        if info.transport != TransportType::Websocket {
            return Err(Error::TransportMismatch);
        }
        ws::on_init(self, channel, info.protocol, info.sid, req).await
    }
}
