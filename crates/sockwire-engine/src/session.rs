//! ## A [`Session`] is one logical Engine.IO connection
//!
//! It outlives the transports it is carried on: a session opened on long-polling keeps its id,
//! its queue and its data when it is upgraded to websocket.
//!
//! It can be used to:
//! * Emit text or binary messages to the peer
//! * Get the request parts of the handshake request
//! * Close the connection
//!
//! #### Example :
//! ```rust
//! # use bytes::Bytes;
//! # use sockwire_engine::{handler::EngineIoHandler, DisconnectReason, Session};
//! # use std::sync::{Arc, Mutex};
//! # use std::sync::atomic::{AtomicUsize, Ordering};
//! #[derive(Debug, Default)]
//! struct MyHandler {
//!     user_cnt: AtomicUsize,
//! }
//!
//! #[derive(Debug, Default)]
//! struct SessionState {
//!     name: Mutex<String>,
//! }
//!
//! impl EngineIoHandler for MyHandler {
//!     type Data = SessionState;
//!
//!     fn on_connect(self: Arc<Self>, session: Arc<Session<SessionState>>) {
//!         let authorized = session.req_parts.headers.get("Authorization")
//!             .is_some_and(|a| a == "mysuperpassword!");
//!         if !authorized {
//!             session.close(DisconnectReason::ClosingServer);
//!             return;
//!         }
//!         let cnt = self.user_cnt.fetch_add(1, Ordering::Relaxed) + 1;
//!         session.emit(cnt.to_string()).ok();
//!     }
//!     fn on_disconnect(&self, session: Arc<Session<SessionState>>, reason: DisconnectReason) {
//!         self.user_cnt.fetch_sub(1, Ordering::Relaxed);
//!     }
//!     fn on_message(self: &Arc<Self>, msg: String, session: Arc<Session<SessionState>>) {
//!         *session.data.name.lock().unwrap() = msg;
//!     }
//!     fn on_binary(self: &Arc<Self>, data: Bytes, session: Arc<Session<SessionState>>) { }
//! }
//! ```
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http::request::Parts;
use smallvec::{SmallVec, smallvec};
use sockwire_engine_core::{Packet, PacketBuf, ProtocolVersion, Sid, TransportType};
use tokio::sync::{Mutex, mpsc};

use crate::{
    config::EngineIoConfig,
    errors::SendError,
    heartbeat::{Heartbeat, HeartbeatMode, HeartbeatPeer},
    peekable::PeekableReceiver,
    transport::{CloseSignal, MessageSink},
};

/// The reason why a [`Session`] was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer gracefully closed the connection
    TransportClose,
    /// The client sent multiple polling requests at the same time (it is forbidden by the protocol)
    MultipleHttpPollingError,
    /// The peer sent a packet that could not be parsed or was not expected
    PacketParsingError,
    /// An error occurred in the transport layer
    /// (e.g. the connection was dropped without a close packet)
    TransportError,
    /// The peer did not answer the heartbeat
    HeartbeatTimeout,
    /// The server is being closed, or closed the session
    ClosingServer,
    /// The client closed the session
    ClosingClient,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DisconnectReason::*;
        let str: &'static str = match self {
            TransportClose => "client gracefully closed the connection",
            MultipleHttpPollingError => "client sent multiple polling requests at the same time",
            PacketParsingError => "client sent a bad request / the packet could not be parsed",
            TransportError => "An error occurred in the transport layer",
            HeartbeatTimeout => "client did not respond to the heartbeat",
            ClosingServer => "server is being closed",
            ClosingClient => "client is being closed",
        };
        f.write_str(str)
    }
}

/// A [`Session`] represents a connection between the server and a client.
/// It is agnostic to the [`TransportType`].
///
/// It handles:
/// * the outbound queue shared by the polling and websocket transports
/// * the user defined [`Data`](crate::handler::EngineIoHandler::Data) bound to the session
/// * the heartbeat monitor
pub struct Session<D>
where
    D: Default + Send + Sync + 'static,
{
    /// The session id
    pub id: Sid,

    /// The protocol version used by the session
    pub protocol: ProtocolVersion,

    /// The transport type represented as a bitfield so it can be shared between threads
    transport: AtomicU8,

    /// Whether the session is currently upgrading to websocket
    upgrading: AtomicBool,

    closed: CloseSignal,

    /// Outbound queue.
    ///
    /// It is locked by the transport that drains it:
    /// * with polling it is locked and released for each request
    /// * with websocket it is locked until the connection is closed
    ///
    /// Groups of packets are queued together so adjacent packets are sent atomically.
    pub(crate) internal_rx: Mutex<PeekableReceiver<PacketBuf>>,
    internal_tx: mpsc::UnboundedSender<PacketBuf>,

    pub(crate) heartbeat: Heartbeat,

    /// Function to call when the session is closed
    close_fn: Box<dyn Fn(Sid, DisconnectReason) + Send + Sync>,

    /// User data bound to the session
    pub data: D,

    /// Http request data used to create the session
    pub req_parts: Parts,

    /// If the client supports binary payloads (V3 long-polling without `b64`)
    pub(crate) supports_binary: bool,
}

impl<D> Session<D>
where
    D: Default + Send + Sync + 'static,
{
    pub(crate) fn new(
        protocol: ProtocolVersion,
        transport: TransportType,
        config: &EngineIoConfig,
        req_parts: Parts,
        close_fn: Box<dyn Fn(Sid, DisconnectReason) + Send + Sync>,
        supports_binary: bool,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let mode = match protocol {
            ProtocolVersion::V3 => HeartbeatMode::Responder,
            ProtocolVersion::V4 => HeartbeatMode::Initiator,
        };

        Self {
            id: Sid::new(),
            protocol,
            transport: AtomicU8::new(transport as u8),
            upgrading: AtomicBool::new(false),
            closed: CloseSignal::new(),

            internal_rx: Mutex::new(PeekableReceiver::new(internal_rx)),
            internal_tx,

            heartbeat: Heartbeat::new(mode, config.ping_interval, config.ping_timeout),
            close_fn,

            data: D::default(),
            req_parts,
            supports_binary,
        }
    }

    /// Queue a packet without checking the closed flag.
    pub(crate) fn send(&self, packet: Packet) -> Result<(), SendError> {
        #[cfg(feature = "tracing")]
        tracing::trace!("[sid={}] sending packet: {:?}", self.id, packet);
        self.internal_tx
            .send(smallvec![packet])
            .map_err(|e| SendError(e.0))
    }

    /// Emit a text message to the client.
    ///
    /// With websocket it is sent as a text frame, with polling it is queued until the next
    /// polling request.
    pub fn emit(&self, msg: impl Into<String>) -> Result<(), SendError> {
        self.send_packets(smallvec![Packet::Message(msg.into())])
    }

    /// Emit a binary message to the client.
    ///
    /// With websocket it is sent as a binary frame, with polling it is written as base64
    /// unless the V3 client supports binary payloads.
    pub fn emit_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_packets(smallvec![Packet::Binary(data.into())])
    }

    /// Emit a text message followed by binary messages, without any other packet in between.
    pub fn emit_many(&self, msg: impl Into<String>, data: Vec<Bytes>) -> Result<(), SendError> {
        let mut packets = SmallVec::with_capacity(data.len() + 1);
        packets.push(Packet::Message(msg.into()));
        packets.extend(data.into_iter().map(Packet::Binary));
        self.send_packets(packets)
    }

    /// Immediately close the session.
    ///
    /// A close packet is sent to the client, the session is removed from the engine and the
    /// [`Handler`](crate::handler::EngineIoHandler) is notified. Only the first call has an effect.
    pub fn close(&self, reason: DisconnectReason) {
        let closed = self.closed.close_with(|| {
            self.send(Packet::Close).ok();
        });
        if closed {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?self.id, ?reason, "closing session");
            self.heartbeat.stop();
            (self.close_fn)(self.id, reason);
        }
    }

    /// Returns true if the session is closed.
    /// It means that no more packets can be sent to the client.
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Wait for the session to be closed
    pub async fn closed(&self) {
        self.closed.closed().await
    }

    /// Returns the current [`TransportType`] of the session
    pub fn transport_type(&self) -> TransportType {
        TransportType::from(self.transport.load(Ordering::Acquire))
    }

    /// Whether the session is being upgraded to websocket
    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::Acquire)
    }

    /// Round trip time of the last heartbeat, only measured with V4.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.heartbeat.last_rtt()
    }

    pub(crate) fn closed_signal(&self) -> &CloseSignal {
        &self.closed
    }

    pub(crate) fn set_upgrading(&self, upgrading: bool) {
        self.upgrading.store(upgrading, Ordering::Release);
    }

    /// Switch to websocket once an upgrade is complete.
    pub(crate) fn upgrade_to_websocket(&self) {
        self.transport
            .store(TransportType::Websocket as u8, Ordering::Release);
        self.upgrading.store(false, Ordering::Release);
    }

    pub(crate) fn start_heartbeat(self: &Arc<Self>) {
        self.heartbeat.start(Arc::downgrade(self));
    }

    /// Whether this session asked for base64 binary packets over long-polling.
    pub(crate) fn b64(&self) -> bool {
        self.protocol == ProtocolVersion::V3 && !self.supports_binary
    }
}

impl<D: Default + Send + Sync + 'static> MessageSink for Session<D> {
    fn send_packets(&self, packets: PacketBuf) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError(packets));
        }
        self.internal_tx.send(packets).map_err(|e| SendError(e.0))
    }
}

impl<D: Default + Send + Sync + 'static> HeartbeatPeer for Session<D> {
    fn is_upgrading(&self) -> bool {
        Session::is_upgrading(self)
    }

    fn on_heartbeat_timeout(&self) {
        self.close(DisconnectReason::HeartbeatTimeout);
    }
}

impl<D: Default + Send + Sync + 'static> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.id)
            .field("protocol", &self.protocol)
            .field("transport", &self.transport_type())
            .field("upgrading", &self.is_upgrading())
            .field("closed", &self.is_closed())
            .field("heartbeat", &self.heartbeat)
            .field("req_parts", &self.req_parts)
            .finish()
    }
}

#[cfg(test)]
impl<D: Default + Send + Sync + 'static> Session<D> {
    /// A detached session for unit tests
    pub(crate) fn new_dummy(protocol: ProtocolVersion) -> Arc<Self> {
        Arc::new(Self::new(
            protocol,
            TransportType::Polling,
            &EngineIoConfig::default(),
            http::Request::<()>::default().into_parts().0,
            Box::new(|_, _| {}),
            true,
        ))
    }
}
