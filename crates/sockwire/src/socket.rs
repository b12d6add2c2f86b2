//! A [`Socket`] represents a client connected to a namespace.
//! Each socket of a namespace has its own id, V3 sockets reuse the id of their engine.io session.
//!
//! The socket is given to the connect handler and to every message handler
//! as a [`SocketRef`]. It can be kept to emit events later on.
use std::{
    borrow::Cow,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use http::request::Parts;
use serde::{Serialize, de::DeserializeOwned};
use sockwire_core::{
    Packet, PacketData, ProtocolVersion, Sid, Value,
    packet::{ack_args, split_event},
    parser::encode,
    value::to_args,
};
use sockwire_engine::{DisconnectReason as EIoDisconnectReason, Session, TransportType};
use tokio::sync::oneshot::Receiver;

use crate::{
    ack::{AckInnerStream, AckResult, AckStream, PendingAcks},
    errors::{AckError, DisconnectError, Error, SendError, SocketError},
    handler::{AckSender, EventHandlers, Message, PacketSender},
    ns::Namespace,
    operators::BroadcastOperators,
    rooms::{Room, RoomParam},
    router::SessionData,
};

/// A reference to a [`Socket`], given to every handler.
pub type SocketRef = Arc<Socket>;

/// All the possible reasons for a [`Socket`] to be disconnected from a namespace.
///
/// It is given to the [`on_disconnect`](Socket::on_disconnect) handlers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client gracefully closed the connection
    TransportClose,

    /// The client sent multiple polling requests at the same time (it is forbidden by the engine.io protocol)
    MultipleHttpPollingError,

    /// The client sent a bad request / the packet could not be parsed correctly
    PacketParsingError,

    /// The connection was abruptly closed
    TransportError,

    /// The client did not send a PONG packet in the `ping timeout` delay
    HeartbeatTimeout,

    /// The client has manually disconnected the socket using `socket.disconnect()`
    ClientNSDisconnect,

    /// The socket was forcefully disconnected from the namespace with [`Socket::disconnect`]
    /// or with [`SocketIo::delete_ns`](crate::SocketIo::delete_ns)
    ServerNSDisconnect,

    /// The server is being closed
    ClosingServer,

    /// The client closed its engine.io session
    ClosingClient,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DisconnectReason::*;
        let str: &'static str = match self {
            TransportClose => "client gracefully closed the connection",
            MultipleHttpPollingError => "client sent multiple polling requests at the same time",
            PacketParsingError => "client sent a bad request / the packet could not be parsed",
            TransportError => "client request triggered a transport error",
            HeartbeatTimeout => "client did not respond to the heartbeat",
            ClientNSDisconnect => "client has manually disconnected the socket from the namespace",
            ServerNSDisconnect => "socket was forcefully disconnected from the namespace",
            ClosingServer => "server is being closed",
            ClosingClient => "client closed its session",
        };
        f.write_str(str)
    }
}

impl From<EIoDisconnectReason> for DisconnectReason {
    fn from(reason: EIoDisconnectReason) -> Self {
        use DisconnectReason::*;
        match reason {
            EIoDisconnectReason::TransportClose => TransportClose,
            EIoDisconnectReason::TransportError => TransportError,
            EIoDisconnectReason::HeartbeatTimeout => HeartbeatTimeout,
            EIoDisconnectReason::MultipleHttpPollingError => MultipleHttpPollingError,
            EIoDisconnectReason::PacketParsingError => PacketParsingError,
            EIoDisconnectReason::ClosingServer => ClosingServer,
            EIoDisconnectReason::ClosingClient => ClosingClient,
        }
    }
}

/// Encode a packet for the session and queue it.
pub(crate) fn emit_packet(
    session: &Session<SessionData>,
    packet: Packet,
) -> Result<(), SocketError> {
    let (msg, bins) = encode(packet, session.protocol);
    emit_encoded(session, msg, bins)
}

fn emit_encoded(
    session: &Session<SessionData>,
    msg: String,
    bins: Vec<Bytes>,
) -> Result<(), SocketError> {
    let res = if bins.is_empty() {
        session.emit(msg)
    } else {
        session.emit_many(msg, bins)
    };
    res.map_err(|_| SocketError::Closed)
}

/// A socket connected to a namespace.
///
/// It can be used to register event handlers, to emit events and to join or leave rooms.
pub struct Socket {
    /// The socket id
    pub id: Sid,
    ns: Arc<Namespace>,
    session: Arc<Session<SessionData>>,
    handlers: EventHandlers<SocketRef>,
    acks: PendingAcks,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Socket {
    pub(crate) fn new(id: Sid, ns: Arc<Namespace>, session: Arc<Session<SessionData>>) -> Self {
        Self {
            id,
            ns,
            session,
            handlers: EventHandlers::default(),
            acks: PendingAcks::default(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a handler for the given event.
    ///
    /// A previous handler for the same event is replaced.
    ///
    /// # Example
    /// ```
    /// # use sockwire::{SocketIo, socket::SocketRef, handler::Message};
    /// let (_engine, io) = SocketIo::new();
    /// io.ns("/", |socket: SocketRef, _auth| {
    ///     socket.on("test", |socket: SocketRef, msg: Message| {
    ///         if let Some(ack) = msg.ack {
    ///             ack.send("received").ok();
    ///         }
    ///     });
    /// });
    /// ```
    pub fn on<F>(&self, event: impl Into<Cow<'static, str>>, handler: F)
    where
        F: Fn(SocketRef, Message) + Send + Sync + 'static,
    {
        self.handlers.on(event.into(), Arc::new(handler), false);
    }

    /// Register a handler called for the next occurrence of the event only.
    pub fn once<F>(&self, event: impl Into<Cow<'static, str>>, handler: F)
    where
        F: Fn(SocketRef, Message) + Send + Sync + 'static,
    {
        self.handlers.on(event.into(), Arc::new(handler), true);
    }

    /// Register a catch-all handler. It is called for every event, before the handler of the event.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(SocketRef, &Message) + Send + Sync + 'static,
    {
        self.handlers.on_any(Arc::new(handler));
    }

    /// Remove the handler of the event. Returns true if there was one.
    pub fn off(&self, event: &str) -> bool {
        self.handlers.off(event)
    }

    /// Register a disconnect handler.
    ///
    /// It is called once, when the socket leaves the namespace for any [`DisconnectReason`].
    /// The socket rooms are already left when it is called.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: FnOnce(SocketRef, DisconnectReason) + Send + 'static,
    {
        self.handlers.on_disconnect(Box::new(handler));
    }

    /// Emit an event to the client.
    ///
    /// A tuple is sent as several arguments, `()` as no argument. Any binary data is sent
    /// as an attachment.
    ///
    /// # Errors
    /// * [`SendError::Serialize`] if the data cannot be serialized.
    /// * [`SendError::Socket`] if the socket is disconnected.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<(), SendError> {
        if !self.connected() {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?self.id, "emitting on a disconnected socket");
            return Err(SocketError::Closed.into());
        }
        let args = to_args(data)?;
        self.send(Packet::event(self.ns.path(), event.as_ref(), args))?;
        Ok(())
    }

    /// Emit an event to the client and wait for its acknowledgement.
    ///
    /// The returned [`AckStream`] resolves with the deserialized ack arguments,
    /// or with [`AckError::Timeout`] once the ack timeout of the server elapsed.
    pub fn emit_with_ack<T: ?Sized + Serialize, V: DeserializeOwned>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<AckStream<V>, SendError> {
        if !self.connected() || self.session.is_closed() {
            return Err(SocketError::Closed.into());
        }
        let args = to_args(data)?;
        let packet = Packet::event(self.ns.path(), event.as_ref(), args);
        let rx = self.send_with_ack(packet);
        let inner = AckInnerStream::send(rx, self.ns.ack_timeout(), self.id);
        Ok(AckStream::new(inner))
    }

    /// Join the given rooms.
    pub fn join(&self, rooms: impl RoomParam) {
        self.ns.rooms.add_all(self.id, rooms);
    }

    /// Leave the given rooms.
    pub fn leave(&self, rooms: impl RoomParam) {
        self.ns.rooms.del(self.id, rooms);
    }

    /// Leave all the rooms, including its own room.
    pub fn leave_all(&self) {
        self.ns.rooms.del_all(self.id);
    }

    /// Get the rooms the socket is in.
    pub fn rooms(&self) -> Vec<Room> {
        self.ns.rooms.socket_rooms(self.id)
    }

    /// Select all the sockets in the given rooms except the current socket.
    ///
    /// # Example
    /// ```
    /// # use sockwire::{SocketIo, socket::SocketRef, handler::Message};
    /// let (_engine, io) = SocketIo::new();
    /// io.ns("/", |socket: SocketRef, _auth| {
    ///     socket.on("test", |socket: SocketRef, msg: Message| {
    ///         let other_rooms = "room4".to_string();
    ///         // In room1, room2, room3 and room4 except the current
    ///         socket
    ///             .to("room1")
    ///             .to(["room2", "room3"])
    ///             .to(vec![other_rooms])
    ///             .emit("test", "hello")
    ///             .ok();
    ///     });
    /// });
    /// ```
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators {
        BroadcastOperators::from_sock(self.ns.clone(), self.id).to(rooms)
    }

    /// Select all the sockets in the given rooms, the current socket included if it is a member.
    pub fn within(&self, rooms: impl RoomParam) -> BroadcastOperators {
        BroadcastOperators::from_sock(self.ns.clone(), self.id).within(rooms)
    }

    /// Select all the sockets of the namespace except the ones in the given rooms and the current socket.
    pub fn except(&self, rooms: impl RoomParam) -> BroadcastOperators {
        BroadcastOperators::from_sock(self.ns.clone(), self.id).except(rooms)
    }

    /// Select all the sockets of the namespace except the current socket.
    pub fn broadcast(&self) -> BroadcastOperators {
        BroadcastOperators::from_sock(self.ns.clone(), self.id).broadcast()
    }

    /// Disconnect the socket from the namespace.
    ///
    /// The client is notified with a disconnect packet and the disconnect handlers are
    /// called with [`DisconnectReason::ServerNSDisconnect`]. The engine.io session stays open.
    pub fn disconnect(self: Arc<Self>) -> Result<(), DisconnectError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DisconnectError::AlreadyDisconnected);
        }
        self.send(Packet::disconnect(self.ns.path())).ok();
        self.close(DisconnectReason::ServerNSDisconnect);
        Ok(())
    }

    /// Whether the socket is connected to its namespace.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The protocol version of the client.
    pub fn protocol(&self) -> ProtocolVersion {
        self.session.protocol
    }

    /// The transport currently used by the engine.io session.
    pub fn transport_type(&self) -> TransportType {
        self.session.transport_type()
    }

    /// The http request that opened the engine.io session.
    pub fn req_parts(&self) -> &Parts {
        &self.session.req_parts
    }

    /// The path of the namespace.
    pub fn ns(&self) -> &str {
        self.ns.path()
    }

    /// The id of the underlying engine.io session.
    pub fn session_id(&self) -> Sid {
        self.session.id
    }

    /// The id a client of this protocol knows the socket by.
    ///
    /// V3 clients prefix the session id with the namespace path outside of the main namespace.
    pub fn client_id(&self) -> String {
        match (self.protocol(), self.ns()) {
            (ProtocolVersion::V3, ns) if ns != "/" => format!("{}#{}", ns, self.id),
            _ => self.id.to_string(),
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn send(&self, packet: Packet) -> Result<(), SocketError> {
        emit_packet(&self.session, packet)
    }

    /// Send an already encoded packet.
    pub(crate) fn send_raw(&self, msg: String, bins: Vec<Bytes>) -> Result<(), SocketError> {
        emit_encoded(&self.session, msg, bins)
    }

    /// Register an ack id for the packet and send it.
    /// A failed send fails the ack instead of returning an error.
    pub(crate) fn send_with_ack(&self, mut packet: Packet) -> Receiver<AckResult<Vec<Value>>> {
        let (ack, rx) = self.acks.register(&mut packet);
        if let Err(e) = self.send(packet) {
            self.acks.fail(ack, AckError::Socket(e));
        }
        rx
    }

    /// Remove the socket from the namespace. Only the first call has an effect.
    pub(crate) fn close(self: Arc<Self>, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?self.id, ns = self.ns.path(), ?reason, "socket disconnected");

        self.ns.rooms.del_all(self.id);
        self.set_connected(false);
        self.acks.clear();
        self.handlers.disconnect(self.clone(), reason);
        self.ns.remove_socket(self.id);
        self.session.data.remove_socket(self.ns.path());
    }

    /// Handle a packet received for this socket.
    pub(crate) fn recv(self: Arc<Self>, packet: PacketData) -> Result<(), Error> {
        match packet {
            PacketData::Event(data, ack) | PacketData::BinaryEvent(data, ack) => {
                self.recv_event(data, ack)
            }
            PacketData::EventAck(data, ack) | PacketData::BinaryAck(data, ack) => {
                self.acks.resolve(ack, ack_args(data));
                Ok(())
            }
            PacketData::Disconnect => {
                self.close(DisconnectReason::ClientNSDisconnect);
                Ok(())
            }
            PacketData::Connect(_) | PacketData::ConnectError(_) => Err(Error::InvalidPacketType),
        }
    }

    fn recv_event(self: Arc<Self>, data: Value, ack: Option<i64>) -> Result<(), Error> {
        let (event, args) = split_event(data).ok_or(Error::InvalidEventName)?;
        let ack = ack.map(|id| AckSender::new(self.clone(), id));
        let msg = Message { event, args, ack };
        self.handlers.dispatch(self.clone(), msg);
        Ok(())
    }
}

impl PacketSender for Socket {
    fn send_packet(&self, packet: Packet) -> Result<(), SocketError> {
        if !self.connected() {
            return Err(SocketError::Closed);
        }
        self.send(packet)
    }

    fn path(&self) -> &str {
        self.ns.path()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("ns", &self.ns())
            .field("id", &self.id)
            .field("session", &self.session.id)
            .field("connected", &self.connected())
            .finish()
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ns() == other.ns()
    }
}
