//! A [`Namespace`] groups sockets under a path, with its own handlers, middlewares and rooms.
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use sockwire_core::{Packet, PacketData, ProtocolVersion, Sid, Value};
use sockwire_engine::Session;

use crate::{
    errors::Error,
    handler::{BoxedConnectHandler, BoxedMiddleware, isolate},
    operators::BroadcastOperators,
    rooms::{Room, RoomTable},
    router::SessionData,
    socket::{DisconnectReason, Socket, SocketRef, emit_packet},
};

/// A namespace of the server.
pub struct Namespace {
    path: Cow<'static, str>,
    ack_timeout: Duration,
    handlers: RwLock<Vec<BoxedConnectHandler<SocketRef>>>,
    middlewares: RwLock<Vec<BoxedMiddleware<SocketRef>>>,
    sockets: RwLock<HashMap<Sid, SocketRef>>,
    pub(crate) rooms: RoomTable,
}

impl Namespace {
    pub(crate) fn new(path: Cow<'static, str>, ack_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            path,
            ack_timeout,
            handlers: RwLock::new(Vec::new()),
            middlewares: RwLock::new(Vec::new()),
            sockets: RwLock::new(HashMap::new()),
            rooms: RoomTable::default(),
        })
    }

    /// The path of the namespace
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Add a connect handler, called for every socket connecting to the namespace
    /// after the middlewares accepted it.
    pub fn on_connect<F>(&self, handler: F) -> &Self
    where
        F: Fn(SocketRef, Option<Value>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
        self
    }

    /// Add a connect middleware. Middlewares are called in order with the socket and the
    /// auth payload, before the connect handlers.
    ///
    /// The first error rejects the connection: the client receives a connect error packet
    /// with the error message and the socket is never added to the namespace.
    ///
    /// # Example
    /// ```
    /// # use sockwire::{SocketIo, socket::SocketRef};
    /// let (_engine, io) = SocketIo::new();
    /// io.ns("/", |_socket: SocketRef, _auth| {})
    ///     .use_middleware(|_socket: &SocketRef, auth: Option<&sockwire::Value>| {
    ///         match auth.and_then(|auth| auth.get("token")) {
    ///             Some(_) => Ok(()),
    ///             None => Err("missing token"),
    ///         }
    ///     });
    /// ```
    pub fn use_middleware<F, E>(&self, middleware: F) -> &Self
    where
        F: Fn(&SocketRef, Option<&Value>) -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let middleware: BoxedMiddleware<SocketRef> =
            Arc::new(move |socket, auth| middleware(socket, auth).map_err(|e| e.to_string()));
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
        self
    }

    /// Connect a session to the namespace.
    ///
    /// * The middlewares are run, a rejection sends a connect error packet.
    /// * The socket is registered and joins its own room.
    /// * The connect packet is sent and the connect handlers are called.
    pub(crate) fn connect(
        self: &Arc<Self>,
        session: &Arc<Session<SessionData>>,
        auth: Option<Value>,
    ) -> Option<SocketRef> {
        let id = match session.protocol {
            ProtocolVersion::V3 => session.id,
            ProtocolVersion::V4 => Sid::new(),
        };
        let socket: SocketRef = Arc::new(Socket::new(id, self.clone(), session.clone()));

        if let Err(reason) = self.run_middlewares(&socket, auth.as_ref()) {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?id, ns = self.path(), "connection rejected: {reason}");
            socket
                .send(Packet::connect_error(self.path(), reason))
                .ok();
            return None;
        }

        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, socket.clone());
        self.rooms.add_all(id, id);
        session.data.insert_socket(self.path(), id);

        let payload = match session.protocol {
            ProtocolVersion::V3 => None,
            ProtocolVersion::V4 => Some(Value::Object(vec![(
                "sid".to_string(),
                Value::String(id.to_string()),
            )])),
        };
        if socket.send(Packet::connect(self.path(), payload)).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?id, "session closed before the connect packet was sent");
            socket.close(DisconnectReason::TransportClose);
            return None;
        }
        socket.set_connected(true);

        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?id, ns = self.path(), "socket connected");

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            let socket = socket.clone();
            let auth = auth.clone();
            isolate("connect", move || handler(socket, auth));
        }
        Some(socket)
    }

    fn run_middlewares(&self, socket: &SocketRef, auth: Option<&Value>) -> Result<(), String> {
        let middlewares = self
            .middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for middleware in middlewares {
            let mut res = Ok(());
            if let Some(panic) = isolate("middleware", || res = middleware(socket, auth)) {
                res = Err(format!("middleware panicked: {panic}"));
            }
            res?;
        }
        Ok(())
    }

    /// Route a packet to the socket it belongs to.
    pub(crate) fn recv(&self, sid: Sid, packet: PacketData) -> Result<(), Error> {
        match self.get_socket(sid) {
            Some(socket) => socket.recv(packet),
            None => Err(Error::SocketGone(sid)),
        }
    }

    pub(crate) fn remove_socket(&self, sid: Sid) {
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sid);
    }

    /// Get a connected socket by its id.
    pub fn get_socket(&self, sid: Sid) -> Option<SocketRef> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sid)
            .cloned()
    }

    /// All the sockets of the namespace.
    pub fn sockets(&self) -> Vec<SocketRef> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn socket_ids(&self) -> Vec<Sid> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// All the rooms with at least one socket.
    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.rooms()
    }

    /// Broadcast operators selecting every socket of the namespace.
    pub fn operators(self: &Arc<Self>) -> BroadcastOperators {
        BroadcastOperators::new(self.clone())
    }

    /// Disconnect every socket with a disconnect packet. The engine.io sessions stay open.
    pub(crate) fn disconnect_all(&self) {
        for socket in self.sockets() {
            socket.disconnect().ok();
        }
    }

    /// Remove every handler and disconnect every socket.
    pub(crate) fn close(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(ns = self.path(), "closing namespace");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.disconnect_all();
        self.rooms.clear();
    }
}

/// Send a connect error for a namespace without any socket.
pub(crate) fn reject(session: &Session<SessionData>, path: &str, reason: &str) {
    #[cfg(feature = "tracing")]
    tracing::debug!(sid = ?session.id, ns = path, "connection rejected: {reason}");
    emit_packet(session, Packet::connect_error(path, reason)).ok();
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("sockets", &self.socket_ids())
            .finish()
    }
}
