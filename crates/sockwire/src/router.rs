//! The engine.io handler of the server: it decodes socket.io packets and routes them
//! to the namespaces.
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak},
};

use bytes::Bytes;
use sockwire_core::{
    Packet, PacketData, ParseError, ProtocolVersion, Sid, Value, parser::Decoder,
};
use sockwire_engine::{
    DisconnectReason as EIoDisconnectReason, EngineIo, Session, handler::EngineIoHandler,
};
use tokio::sync::oneshot;

use crate::{
    errors::Error,
    io::SocketIoConfig,
    ns::{self, Namespace},
};

/// The socket.io state bound to each engine.io session.
#[derive(Debug, Default)]
pub struct SessionData {
    decoder: Mutex<Decoder>,
    /// Fired on the first connect packet, it stops the connect timeout.
    connect_recv_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// The socket of each connected namespace.
    sockets: Mutex<HashMap<String, Sid>>,
}

impl SessionData {
    /// The paths of the namespaces the session is connected to.
    pub fn namespaces(&self) -> Vec<String> {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn socket_id(&self, ns: &str) -> Option<Sid> {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ns)
            .copied()
    }

    pub(crate) fn insert_socket(&self, ns: &str, sid: Sid) {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ns.to_string(), sid);
    }

    pub(crate) fn remove_socket(&self, ns: &str) {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ns);
    }

    fn sockets(&self) -> Vec<(String, Sid)> {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(ns, sid)| (ns.clone(), *sid))
            .collect()
    }

    fn connect_received(&self) {
        let tx = self
            .connect_recv_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            tx.send(()).ok();
        }
    }
}

/// Routes the packets of every engine.io session to the namespaces.
pub struct Router {
    pub(crate) config: SocketIoConfig,
    nsps: RwLock<HashMap<Cow<'static, str>, Arc<Namespace>>>,
    engine: OnceLock<Weak<EngineIo<Router>>>,
}

impl Router {
    /// Create a router with the main namespace `/`.
    pub(crate) fn new(config: SocketIoConfig) -> Self {
        let root = Namespace::new(Cow::Borrowed("/"), config.ack_timeout);
        Self {
            config,
            nsps: RwLock::new(HashMap::from([(Cow::Borrowed("/"), root)])),
            engine: OnceLock::new(),
        }
    }

    pub(crate) fn set_engine(&self, engine: &Arc<EngineIo<Router>>) {
        self.engine.set(Arc::downgrade(engine)).ok();
    }

    pub(crate) fn engine(&self) -> Option<Arc<EngineIo<Router>>> {
        self.engine.get().and_then(Weak::upgrade)
    }

    pub(crate) fn get_ns(&self, path: &str) -> Option<Arc<Namespace>> {
        self.nsps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// The main namespace always exists.
    pub(crate) fn root(&self) -> Arc<Namespace> {
        self.get_or_create_ns(Cow::Borrowed("/"))
    }

    pub(crate) fn get_or_create_ns(&self, path: Cow<'static, str>) -> Arc<Namespace> {
        if let Some(ns) = self.get_ns(&path) {
            return ns;
        }
        let mut nsps = self.nsps.write().unwrap_or_else(PoisonError::into_inner);
        nsps.entry(path)
            .or_insert_with_key(|path| {
                #[cfg(feature = "tracing")]
                tracing::debug!(ns = ?path, "adding namespace");
                Namespace::new(path.clone(), self.config.ack_timeout)
            })
            .clone()
    }

    /// Remove a namespace and disconnect its sockets.
    /// The main namespace is kept, only its sockets and handlers are removed.
    pub(crate) fn delete_ns(&self, path: &str) {
        let ns = if path == "/" {
            self.get_ns(path)
        } else {
            self.nsps
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(path)
        };
        if let Some(ns) = ns {
            ns.close();
        }
    }

    pub(crate) fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.nsps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn sock_connect(&self, auth: Option<Value>, path: &str, session: &Arc<Session<SessionData>>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?session.id, ns = path, "connecting to namespace");

        session.data.connect_received();
        if session.data.socket_id(path).is_some() {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?session.id, ns = path, "already connected to namespace");
            return;
        }

        let ns = match self.get_ns(path) {
            Some(ns) => ns,
            None if self.config.lazy_namespaces => {
                self.get_or_create_ns(Cow::Owned(path.to_string()))
            }
            None => {
                ns::reject(session, path, "Invalid namespace");
                return;
            }
        };
        ns.connect(session, auth);
    }

    /// Propagate a packet to the socket of its namespace.
    fn sock_propagate_packet(
        &self,
        packet: Packet,
        session: &Session<SessionData>,
    ) -> Result<(), Error> {
        let sid = session
            .data
            .socket_id(&packet.ns)
            .ok_or(Error::InvalidNamespace)?;
        let ns = self.get_ns(&packet.ns).ok_or(Error::InvalidNamespace)?;
        ns.recv(sid, packet.inner)
    }

    fn handle_packet(&self, packet: Packet, session: &Arc<Session<SessionData>>) {
        #[cfg(feature = "tracing")]
        tracing::trace!(sid = ?session.id, ?packet, "received packet");
        let res = match packet.inner {
            PacketData::Connect(auth) => {
                self.sock_connect(auth, &packet.ns, session);
                Ok(())
            }
            inner => self.sock_propagate_packet(Packet { inner, ns: packet.ns }, session),
        };
        if let Err(ref err) = res {
            handle_error(err, session);
        }
    }

    /// Close the session if it does not connect to a namespace in time.
    fn spawn_connect_timeout_task(&self, session: Arc<Session<SessionData>>) {
        let (tx, rx) = oneshot::channel();
        session
            .data
            .connect_recv_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tx);
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                res = tokio::time::timeout(timeout, rx) => {
                    if res.is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(sid = ?session.id, "connect timeout, closing session");
                        session.close(EIoDisconnectReason::TransportClose);
                    }
                }
                _ = session.closed() => {}
            }
        });
    }
}

impl EngineIoHandler for Router {
    type Data = SessionData;

    fn on_connect(self: Arc<Self>, session: Arc<Session<SessionData>>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?session.id, protocol = ?session.protocol, "new engine.io session");
        match session.protocol {
            // V3 clients are connected to the main namespace without a connect packet
            ProtocolVersion::V3 => self.sock_connect(None, "/", &session),
            ProtocolVersion::V4 => self.spawn_connect_timeout_task(session),
        }
    }

    fn on_disconnect(&self, session: Arc<Session<SessionData>>, reason: EIoDisconnectReason) {
        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?session.id, ?reason, "engine.io session closed");
        for (path, sid) in session.data.sockets() {
            match self.get_ns(&path).and_then(|ns| ns.get_socket(sid)) {
                Some(socket) => socket.close(reason.into()),
                None => session.data.remove_socket(&path),
            }
        }
    }

    fn on_message(self: &Arc<Self>, msg: String, session: Arc<Session<SessionData>>) {
        let res = session
            .data
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode_str(&msg);
        self.on_decoded(res, &session);
    }

    fn on_binary(self: &Arc<Self>, data: Bytes, session: Arc<Session<SessionData>>) {
        let res = session
            .data
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode_bin(data);
        self.on_decoded(res, &session);
    }
}

impl Router {
    fn on_decoded(&self, res: Result<Packet, ParseError>, session: &Arc<Session<SessionData>>) {
        match res {
            Ok(packet) => self.handle_packet(packet, session),
            Err(ParseError::NeedsMoreBinaryData) => {}
            Err(err) => handle_error(&Error::Parse(err), session),
        }
    }
}

/// Close the session if the error cannot be recovered from.
fn handle_error(err: &Error, session: &Session<SessionData>) {
    #[cfg(feature = "tracing")]
    tracing::debug!(sid = ?session.id, "error while handling packet: {err}");
    if let Some(reason) = Option::<EIoDisconnectReason>::from(err) {
        session.close(reason);
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nsps = self.nsps.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("nsps", &nsps.keys().collect::<Vec<_>>())
            .finish()
    }
}
