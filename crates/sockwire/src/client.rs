//! A socket.io client connected to a single namespace.
//!
//! It runs over an [`EngineClient`] and mirrors the server [`Socket`](crate::socket::Socket) API:
//! handlers are registered on the [`SocketClientBuilder`] before connecting, then events are
//! emitted with [`SocketClient::emit`] and [`SocketClient::emit_with_ack`].
//!
//! # Example
//! ```no_run
//! # use sockwire::{SocketIo, client::{SocketClient, SocketClientBuilder}, handler::Message};
//! # use sockwire_engine::client::{ClientConfig, InProcessConnector};
//! # async fn doc() -> Result<(), Box<dyn std::error::Error>> {
//! let (engine, _io) = SocketIo::new();
//! let client = SocketClientBuilder::new()
//!     .namespace("/chat")
//!     .auth("secret")
//!     .on("chat", |_client: SocketClient, msg: Message| {
//!         println!("received {:?}", msg.data::<String>());
//!     })
//!     .connect(InProcessConnector::new(engine), ClientConfig::default())
//!     .await?;
//! client.emit("chat", "hello")?;
//! # Ok(())
//! # }
//! ```
use std::{
    borrow::Cow,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use sockwire_core::{
    Packet, PacketData, ParseError, ProtocolVersion, Sid, Value,
    packet::{ConnectPacket, ack_args, split_event},
    parser::{Decoder, encode},
    value::{from_value, to_args},
};
use sockwire_engine::{
    SendError as EIoSendError, TransportType,
    client::{ClientConfig, ClientEvent, ClientEvents, Connector, EngineClient},
};

use crate::{
    ack::{AckInnerStream, AckStream, PendingAcks},
    errors::{AckError, ConnectError, DisconnectError, SendError, SocketError},
    handler::{AckSender, EventHandlers, Message, PacketSender},
    socket::DisconnectReason,
};

/// The engine.io client, with its connector type erased.
trait EngineHandle: Send + Sync + 'static {
    fn protocol(&self) -> ProtocolVersion;
    fn sid(&self) -> Sid;
    fn transport_type(&self) -> TransportType;
    fn emit(&self, msg: String) -> Result<(), EIoSendError>;
    fn emit_many(&self, msg: String, bins: Vec<Bytes>) -> Result<(), EIoSendError>;
    fn start_heartbeat(&self);
    fn close(&self);
}

impl<C: Connector> EngineHandle for EngineClient<C> {
    fn protocol(&self) -> ProtocolVersion {
        EngineClient::protocol(self)
    }
    fn sid(&self) -> Sid {
        EngineClient::sid(self)
    }
    fn transport_type(&self) -> TransportType {
        EngineClient::transport_type(self)
    }
    fn emit(&self, msg: String) -> Result<(), EIoSendError> {
        EngineClient::emit(self, msg)
    }
    fn emit_many(&self, msg: String, bins: Vec<Bytes>) -> Result<(), EIoSendError> {
        EngineClient::emit_many(self, msg, bins)
    }
    fn start_heartbeat(&self) {
        EngineClient::start_heartbeat(self)
    }
    fn close(&self) {
        EngineClient::close(self)
    }
}

fn send_packet(engine: &dyn EngineHandle, packet: Packet) -> Result<(), SocketError> {
    let (msg, bins) = encode(packet, engine.protocol());
    let res = if bins.is_empty() {
        engine.emit(msg)
    } else {
        engine.emit_many(msg, bins)
    };
    res.map_err(|_| SocketError::Closed)
}

/// Configure and connect a [`SocketClient`].
pub struct SocketClientBuilder {
    namespace: String,
    auth: Option<Value>,
    ack_timeout: Duration,
    handlers: EventHandlers<SocketClient>,
}

impl SocketClientBuilder {
    /// A builder for the main namespace, without auth.
    pub fn new() -> Self {
        Self {
            namespace: "/".to_string(),
            auth: None,
            ack_timeout: Duration::from_secs(5),
            handlers: EventHandlers::default(),
        }
    }

    /// The namespace to connect to. Defaults to `/`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// The auth payload sent with the connect packet. It is not sent with V3.
    pub fn auth(mut self, auth: impl Into<Value>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    /// How long to wait for an acknowledgement. Defaults to 5 seconds.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Register a handler for an event.
    pub fn on<F>(self, event: impl Into<Cow<'static, str>>, handler: F) -> Self
    where
        F: Fn(SocketClient, Message) + Send + Sync + 'static,
    {
        self.handlers.on(event.into(), Arc::new(handler), false);
        self
    }

    /// Register a handler for the next occurrence of an event.
    pub fn once<F>(self, event: impl Into<Cow<'static, str>>, handler: F) -> Self
    where
        F: Fn(SocketClient, Message) + Send + Sync + 'static,
    {
        self.handlers.on(event.into(), Arc::new(handler), true);
        self
    }

    /// Register a handler called for every event.
    pub fn on_any<F>(self, handler: F) -> Self
    where
        F: Fn(SocketClient, &Message) + Send + Sync + 'static,
    {
        self.handlers.on_any(Arc::new(handler));
        self
    }

    /// Register a handler called when the client leaves the namespace.
    pub fn on_disconnect<F>(self, handler: F) -> Self
    where
        F: FnOnce(SocketClient, DisconnectReason) + Send + 'static,
    {
        self.handlers.on_disconnect(Box::new(handler));
        self
    }

    /// Open an engine.io session and connect to the namespace.
    ///
    /// The server answer must arrive within [`ClientConfig::connect_timeout`].
    pub async fn connect<C: Connector>(
        self,
        connector: C,
        config: ClientConfig,
    ) -> Result<SocketClient, ConnectError> {
        let timeout = config.connect_timeout;
        let (engine, mut events) = EngineClient::connect(connector, config).await?;
        let protocol = engine.protocol();

        // V3 clients are connected to the main namespace by the server
        if protocol == ProtocolVersion::V4 || self.namespace != "/" {
            let auth = match protocol {
                ProtocolVersion::V4 => self.auth.clone(),
                ProtocolVersion::V3 => None,
            };
            send_packet(&engine, Packet::connect(self.namespace.clone(), auth))
                .map_err(|_| ConnectError::Closed)?;
        }

        let mut decoder = Decoder::new();
        let payload = tokio::time::timeout(
            timeout,
            wait_connect(&mut events, &mut decoder, &self.namespace),
        )
        .await
        .map_err(|_| ConnectError::Timeout)??;
        // V3 pings only start once the namespace is connected
        if protocol == ProtocolVersion::V3 {
            engine.start_heartbeat();
        }

        let id = match payload.map(from_value::<ConnectPacket>) {
            Some(Ok(packet)) => packet.sid,
            _ => engine.sid(),
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(?id, ns = %self.namespace, "client connected");

        let inner = Arc::new(Inner {
            engine: Box::new(engine),
            ns: self.namespace,
            id,
            handlers: self.handlers,
            acks: PendingAcks::default(),
            ack_timeout: self.ack_timeout,
            connected: AtomicBool::new(true),
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), events, decoder));
        Ok(SocketClient { inner })
    }
}

impl Default for SocketClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SocketClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClientBuilder")
            .field("namespace", &self.namespace)
            .field("auth", &self.auth)
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

/// Wait for the answer to the connect packet. Packets of other namespaces are ignored.
async fn wait_connect(
    events: &mut ClientEvents,
    decoder: &mut Decoder,
    ns: &str,
) -> Result<Option<Value>, ConnectError> {
    loop {
        let res = match events.recv().await {
            Some(ClientEvent::Message(msg)) => decoder.decode_str(&msg),
            Some(ClientEvent::Binary(bin)) => decoder.decode_bin(bin),
            Some(ClientEvent::Closed(_)) | None => return Err(ConnectError::Closed),
        };
        let packet = match res {
            Ok(packet) => packet,
            Err(ParseError::NeedsMoreBinaryData) => continue,
            Err(e) => return Err(e.into()),
        };
        if packet.ns != ns {
            continue;
        }
        match packet.inner {
            PacketData::Connect(payload) => return Ok(payload),
            PacketData::ConnectError(reason) => return Err(ConnectError::Rejected(reason)),
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(ns, "packet received before the connection, ignored");
            }
        }
    }
}

async fn read_loop(inner: Weak<Inner>, mut events: ClientEvents, mut decoder: Decoder) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let client = SocketClient { inner };
        let res = match event {
            ClientEvent::Message(msg) => decoder.decode_str(&msg),
            ClientEvent::Binary(bin) => decoder.decode_bin(bin),
            ClientEvent::Closed(reason) => {
                client.close(reason.into());
                break;
            }
        };
        match res {
            Ok(packet) => client.handle_packet(packet),
            Err(ParseError::NeedsMoreBinaryData) => {}
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("invalid packet from server: {_e}");
                client.close(DisconnectReason::PacketParsingError);
                client.inner.engine.close();
            }
        }
    }
}

struct Inner {
    engine: Box<dyn EngineHandle>,
    ns: String,
    id: Sid,
    handlers: EventHandlers<SocketClient>,
    acks: PendingAcks,
    ack_timeout: Duration,
    connected: AtomicBool,
}

impl PacketSender for Inner {
    fn send_packet(&self, packet: Packet) -> Result<(), SocketError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        send_packet(self.engine.as_ref(), packet)
    }

    fn path(&self) -> &str {
        &self.ns
    }
}

/// A client connected to a namespace.
///
/// It can be cloned and given to other tasks.
/// The engine.io session is closed once every clone is dropped.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<Inner>,
}

impl SocketClient {
    /// The id given by the server.
    pub fn id(&self) -> Sid {
        self.inner.id
    }

    /// The namespace of the client.
    pub fn ns(&self) -> &str {
        &self.inner.ns
    }

    /// The protocol version of the session.
    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.engine.protocol()
    }

    /// The current transport of the session.
    pub fn transport_type(&self) -> TransportType {
        self.inner.engine.transport_type()
    }

    /// Whether the client is still connected to the namespace.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Emit an event to the server.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<(), SendError> {
        let args = to_args(data)?;
        self.inner
            .send_packet(Packet::event(self.ns(), event.as_ref(), args))?;
        Ok(())
    }

    /// Emit an event to the server and wait for its acknowledgement.
    pub fn emit_with_ack<T: ?Sized + Serialize, V: DeserializeOwned>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<AckStream<V>, SendError> {
        if !self.connected() {
            return Err(SocketError::Closed.into());
        }
        let args = to_args(data)?;
        let mut packet = Packet::event(self.ns(), event.as_ref(), args);
        let (ack, rx) = self.inner.acks.register(&mut packet);
        if let Err(e) = self.inner.send_packet(packet) {
            self.inner.acks.fail(ack, AckError::Socket(e.clone()));
            return Err(e.into());
        }
        let inner = AckInnerStream::send(rx, self.inner.ack_timeout, self.id());
        Ok(AckStream::new(inner))
    }

    /// Leave the namespace and close the engine.io session.
    ///
    /// The disconnect handlers are called with [`DisconnectReason::ClientNSDisconnect`].
    pub fn disconnect(&self) -> Result<(), DisconnectError> {
        if !self.connected() {
            return Err(DisconnectError::AlreadyDisconnected);
        }
        self.inner
            .send_packet(Packet::disconnect(self.ns()))
            .ok();
        self.close(DisconnectReason::ClientNSDisconnect);
        self.inner.engine.close();
        Ok(())
    }

    fn close(&self, reason: DisconnectReason) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(id = ?self.id(), ?reason, "client disconnected");
        self.inner.acks.clear();
        self.inner.handlers.disconnect(self.clone(), reason);
    }

    fn handle_packet(&self, packet: Packet) {
        if packet.ns != self.inner.ns {
            #[cfg(feature = "tracing")]
            tracing::debug!(ns = %packet.ns, "packet for another namespace, ignored");
            return;
        }
        match packet.inner {
            PacketData::Event(data, ack) | PacketData::BinaryEvent(data, ack) => {
                let Some((event, args)) = split_event(data) else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("event without a name, ignored");
                    return;
                };
                let ack = ack.map(|id| AckSender::new(self.inner.clone(), id));
                self.inner
                    .handlers
                    .dispatch(self.clone(), Message { event, args, ack });
            }
            PacketData::EventAck(data, ack) | PacketData::BinaryAck(data, ack) => {
                self.inner.acks.resolve(ack, ack_args(data));
            }
            PacketData::Disconnect => {
                self.close(DisconnectReason::ServerNSDisconnect);
                self.inner.engine.close();
            }
            PacketData::Connect(_) | PacketData::ConnectError(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("unexpected connect packet, ignored");
            }
        }
    }
}

impl fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClient")
            .field("ns", &self.ns())
            .field("id", &self.id())
            .field("connected", &self.connected())
            .finish()
    }
}
