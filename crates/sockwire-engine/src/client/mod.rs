//! ## Engine.IO client
//!
//! An [`EngineClient`] opens a session on a remote engine.io server through a [`Connector`],
//! which provides the network primitives: long-polling requests and websocket connections.
//!
//! * The handshake is done with long-polling if it is allowed, otherwise with a websocket.
//! * A polling session is upgraded to websocket when the server allows it and
//!   [`ClientConfig::upgrade`] is set.
//! * Incoming messages are received as [`ClientEvent`]s on the [`ClientEvents`] stream.
//!
//! With V4 the client answers the server pings. With V3 the client sends the pings, the
//! heartbeat is started with [`EngineClient::start_heartbeat`] once the caller is ready
//! (socket.io starts it when the namespace is connected).
//!
//! #### Example :
//! ```rust
//! # use std::sync::Arc;
//! # use bytes::Bytes;
//! # use sockwire_engine::{
//! #     client::{ClientConfig, ClientEvent, EngineClient, InProcessConnector},
//! #     config::EngineIoConfig, handler::EngineIoHandler, DisconnectReason, EngineIo, Session,
//! # };
//! #[derive(Debug)]
//! struct Echo;
//! impl EngineIoHandler for Echo {
//!     type Data = ();
//!     fn on_connect(self: Arc<Self>, _: Arc<Session<()>>) {}
//!     fn on_disconnect(&self, _: Arc<Session<()>>, _: DisconnectReason) {}
//!     fn on_message(self: &Arc<Self>, msg: String, session: Arc<Session<()>>) {
//!         session.emit(msg).ok();
//!     }
//!     fn on_binary(self: &Arc<Self>, data: Bytes, session: Arc<Session<()>>) {
//!         session.emit_binary(data).ok();
//!     }
//! }
//! # tokio_test(async {
//! let engine = Arc::new(EngineIo::new(Arc::new(Echo), EngineIoConfig::default()));
//! let connector = InProcessConnector::new(engine);
//! let (client, mut events) = EngineClient::connect(connector, ClientConfig::default()).await?;
//! client.emit("hello")?;
//! assert_eq!(events.recv().await, Some(ClientEvent::Message("hello".into())));
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! # });
//! # fn tokio_test<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```
use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{SinkExt, StreamExt};
use smallvec::{SmallVec, smallvec};
use sockwire_engine_core::{
    OpenPacket, Packet, PacketBuf, PacketParseError, ProtocolVersion, Sid, TransportType,
    payload::{self, Payload, PayloadError},
};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};

use crate::{
    errors::SendError,
    heartbeat::{Heartbeat, HeartbeatMode, HeartbeatPeer},
    peekable::{Drain, PeekableReceiver},
    session::DisconnectReason,
    transport::{
        CloseSignal, HEARTBEAT_SEND_RETRIES, MessageSink, TransportError, retry_delay,
        ws::write_frames,
    },
};

pub use config::{ClientConfig, ClientConfigBuilder};
pub use connector::{Connector, InProcessConnector, PollResponse};

mod config;
mod connector;

/// Error returned when a client cannot connect or upgrade.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The connector failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The handshake packet could not be decoded.
    #[error("invalid handshake packet: {0}")]
    Handshake(#[from] PacketParseError),
    /// The handshake payload could not be decoded.
    #[error("invalid handshake payload: {0}")]
    Payload(#[from] PayloadError),
    /// The server sent another packet than the one expected.
    #[error("unexpected packet: {0:?}")]
    UnexpectedPacket(Packet),
    /// The server did not answer in time.
    #[error("connection timeout")]
    Timeout,
    /// The upgrade to websocket failed.
    #[error("upgrade failed")]
    Upgrade,
    /// None of the configured transports can be used.
    #[error("no transport available")]
    NoTransport,
    /// The client is closed.
    #[error("client closed")]
    Closed,
}

/// Something received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A text message
    Message(String),
    /// A binary message
    Binary(Bytes),
    /// The session was closed, it is the last event.
    Closed(DisconnectReason),
}

/// The stream of [`ClientEvent`]s of an [`EngineClient`].
#[derive(Debug)]
pub struct ClientEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientEvents {
    /// Receive the next event. Returns `None` once the client is dropped and all events
    /// were received.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }
}

impl Stream for ClientEvents {
    type Item = ClientEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Inner<C: Connector> {
    connector: C,
    config: ClientConfig,
    open: OpenPacket,
    protocol: ProtocolVersion,
    transport: AtomicU8,

    upgrading: watch::Sender<bool>,
    /// Set by the polling reader when it stopped polling because of an upgrade.
    poll_paused: watch::Sender<bool>,
    stop_polling: CloseSignal,
    polling_writer: StdMutex<Option<JoinHandle<()>>>,

    closed: CloseSignal,
    tx: mpsc::UnboundedSender<PacketBuf>,
    rx: Mutex<PeekableReceiver<PacketBuf>>,
    heartbeat: Heartbeat,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// A client connection to an engine.io server.
///
/// The connection is closed when the client is dropped.
pub struct EngineClient<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> EngineClient<C> {
    /// Open a session with the server.
    ///
    /// The whole handshake, including the optional upgrade, must complete within
    /// [`ClientConfig::connect_timeout`].
    pub async fn connect(
        connector: C,
        config: ClientConfig,
    ) -> Result<(Self, ClientEvents), ConnectError> {
        let timeout = config.connect_timeout;
        tokio::time::timeout(timeout, Self::handshake(connector, config))
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    async fn handshake(
        connector: C,
        config: ClientConfig,
    ) -> Result<(Self, ClientEvents), ConnectError> {
        let protocol = config.protocol;
        let (open, rest, socket) = if config.allowed_transport(TransportType::Polling) {
            let query = build_query(&config, TransportType::Polling, None);
            let res = connector.get(&query).await?;
            let mut packets =
                payload::decode(&res.data, protocol, res.binary, u64::MAX)?.into_iter();
            let open = match packets.next() {
                Some(Ok(Packet::Open(open))) => open,
                Some(Ok(packet)) => return Err(ConnectError::UnexpectedPacket(packet)),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Closed.into()),
            };
            let rest: Vec<Packet> = packets.filter_map(Result::ok).collect();
            (open, rest, None)
        } else if config.allowed_transport(TransportType::Websocket) {
            let query = build_query(&config, TransportType::Websocket, None);
            let mut socket = connector.open_socket(&query).await?;
            let frame = socket.next().await.ok_or(TransportError::Closed)??;
            let open = match Packet::from_frame(frame, protocol)? {
                Packet::Open(open) => open,
                packet => return Err(ConnectError::UnexpectedPacket(packet)),
            };
            (open, Vec::new(), Some(socket))
        } else {
            return Err(ConnectError::NoTransport);
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?open.sid, ?protocol, "client handshake done");

        let mode = match protocol {
            ProtocolVersion::V3 => HeartbeatMode::Initiator,
            ProtocolVersion::V4 => HeartbeatMode::Responder,
        };
        let heartbeat = Heartbeat::new(
            mode,
            Duration::from_millis(open.ping_interval),
            Duration::from_millis(open.ping_timeout),
        );
        let transport = match socket {
            Some(_) => TransportType::Websocket,
            None => TransportType::Polling,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connector,
            config,
            open,
            protocol,
            transport: AtomicU8::new(transport as u8),
            upgrading: watch::Sender::new(false),
            poll_paused: watch::Sender::new(false),
            stop_polling: CloseSignal::new(),
            polling_writer: StdMutex::new(None),
            closed: CloseSignal::new(),
            tx,
            rx: Mutex::new(PeekableReceiver::new(rx)),
            heartbeat,
            events: events_tx,
        });

        match socket {
            Some(socket) => spawn_socket_tasks(&inner, socket),
            None => {
                let writer = tokio::spawn(polling_writer(inner.clone()));
                inner
                    .polling_writer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(writer);
                tokio::spawn(polling_reader(inner.clone()));
            }
        }
        for packet in rest {
            inner.handle_packet(packet);
        }
        if protocol == ProtocolVersion::V4 {
            inner.heartbeat.start(Arc::downgrade(&inner));
        }

        let client = EngineClient { inner };
        let events = ClientEvents { rx: events_rx };

        let can_upgrade = client.inner.open.upgrades.iter().any(|t| t == "websocket")
            && client.inner.config.allowed_transport(TransportType::Websocket);
        if transport == TransportType::Polling && client.inner.config.upgrade && can_upgrade {
            client.upgrade().await?;
        }
        Ok((client, events))
    }

    /// Upgrade a polling session to websocket.
    ///
    /// If the probe fails the session keeps using long-polling.
    /// It does nothing if the session already uses a websocket.
    ///
    /// ## Handshake :
    /// ```text
    /// 1. open a websocket with the session id
    /// 2. send `2probe`, expect `3probe`
    /// 3. wait for the pending polling request to be released by the server noop
    /// 4. send `5` and switch the session to the websocket
    /// ```
    pub async fn upgrade(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.closed.is_closed() {
            return Err(ConnectError::Closed);
        }
        if inner.transport_type() == TransportType::Websocket {
            return Ok(());
        }
        if inner.upgrading.send_replace(true) {
            return Err(ConnectError::Upgrade);
        }

        let mut socket = match inner.probe().await {
            Ok(socket) => socket,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(sid = ?inner.open.sid, "upgrade probe failed: {e}");
                inner.upgrading.send_replace(false);
                return Err(e);
            }
        };

        let paused = tokio::time::timeout(inner.config.upgrade_timeout, async {
            tokio::select! {
                _ = wait_until(&inner.poll_paused, true) => true,
                _ = inner.closed.closed() => false,
            }
        })
        .await;
        if !matches!(paused, Ok(true)) {
            inner.upgrading.send_replace(false);
            return Err(ConnectError::Upgrade);
        }

        inner.stop_polling.close_with(|| ());
        let writer = inner
            .polling_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer.await.ok();
        }

        if let Err(e) = socket.send(Packet::Upgrade.into_frame(inner.protocol)).await {
            inner.upgrading.send_replace(false);
            inner.close(DisconnectReason::TransportError);
            return Err(e.into());
        }
        inner
            .transport
            .store(TransportType::Websocket as u8, Ordering::Release);
        inner.upgrading.send_replace(false);
        spawn_socket_tasks(inner, socket);

        #[cfg(feature = "tracing")]
        tracing::debug!(sid = ?inner.open.sid, "client upgraded to websocket");
        Ok(())
    }

    /// Start the V3 heartbeat: the client sends a ping every `pingInterval`.
    /// With V4 the heartbeat is started when connected and this does nothing.
    pub fn start_heartbeat(&self) {
        self.inner.heartbeat.start(Arc::downgrade(&self.inner));
    }

    /// The session id
    pub fn sid(&self) -> Sid {
        self.inner.open.sid
    }

    /// The protocol version
    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.protocol
    }

    /// The handshake sent by the server
    pub fn open_packet(&self) -> &OpenPacket {
        &self.inner.open
    }

    /// The current transport
    pub fn transport_type(&self) -> TransportType {
        self.inner.transport_type()
    }

    /// Round trip time of the last heartbeat, only measured with V3.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.inner.heartbeat.last_rtt()
    }

    /// Send a text message to the server.
    pub fn emit(&self, msg: impl Into<String>) -> Result<(), SendError> {
        self.send_packets(smallvec![Packet::Message(msg.into())])
    }

    /// Send a binary message to the server.
    pub fn emit_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_packets(smallvec![Packet::Binary(data.into())])
    }

    /// Send a text message followed by binary messages, without any other packet in between.
    pub fn emit_many(&self, msg: impl Into<String>, data: Vec<Bytes>) -> Result<(), SendError> {
        let mut packets = SmallVec::with_capacity(data.len() + 1);
        packets.push(Packet::Message(msg.into()));
        packets.extend(data.into_iter().map(Packet::Binary));
        self.send_packets(packets)
    }

    /// Close the session. A close packet is sent to the server.
    pub fn close(&self) {
        self.inner.close(DisconnectReason::ClosingClient);
    }

    /// Returns true if the session is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    /// Wait for the session to be closed.
    pub async fn closed(&self) {
        self.inner.closed.closed().await
    }
}

impl<C: Connector> MessageSink for EngineClient<C> {
    fn send_packets(&self, packets: PacketBuf) -> Result<(), SendError> {
        self.inner.send_packets(packets)
    }
}

impl<C: Connector> Drop for EngineClient<C> {
    fn drop(&mut self) {
        self.inner.close(DisconnectReason::ClosingClient);
    }
}

impl<C: Connector> fmt::Debug for EngineClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient")
            .field("sid", &self.inner.open.sid)
            .field("protocol", &self.inner.protocol)
            .field("transport", &self.inner.transport_type())
            .field("closed", &self.inner.closed.is_closed())
            .finish()
    }
}

fn build_query(config: &ClientConfig, transport: TransportType, sid: Option<Sid>) -> String {
    let mut query = format!(
        "EIO={}&transport={}",
        config.protocol.as_str(),
        transport.as_str()
    );
    if let Some(sid) = sid {
        query.push_str("&sid=");
        query.push_str(sid.as_str());
    }
    for (key, value) in &config.query {
        query.push('&');
        query.push_str(key);
        query.push('=');
        query.push_str(value);
    }
    query
}

async fn wait_until(flag: &watch::Sender<bool>, value: bool) {
    let mut rx = flag.subscribe();
    rx.wait_for(|v| *v == value).await.map(|_| ()).ok();
}

impl<C: Connector> Inner<C> {
    fn query(&self, transport: TransportType) -> String {
        build_query(&self.config, transport, Some(self.open.sid))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::from(self.transport.load(Ordering::Acquire))
    }

    fn handle_packet(&self, packet: Packet) {
        #[cfg(feature = "tracing")]
        tracing::trace!(sid = ?self.open.sid, "received packet: {:?}", packet);
        match (packet, self.protocol) {
            (Packet::Message(msg), _) => {
                self.events.send(ClientEvent::Message(msg)).ok();
            }
            (Packet::Binary(data), _) => {
                self.events.send(ClientEvent::Binary(data)).ok();
            }
            (Packet::Ping, ProtocolVersion::V4) | (Packet::Pong, ProtocolVersion::V3) => {
                self.heartbeat.notify()
            }
            (Packet::Close, _) => self.close(DisconnectReason::TransportClose),
            (Packet::Noop, _) => (),
            (_packet, _) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(sid = ?self.open.sid, "unexpected packet: {:?}", _packet);
            }
        }
    }

    /// Close the session, only the first call has an effect.
    /// A close packet is queued for the server if the client closes the session itself.
    fn close(&self, reason: DisconnectReason) {
        let closed = self.closed.close_with(|| {
            if reason == DisconnectReason::ClosingClient {
                self.tx.send(smallvec![Packet::Close]).ok();
            }
        });
        if closed {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?self.open.sid, ?reason, "closing client");
            self.heartbeat.stop();
            self.events.send(ClientEvent::Closed(reason)).ok();
        }
    }

    /// Open a websocket for the session and exchange the probe packets.
    async fn probe(&self) -> Result<C::Channel, ConnectError> {
        let query = self.query(TransportType::Websocket);
        let probe = async {
            let mut socket = self.connector.open_socket(&query).await?;
            socket
                .send(Packet::PingProbe.into_frame(self.protocol))
                .await?;
            let frame = socket.next().await.ok_or(TransportError::Closed)??;
            match Packet::from_frame(frame, self.protocol)? {
                Packet::PongProbe => Ok(socket),
                packet => Err(ConnectError::UnexpectedPacket(packet)),
            }
        };
        tokio::time::timeout(self.config.upgrade_timeout, probe)
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    async fn post(&self, query: &str, payload: Payload, retry: bool) -> Result<(), TransportError> {
        let mut attempt = 0;
        loop {
            match self.connector.post(query, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(_e) if retry && attempt < HEARTBEAT_SEND_RETRIES => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, "heartbeat post failed: {_e}, retrying");
                    tokio::time::sleep(retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<C: Connector> MessageSink for Inner<C> {
    fn send_packets(&self, packets: PacketBuf) -> Result<(), SendError> {
        if self.closed.is_closed() {
            return Err(SendError(packets));
        }
        self.tx.send(packets).map_err(|e| SendError(e.0))
    }
}

impl<C: Connector> HeartbeatPeer for Inner<C> {
    fn is_upgrading(&self) -> bool {
        *self.upgrading.borrow()
    }

    fn on_heartbeat_timeout(&self) {
        self.close(DisconnectReason::HeartbeatTimeout);
    }
}

/// Poll the server until the session is closed or upgraded.
///
/// While an upgrade is in progress no new request is sent, so the server can switch
/// the session to the websocket.
async fn polling_reader<C: Connector>(inner: Arc<Inner<C>>) {
    let query = inner.query(TransportType::Polling);
    loop {
        let res = tokio::select! {
            res = inner.connector.get(&query) => res,
            _ = inner.closed.closed() => return,
        };
        let packets = match res {
            Ok(res) => payload::decode(&res.data, inner.protocol, res.binary, u64::MAX),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(sid = ?inner.open.sid, "polling request failed: {_e}");
                inner.close(DisconnectReason::TransportError);
                return;
            }
        };
        match packets {
            Ok(packets) => {
                for packet in packets.into_iter().filter_map(Result::ok) {
                    inner.handle_packet(packet);
                }
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(sid = ?inner.open.sid, "invalid payload: {_e}");
                inner.close(DisconnectReason::PacketParsingError);
                return;
            }
        }

        if inner.is_upgrading() {
            inner.poll_paused.send_replace(true);
            tokio::select! {
                _ = wait_until(&inner.upgrading, false) => (),
                _ = inner.closed.closed() => return,
            }
            inner.poll_paused.send_replace(false);
        }
        if inner.closed.is_closed() || inner.transport_type() == TransportType::Websocket {
            return;
        }
    }
}

/// Send the queued packets with long-polling write requests until the session is closed
/// or the polling transport is stopped by an upgrade.
async fn polling_writer<C: Connector>(inner: Arc<Inner<C>>) {
    let query = inner.query(TransportType::Polling);
    loop {
        let mut rx = inner.rx.lock().await;
        let stop = tokio::select! {
            biased;
            available = rx.fill() => !available,
            _ = inner.closed.closed() => false,
            _ = inner.stop_polling.closed() => true,
        };
        if stop {
            return;
        }

        let mut drain = Drain::new(&mut rx);
        let payload = payload::encode(&mut drain, inner.protocol, false, inner.open.max_payload);
        let (saw_close, heartbeat_only) = (drain.saw_close(), drain.heartbeat_only());
        if payload.data.is_empty() {
            return;
        }
        let res = inner.post(&query, payload, heartbeat_only).await;
        drop(rx);

        if let Err(_e) = res {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?inner.open.sid, "polling write failed: {_e}");
            inner.close(DisconnectReason::TransportError);
            return;
        }
        if saw_close {
            return;
        }
    }
}

fn spawn_socket_tasks<C: Connector>(inner: &Arc<Inner<C>>, socket: C::Channel) {
    let (mut tx, mut rx) = socket.split();

    let writer = inner.clone();
    tokio::spawn(async move {
        let mut queue = writer.rx.lock().await;
        if let Err(_e) = write_frames(&mut queue, &mut tx, writer.protocol, &writer.closed).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(sid = ?writer.open.sid, "websocket write failed: {_e}");
            drop(queue);
            writer.close(DisconnectReason::TransportError);
        }
    });

    let reader = inner.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = rx.next() => frame,
                _ = reader.closed.closed() => return,
            };
            match frame {
                None => return reader.close(DisconnectReason::TransportClose),
                Some(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(sid = ?reader.open.sid, "websocket read failed: {_e}");
                    return reader.close(DisconnectReason::TransportError);
                }
                Some(Ok(frame)) => match Packet::from_frame(frame, reader.protocol) {
                    Ok(packet) => reader.handle_packet(packet),
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(sid = ?reader.open.sid, "skipping packet: {_e}");
                    }
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_with_sid_and_extra_params() {
        let config = ClientConfig::builder()
            .protocol(ProtocolVersion::V3)
            .query("token", "abc")
            .build();
        let sid: Sid = "AAAAAAAAAAAAAAHs".parse().unwrap();
        assert_eq!(
            build_query(&config, TransportType::Websocket, Some(sid)),
            "EIO=3&transport=websocket&sid=AAAAAAAAAAAAAAHs&token=abc"
        );
        assert_eq!(
            build_query(&ClientConfig::default(), TransportType::Polling, None),
            "EIO=4&transport=polling"
        );
    }
}
