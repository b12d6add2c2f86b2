//! The [`SocketIo`] handle and its configuration.
use std::{borrow::Cow, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use sockwire_core::{ProtocolVersion, Value};
use sockwire_engine::{
    EngineIo, TransportType,
    config::{EngineIoConfig, EngineIoConfigBuilder},
};

use crate::{
    BroadcastError, DisconnectError, SendError,
    ack::AckStream,
    ns::Namespace,
    operators::BroadcastOperators,
    rooms::RoomParam,
    router::Router,
    socket::SocketRef,
};

/// Configuration for Socket.IO & Engine.IO
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// The inner Engine.IO config
    pub engine_config: EngineIoConfig,

    /// The amount of time the server will wait for an acknowledgement from the client before closing the connection.
    ///
    /// Defaults to 5 seconds.
    pub ack_timeout: Duration,

    /// The amount of time before disconnecting a client that has not successfully joined a namespace.
    ///
    /// Defaults to 45 seconds.
    pub connect_timeout: Duration,

    /// Create a namespace on the first connection to an unknown path.
    /// When disabled the connection is refused with an `Invalid namespace` connect error.
    ///
    /// Defaults to true.
    pub lazy_namespaces: bool,
}

impl Default for SocketIoConfig {
    fn default() -> Self {
        Self {
            engine_config: EngineIoConfig::builder().req_path("/socket.io").build(),
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(45),
            lazy_namespaces: true,
        }
    }
}

/// A builder to create a [`SocketIo`] instance.
/// It contains everything to configure the socket.io server with a [`SocketIoConfig`].
#[derive(Debug)]
pub struct SocketIoBuilder {
    config: SocketIoConfig,
    engine_config_builder: EngineIoConfigBuilder,
}

impl SocketIoBuilder {
    /// Creates a new [`SocketIoBuilder`] with default config
    pub fn new() -> Self {
        Self {
            config: SocketIoConfig::default(),
            engine_config_builder: EngineIoConfigBuilder::new().req_path("/socket.io"),
        }
    }

    /// The path to listen for socket.io requests on.
    ///
    /// Defaults to "/socket.io".
    #[inline]
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.engine_config_builder = self.engine_config_builder.req_path(req_path);
        self
    }

    /// The interval at which the server will send a ping packet to the client.
    ///
    /// Defaults to 25 seconds.
    #[inline]
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.engine_config_builder = self.engine_config_builder.ping_interval(ping_interval);
        self
    }

    /// The amount of time the server will wait for a ping response from the client before closing the connection.
    ///
    /// Defaults to 20 seconds.
    #[inline]
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.engine_config_builder = self.engine_config_builder.ping_timeout(ping_timeout);
        self
    }

    /// The maximum number of bytes that can be received per http request or websocket message.
    ///
    /// Defaults to 100KB.
    #[inline]
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.engine_config_builder = self.engine_config_builder.max_payload(max_payload);
        self
    }

    /// How long a polling request is held when there is nothing to send.
    #[inline]
    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.engine_config_builder = self.engine_config_builder.poll_timeout(poll_timeout);
        self
    }

    /// How long a transport upgrade can take.
    #[inline]
    pub fn upgrade_timeout(mut self, upgrade_timeout: Duration) -> Self {
        self.engine_config_builder = self.engine_config_builder.upgrade_timeout(upgrade_timeout);
        self
    }

    /// Allowed transports on this server.
    ///
    /// The `transports` array should have a size of 1 or 2.
    ///
    /// Defaults to : `[TransportType::Polling, TransportType::Websocket]`
    #[inline]
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        self.engine_config_builder = self.engine_config_builder.transports(transports);
        self
    }

    /// Accepted protocol versions.
    ///
    /// Defaults to both V3 and V4.
    #[inline]
    pub fn protocols<const N: usize>(mut self, protocols: [ProtocolVersion; N]) -> Self {
        self.engine_config_builder = self.engine_config_builder.protocols(protocols);
        self
    }

    /// The amount of time the server will wait for an acknowledgement from the client before closing the connection.
    ///
    /// Defaults to 5 seconds.
    #[inline]
    pub fn ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.config.ack_timeout = ack_timeout;
        self
    }

    /// The amount of time before disconnecting a client that has not successfully joined a namespace.
    ///
    /// Defaults to 45 seconds.
    #[inline]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config.connect_timeout = connect_timeout;
        self
    }

    /// Create namespaces on the first connection to an unknown path.
    ///
    /// Defaults to true.
    #[inline]
    pub fn lazy_namespaces(mut self, lazy: bool) -> Self {
        self.config.lazy_namespaces = lazy;
        self
    }

    /// Build the engine.io server and its [`SocketIo`] handle.
    ///
    /// The [`EngineIo`] must be plugged to a transport: http requests are given to
    /// [`service::handle_request`](sockwire_engine::service::handle_request) and websocket connections
    /// to [`EngineIo::on_ws_connection`].
    pub fn build(mut self) -> (Arc<EngineIo<Router>>, SocketIo) {
        self.config.engine_config = self.engine_config_builder.build();
        let router = Arc::new(Router::new(self.config.clone()));
        let engine = Arc::new(EngineIo::new(router.clone(), self.config.engine_config));
        router.set_engine(&engine);
        (engine, SocketIo(router))
    }
}

impl Default for SocketIoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The [`SocketIo`] instance can be cheaply cloned and moved around everywhere in your program.
/// It can be used as the main handle to access the whole socket.io context.
#[derive(Debug, Clone)]
pub struct SocketIo(Arc<Router>);

impl SocketIo {
    /// Create a new [`SocketIoBuilder`] with a default config
    #[inline(always)]
    pub fn builder() -> SocketIoBuilder {
        SocketIoBuilder::new()
    }

    /// Create a server with the default config.
    pub fn new() -> (Arc<EngineIo<Router>>, SocketIo) {
        SocketIoBuilder::new().build()
    }

    /// Returns a reference to the [`SocketIoConfig`] used by this [`SocketIo`] instance
    #[inline]
    pub fn config(&self) -> &SocketIoConfig {
        &self.0.config
    }

    /// Get or create the namespace of the path and add a connect handler to it.
    ///
    /// The handler is called with the new socket and the auth payload sent by the client.
    /// Middlewares can be added to the returned [`Namespace`].
    ///
    /// # Example
    /// ```
    /// # use sockwire::{SocketIo, socket::SocketRef, handler::Message};
    /// let (_engine, io) = SocketIo::new();
    /// io.ns("/", |socket: SocketRef, _auth| {
    ///     socket.on("message", |socket: SocketRef, msg: Message| {
    ///         socket.emit("message-back", "hello").ok();
    ///     });
    /// });
    ///
    /// // Namespaces can be nested
    /// io.ns("/admin/users", |socket: SocketRef, auth| {
    ///     println!("user {} connected with {:?}", socket.id, auth);
    /// });
    /// ```
    pub fn ns<F>(&self, path: impl Into<Cow<'static, str>>, handler: F) -> Arc<Namespace>
    where
        F: Fn(SocketRef, Option<Value>) + Send + Sync + 'static,
    {
        let ns = self.0.get_or_create_ns(path.into());
        ns.on_connect(handler);
        ns
    }

    /// Delete the namespace with the given path.
    ///
    /// Its sockets are disconnected with [`ServerNSDisconnect`](crate::socket::DisconnectReason::ServerNSDisconnect).
    /// The main namespace `/` cannot be removed: its sockets and handlers are dropped instead.
    pub fn delete_ns(&self, path: &str) {
        self.0.delete_ns(path);
    }

    /// Select the namespace with the given path.
    /// Returns `None` if the namespace does not exist.
    pub fn of(&self, path: &str) -> Option<BroadcastOperators> {
        self.0.get_ns(path).map(BroadcastOperators::new)
    }

    /// Select all the sockets of the main namespace in the given rooms.
    pub fn to(&self, rooms: impl RoomParam) -> BroadcastOperators {
        self.root().to(rooms)
    }

    /// Select all the sockets of the main namespace in the given rooms.
    /// Same as [`SocketIo::to`] at the server level.
    pub fn within(&self, rooms: impl RoomParam) -> BroadcastOperators {
        self.root().within(rooms)
    }

    /// Select all the sockets of the main namespace except the ones in the given rooms.
    pub fn except(&self, rooms: impl RoomParam) -> BroadcastOperators {
        self.root().except(rooms)
    }

    /// Emit an event to every socket of the main namespace.
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        self.root().emit(event, data)
    }

    /// Emit an event to every socket of the main namespace and wait for their acknowledgements.
    pub fn emit_with_ack<T: ?Sized + Serialize, V: DeserializeOwned>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<AckStream<V>, SendError> {
        self.root().emit_with_ack(event, data)
    }

    /// The sockets of the main namespace.
    pub fn sockets(&self) -> Vec<SocketRef> {
        self.0.root().sockets()
    }

    /// Disconnect every socket of every namespace. The engine.io sessions stay open.
    pub fn disconnect_all(&self) -> Result<(), Vec<DisconnectError>> {
        let errors: Vec<_> = self
            .0
            .namespaces()
            .into_iter()
            .flat_map(|ns| ns.sockets())
            .filter_map(|socket| socket.disconnect().err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Close every engine.io session. The sockets are disconnected with
    /// [`ClosingServer`](crate::socket::DisconnectReason::ClosingServer).
    pub fn close(&self) {
        match self.0.engine() {
            Some(engine) => engine.close(),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!("engine already dropped");
            }
        }
    }

    fn root(&self) -> BroadcastOperators {
        BroadcastOperators::new(self.0.root())
    }
}
