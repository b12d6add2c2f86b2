use std::time::Duration;

use sockwire_engine_core::{ProtocolVersion, TransportType};

/// Configuration of an [`EngineClient`](super::EngineClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The protocol version to speak.
    /// Defaults to V4.
    pub protocol: ProtocolVersion,

    /// Allowed transports as a bitfield of [`TransportType`] values.
    /// Polling is used for the handshake if it is allowed, otherwise a websocket is opened directly.
    pub transports: u8,

    /// Whether a polling session should be upgraded to websocket when the server allows it.
    /// Defaults to true.
    pub upgrade: bool,

    /// The maximum time to wait for the handshake.
    /// Defaults to 20 seconds.
    pub connect_timeout: Duration,

    /// The maximum time to wait for the probe answer during an upgrade.
    /// Defaults to 10 seconds.
    pub upgrade_timeout: Duration,

    /// Extra query parameters sent with every request.
    pub query: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::V4,
            transports: TransportType::Polling as u8 | TransportType::Websocket as u8,
            upgrade: true,
            connect_timeout: Duration::from_secs(20),
            upgrade_timeout: Duration::from_secs(10),
            query: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Create a new [`ClientConfigBuilder`]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Check if a [`TransportType`] is enabled
    #[inline(always)]
    pub fn allowed_transport(&self, transport: TransportType) -> bool {
        self.transports & transport as u8 == transport as u8
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// The protocol version to speak.
    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Allowed transports.
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        assert!(N > 0, "at least one transport must be allowed");
        self.config.transports = transports.iter().fold(0, |acc, t| acc | *t as u8);
        self
    }

    /// Whether a polling session should be upgraded to websocket.
    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.config.upgrade = upgrade;
        self
    }

    /// The maximum time to wait for the handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// The maximum time to wait for the probe answer during an upgrade.
    pub fn upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.config.upgrade_timeout = timeout;
        self
    }

    /// Add a query parameter sent with every request.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.push((key.into(), value.into()));
        self
    }

    /// Build the config
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
