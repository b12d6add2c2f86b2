//! ## Configuration of the Engine.IO server
//!
//! ```rust
//! # use std::time::Duration;
//! # use sockwire_engine::{config::EngineIoConfig, TransportType};
//! let config = EngineIoConfig::builder()
//!     .ping_interval(Duration::from_secs(10))
//!     .ping_timeout(Duration::from_secs(5))
//!     .transports([TransportType::Websocket])
//!     .build();
//! assert!(!config.allowed_transport(TransportType::Polling));
//! ```
use std::time::Duration;

use sockwire_engine_core::{OpenPacket, ProtocolVersion, Sid, TransportType};

/// Engine.IO server configuration.
#[derive(Debug, Clone)]
pub struct EngineIoConfig {
    /// The path to listen for engine.io requests on.
    /// Defaults to "/engine.io".
    pub req_path: String,

    /// The interval at which heartbeats are expected.
    /// Defaults to 25 seconds.
    pub ping_interval: Duration,

    /// The time the peer has to answer a heartbeat.
    /// Defaults to 20 seconds.
    pub ping_timeout: Duration,

    /// The maximum number of bytes of a long-polling payload, in both directions.
    /// Defaults to 100kb.
    pub max_payload: u64,

    /// How long a long-polling read waits for a packet before returning a noop packet.
    /// Defaults to 30 seconds.
    pub poll_timeout: Duration,

    /// How long a websocket upgrade waits for each of the `probe` and `upgrade` packets.
    /// Defaults to 10 seconds.
    pub upgrade_timeout: Duration,

    /// Allowed transports as a bitfield of [`TransportType`] values.
    pub transports: u8,

    /// Allowed protocol versions as a bitfield of `1 << version`.
    pub protocols: u8,
}

impl Default for EngineIoConfig {
    fn default() -> Self {
        Self {
            req_path: "/engine.io".to_string(),
            ping_interval: Duration::from_millis(25000),
            ping_timeout: Duration::from_millis(20000),
            max_payload: 100_000,
            poll_timeout: Duration::from_secs(30),
            upgrade_timeout: Duration::from_secs(10),
            transports: TransportType::Polling as u8 | TransportType::Websocket as u8,
            protocols: protocol_bit(ProtocolVersion::V3) | protocol_bit(ProtocolVersion::V4),
        }
    }
}

const fn protocol_bit(protocol: ProtocolVersion) -> u8 {
    1 << protocol as u8
}

impl EngineIoConfig {
    /// Create a new [`EngineIoConfigBuilder`]
    pub fn builder() -> EngineIoConfigBuilder {
        EngineIoConfigBuilder::new()
    }

    /// Check if a [`TransportType`] is enabled
    #[inline(always)]
    pub fn allowed_transport(&self, transport: TransportType) -> bool {
        self.transports & transport as u8 == transport as u8
    }

    /// Check if a [`ProtocolVersion`] is enabled
    #[inline(always)]
    pub fn allowed_protocol(&self, protocol: ProtocolVersion) -> bool {
        self.protocols & protocol_bit(protocol) != 0
    }

    /// Build the handshake packet of a new session.
    ///
    /// An upgrade to websocket is only advertised to polling sessions when websockets are enabled.
    pub fn open_packet(&self, sid: Sid, transport: TransportType) -> OpenPacket {
        let upgrades = if transport == TransportType::Polling
            && self.allowed_transport(TransportType::Websocket)
        {
            vec![TransportType::Websocket.as_str().to_string()]
        } else {
            vec![]
        };
        OpenPacket {
            sid,
            upgrades,
            ping_interval: self.ping_interval.as_millis() as u64,
            ping_timeout: self.ping_timeout.as_millis() as u64,
            max_payload: self.max_payload,
        }
    }
}

/// Builder for [`EngineIoConfig`]
#[derive(Debug, Default)]
pub struct EngineIoConfigBuilder {
    config: EngineIoConfig,
}

impl EngineIoConfigBuilder {
    /// Create a new builder with the default config
    pub fn new() -> Self {
        Self::default()
    }

    /// The path to listen for engine.io requests on.
    /// Defaults to "/engine.io".
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.config.req_path = req_path.into();
        self
    }

    /// The interval at which heartbeats are expected.
    /// Defaults to 25 seconds.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    /// The time the peer has to answer a heartbeat.
    /// Defaults to 20 seconds.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    /// The maximum number of bytes of a long-polling payload.
    /// Defaults to 100kb.
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    /// How long a long-polling read waits for a packet.
    /// Defaults to 30 seconds.
    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.config.poll_timeout = poll_timeout;
        self
    }

    /// How long an upgrade waits for the client packets.
    /// Defaults to 10 seconds.
    pub fn upgrade_timeout(mut self, upgrade_timeout: Duration) -> Self {
        self.config.upgrade_timeout = upgrade_timeout;
        self
    }

    /// Allowed transports on this server.
    ///
    /// With only [`TransportType::Websocket`], no upgrade is ever advertised.
    pub fn transports<const N: usize>(mut self, transports: [TransportType; N]) -> Self {
        assert!(N > 0, "at least one transport must be allowed");
        self.config.transports = transports.iter().fold(0, |acc, t| acc | *t as u8);
        self
    }

    /// Allowed protocol versions on this server.
    pub fn protocols<const N: usize>(mut self, protocols: [ProtocolVersion; N]) -> Self {
        assert!(N > 0, "at least one protocol version must be allowed");
        self.config.protocols = protocols.iter().fold(0, |acc, p| acc | protocol_bit(*p));
        self
    }

    /// Build the config
    pub fn build(self) -> EngineIoConfig {
        self.config
    }
}
