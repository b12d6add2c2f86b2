//! ## An [`EngineIoHandler`] to get event calls for any engine.io session
//!
//! It is the seam between the engine and the upper layer, the Socket.IO router implements it.
//! It can also be implemented directly to use the engine without Socket.IO.
//!
//! #### Example :
//! ```rust
//! # use bytes::Bytes;
//! # use sockwire_engine::{handler::EngineIoHandler, config::EngineIoConfig, EngineIo};
//! # use sockwire_engine::{DisconnectReason, Session};
//! # use std::sync::Arc;
//! #[derive(Debug)]
//! struct EchoHandler;
//!
//! impl EngineIoHandler for EchoHandler {
//!     type Data = ();
//!
//!     fn on_connect(self: Arc<Self>, session: Arc<Session<()>>) { }
//!     fn on_disconnect(&self, session: Arc<Session<()>>, reason: DisconnectReason) { }
//!     fn on_message(self: &Arc<Self>, msg: String, session: Arc<Session<()>>) {
//!         session.emit(msg).ok();
//!     }
//!     fn on_binary(self: &Arc<Self>, data: Bytes, session: Arc<Session<()>>) {
//!         session.emit_binary(data).ok();
//!     }
//! }
//!
//! let engine = EngineIo::new(Arc::new(EchoHandler), EngineIoConfig::default());
//! ```
use std::sync::Arc;

use bytes::Bytes;

use crate::session::{DisconnectReason, Session};

/// The [`EngineIoHandler`] trait can be implemented on any struct to handle session events.
///
/// A `Data` associated type can be specified to attach a custom state to the sessions.
pub trait EngineIoHandler: std::fmt::Debug + Send + Sync + 'static {
    /// Data associated with the session.
    type Data: Default + Send + Sync + 'static;

    /// Called when a new session is opened.
    fn on_connect(self: Arc<Self>, session: Arc<Session<Self::Data>>);

    /// Called once when a session is closed, with a [`DisconnectReason`].
    fn on_disconnect(&self, session: Arc<Session<Self::Data>>, reason: DisconnectReason);

    /// Called when a message is received from the peer.
    fn on_message(self: &Arc<Self>, msg: String, session: Arc<Session<Self::Data>>);

    /// Called when a binary message is received from the peer.
    fn on_binary(self: &Arc<Self>, data: Bytes, session: Arc<Session<Self::Data>>);
}
