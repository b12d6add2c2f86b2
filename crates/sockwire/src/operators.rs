//! [`BroadcastOperators`] select a group of sockets of a namespace and apply an
//! operation to all of them.
//!
//! They are obtained from a [`Socket`](crate::socket::Socket) or from [`SocketIo`](crate::SocketIo):
//! * From a socket, an operator without any room targets the socket itself and
//!   [`to`](BroadcastOperators::to), [`except`](BroadcastOperators::except) and
//!   [`broadcast`](BroadcastOperators::broadcast) exclude the socket.
//! * From the server, an operator without any room targets every socket of the namespace.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use sockwire_core::{Packet, ProtocolVersion, Sid, parser::encode, value::to_args};

use crate::{
    ack::{AckInnerStream, AckStream},
    errors::{BroadcastError, DisconnectError, SendError, SocketError},
    ns::Namespace,
    rooms::{BroadcastOptions, RoomParam},
    socket::SocketRef,
};

/// Chainable operators to select sockets and broadcast to them.
#[derive(Debug, Clone)]
#[must_use = "operators do nothing until an operation is called"]
pub struct BroadcastOperators {
    ns: Arc<Namespace>,
    opts: BroadcastOptions,
    timeout: Option<Duration>,
}

impl BroadcastOperators {
    pub(crate) fn new(ns: Arc<Namespace>) -> Self {
        Self {
            ns,
            opts: BroadcastOptions::default(),
            timeout: None,
        }
    }

    pub(crate) fn from_sock(ns: Arc<Namespace>, sid: Sid) -> Self {
        Self {
            ns,
            opts: BroadcastOptions {
                sid: Some(sid),
                ..Default::default()
            },
            timeout: None,
        }
    }

    /// Select all the sockets in the given rooms, except the current socket.
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter());
        self.opts.broadcast = true;
        self
    }

    /// Select all the sockets in the given rooms, the current socket included.
    pub fn within(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter());
        self
    }

    /// Remove the sockets in the given rooms from the selection, and the current socket.
    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.opts.except.extend(rooms.into_room_iter());
        self.opts.broadcast = true;
        self
    }

    /// Select all the sockets of the namespace except the current socket.
    pub fn broadcast(mut self) -> Self {
        self.opts.broadcast = true;
        self
    }

    /// Set a custom timeout for [`emit_with_ack`](BroadcastOperators::emit_with_ack).
    /// The ack timeout of the server is used otherwise.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Emit an event to every selected socket.
    ///
    /// The packet is encoded once per protocol version. Every socket is tried,
    /// the failures are returned together.
    ///
    /// # Example
    /// ```
    /// # use sockwire::{SocketIo, socket::SocketRef, handler::Message};
    /// let (_engine, io) = SocketIo::new();
    /// io.ns("/", |socket: SocketRef, _auth| {
    ///     socket.on("chat", |socket: SocketRef, msg: Message| {
    ///         if let Ok(text) = msg.data::<String>() {
    ///             socket.to("room1").emit("chat", &text).ok();
    ///         }
    ///     });
    /// });
    /// ```
    pub fn emit<T: ?Sized + Serialize>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<(), BroadcastError> {
        let args = to_args(data)?;
        let packet = Packet::event(self.ns.path(), event.as_ref(), args);
        let sockets = self.get_sockets();
        #[cfg(feature = "tracing")]
        tracing::debug!(ns = self.ns.path(), "broadcasting to {} sockets", sockets.len());

        let mut v3: Option<(String, Vec<Bytes>)> = None;
        let mut v4: Option<(String, Vec<Bytes>)> = None;
        let errors: Vec<SocketError> = sockets
            .iter()
            .filter_map(|socket| {
                let protocol = socket.protocol();
                let slot = match protocol {
                    ProtocolVersion::V3 => &mut v3,
                    ProtocolVersion::V4 => &mut v4,
                };
                let (msg, bins) = slot.get_or_insert_with(|| encode(packet.clone(), protocol));
                socket.send_raw(msg.clone(), bins.clone()).err()
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    /// Emit an event to every selected socket and wait for their acknowledgements.
    ///
    /// The [`AckStream`] yields the response of each socket with its id.
    /// Awaited as a future it resolves with the first response.
    pub fn emit_with_ack<T: ?Sized + Serialize, V: DeserializeOwned>(
        &self,
        event: impl AsRef<str>,
        data: &T,
    ) -> Result<AckStream<V>, SendError> {
        let args = to_args(data)?;
        let packet = Packet::event(self.ns.path(), event.as_ref(), args);
        let timeout = self.timeout.unwrap_or_else(|| self.ns.ack_timeout());
        let sockets = self.get_sockets();
        let inner = AckInnerStream::broadcast(packet, sockets.iter(), timeout);
        Ok(AckStream::new(inner))
    }

    /// Get the selected sockets.
    pub fn sockets(&self) -> Vec<SocketRef> {
        self.get_sockets()
    }

    /// Make the selected sockets join the given rooms.
    pub fn join(&self, rooms: impl RoomParam) {
        let rooms: Vec<_> = rooms.into_room_iter().collect();
        for socket in self.get_sockets() {
            self.ns.rooms.add_all(socket.id, rooms.clone());
        }
    }

    /// Make the selected sockets leave the given rooms.
    pub fn leave(&self, rooms: impl RoomParam) {
        let rooms: Vec<_> = rooms.into_room_iter().collect();
        for socket in self.get_sockets() {
            self.ns.rooms.del(socket.id, rooms.clone());
        }
    }

    /// Disconnect the selected sockets from the namespace.
    pub fn disconnect(&self) -> Result<(), Vec<DisconnectError>> {
        let errors: Vec<_> = self
            .get_sockets()
            .into_iter()
            .filter_map(|socket| socket.disconnect().err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// A snapshot of the connected sockets matching the options.
    fn get_sockets(&self) -> Vec<SocketRef> {
        self.ns
            .rooms
            .apply_opts(&self.opts, || self.ns.socket_ids())
            .into_iter()
            .filter_map(|sid| self.ns.get_socket(sid))
            .filter(|socket| socket.connected())
            .collect()
    }
}
