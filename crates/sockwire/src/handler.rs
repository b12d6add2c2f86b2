//! Functions and types used to handle incoming connections and messages.
//!
//! There are four kinds of handlers, all plain closures:
//! * connect handlers, registered with [`SocketIo::ns`](crate::SocketIo::ns), called with the
//!   new socket and the auth payload of the connect packet.
//! * connect middlewares, registered with [`Namespace::use_middleware`](crate::ns::Namespace::use_middleware),
//!   called before the connect handlers. An error rejects the connection.
//! * message handlers, registered with [`Socket::on`](crate::socket::Socket::on) and friends,
//!   called with a [`Message`].
//! * disconnect handlers, registered with [`Socket::on_disconnect`](crate::socket::Socket::on_disconnect).
//!
//! Handlers are called synchronously, in registration order, on the task that received the packet.
//! A panicking handler is logged and does not affect the other handlers.
use std::{
    any::Any,
    borrow::Cow,
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use sockwire_core::{
    Packet, Value,
    value::{self, from_args, to_args},
};

use crate::{
    errors::{SendError, SocketError},
    socket::DisconnectReason,
};

pub(crate) type BoxedConnectHandler<S> = Arc<dyn Fn(S, Option<Value>) + Send + Sync>;
pub(crate) type BoxedMiddleware<S> =
    Arc<dyn Fn(&S, Option<&Value>) -> Result<(), String> + Send + Sync>;
pub(crate) type BoxedMessageHandler<S> = Arc<dyn Fn(S, Message) + Send + Sync>;
pub(crate) type BoxedAnyHandler<S> = Arc<dyn Fn(S, &Message) + Send + Sync>;
pub(crate) type BoxedDisconnectHandler<S> = Box<dyn FnOnce(S, DisconnectReason) + Send>;

/// Something able to send packets on a namespace, a server socket or a client.
pub(crate) trait PacketSender: Send + Sync + 'static {
    fn send_packet(&self, packet: Packet) -> Result<(), SocketError>;
    fn path(&self) -> &str;
}

/// An event received from the peer.
#[derive(Debug)]
pub struct Message {
    /// The event name
    pub event: String,
    /// The event arguments
    pub args: Vec<Value>,
    /// Set when the peer expects an acknowledgement.
    pub ack: Option<AckSender>,
}

impl Message {
    /// Deserialize the arguments.
    ///
    /// A tuple takes one argument per field, any other type takes the first argument.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, value::Error> {
        from_args(self.args.clone())
    }
}

/// Replies to an event with an acknowledgement.
///
/// It is consumed when the acknowledgement is sent, so a peer receives at most one.
pub struct AckSender {
    sender: Arc<dyn PacketSender>,
    ack_id: i64,
}

impl AckSender {
    pub(crate) fn new(sender: Arc<dyn PacketSender>, ack_id: i64) -> Self {
        Self { sender, ack_id }
    }

    /// The id of the event to acknowledge
    pub fn ack_id(&self) -> i64 {
        self.ack_id
    }

    /// Send the acknowledgement. A tuple is sent as several arguments, `()` as none.
    pub fn send<T: ?Sized + Serialize>(self, data: &T) -> Result<(), SendError> {
        let args = to_args(data)?;
        let packet = Packet::ack(self.sender.path(), args, self.ack_id);
        self.sender.send_packet(packet)?;
        Ok(())
    }
}

impl fmt::Debug for AckSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckSender")
            .field("ns", &self.sender.path())
            .field("ack_id", &self.ack_id)
            .finish()
    }
}

struct EventHandler<S> {
    handler: BoxedMessageHandler<S>,
    once: bool,
}

/// Event and disconnect handlers of a socket, `S` is the handle given to the handlers.
pub(crate) struct EventHandlers<S> {
    events: RwLock<HashMap<Cow<'static, str>, EventHandler<S>>>,
    any: RwLock<Vec<BoxedAnyHandler<S>>>,
    disconnect: Mutex<Vec<BoxedDisconnectHandler<S>>>,
}

impl<S> Default for EventHandlers<S> {
    fn default() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            any: RwLock::new(Vec::new()),
            disconnect: Mutex::new(Vec::new()),
        }
    }
}

impl<S: Clone> EventHandlers<S> {
    /// Set the handler of an event, replacing the previous one.
    pub fn on(&self, event: Cow<'static, str>, handler: BoxedMessageHandler<S>, once: bool) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event, EventHandler { handler, once });
    }

    /// Remove the handler of an event, returns true if there was one.
    pub fn off(&self, event: &str) -> bool {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event)
            .is_some()
    }

    pub fn on_any(&self, handler: BoxedAnyHandler<S>) {
        self.any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn on_disconnect(&self, handler: BoxedDisconnectHandler<S>) {
        self.disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Call the catch-all handlers then the handler of the event.
    /// A "once" handler is removed before being called.
    pub fn dispatch(&self, socket: S, msg: Message) {
        let any = self
            .any
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in any {
            let socket = socket.clone();
            isolate("catch-all", || handler(socket, &msg));
        }

        let handler = {
            let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
            match events.get(msg.event.as_str()) {
                Some(entry) if entry.once => events.remove(msg.event.as_str()).map(|e| e.handler),
                Some(entry) => Some(entry.handler.clone()),
                None => None,
            }
        };
        match handler {
            Some(handler) => {
                isolate("message", || handler(socket, msg));
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(event = ?msg.event, "no handler for event");
            }
        }
    }

    /// Call and remove every disconnect handler.
    pub fn disconnect(&self, socket: S, reason: DisconnectReason) {
        let handlers =
            std::mem::take(&mut *self.disconnect.lock().unwrap_or_else(PoisonError::into_inner));
        for handler in handlers {
            let socket = socket.clone();
            isolate("disconnect", || handler(socket, reason));
        }
    }
}

/// Run a user callback, a panic is caught and logged.
/// Returns the panic message if it panicked.
pub(crate) fn isolate(_kind: &'static str, f: impl FnOnce()) -> Option<String> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            #[cfg(feature = "tracing")]
            tracing::error!(kind = _kind, "handler panicked: {msg}");
            Some(msg)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn msg(event: &str) -> Message {
        Message {
            event: event.to_string(),
            args: vec![Value::from("hi")],
            ack: None,
        }
    }

    #[test]
    fn catch_all_then_exact_handler() {
        let handlers = EventHandlers::<()>::default();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        handlers.on(
            "chat".into(),
            Arc::new(move |_: (), msg: Message| c.lock().unwrap().push(format!("on:{}", msg.event))),
            false,
        );
        let c = calls.clone();
        handlers.on_any(Arc::new(move |_: (), msg: &Message| {
            c.lock().unwrap().push(format!("any:{}", msg.event))
        }));

        handlers.dispatch((), msg("chat"));
        handlers.dispatch((), msg("other"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["any:chat", "on:chat", "any:other"]
        );
    }

    #[test]
    fn once_handler_is_removed() {
        let handlers = EventHandlers::<()>::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        handlers.on(
            "ev".into(),
            Arc::new(move |_: (), _: Message| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        handlers.dispatch((), msg("ev"));
        handlers.dispatch((), msg("ev"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handlers.off("ev"));
    }

    #[test]
    fn panics_are_isolated() {
        let handlers = EventHandlers::<()>::default();
        let count = Arc::new(AtomicUsize::new(0));
        handlers.on_disconnect(Box::new(|_: (), _: DisconnectReason| panic!("boom")));
        let c = count.clone();
        handlers.on_disconnect(Box::new(move |_: (), reason: DisconnectReason| {
            assert_eq!(reason, DisconnectReason::ClientNSDisconnect);
            c.fetch_add(1, Ordering::SeqCst);
        }));
        handlers.disconnect((), DisconnectReason::ClientNSDisconnect);
        handlers.disconnect((), DisconnectReason::ClientNSDisconnect);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(isolate("test", || panic!("boom")).as_deref(), Some("boom"));
        assert_eq!(isolate("test", || ()), None);
    }

    #[test]
    fn message_data() {
        let msg = Message {
            event: "ev".into(),
            args: vec![Value::from("a"), Value::from(1u64)],
            ack: None,
        };
        assert_eq!(msg.data::<String>().unwrap(), "a");
        assert_eq!(msg.data::<(String, u8)>().unwrap(), ("a".to_string(), 1));
        assert!(msg.data::<u8>().is_err());
    }
}
