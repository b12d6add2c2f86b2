//! Acknowledgement related types and functions.
//!
//! Here is the main type:
//!
//! - [`AckStream`]: A [`Stream`]/[`Future`] of data received from the peer.
use std::{
    collections::HashMap,
    marker::PhantomData,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{FusedFuture, FusedStream, Future, Stream};
use futures_util::stream::FuturesUnordered;
use serde::de::DeserializeOwned;
use sockwire_core::{Packet, Sid, Value, value::from_args};
use tokio::{
    sync::oneshot::{self, Receiver},
    time::Timeout,
};

use crate::{errors::AckError, errors::SocketError, socket::Socket};

/// The result of an acknowledgement.
pub type AckResult<T> = Result<T, AckError>;

/// The acknowledgements waited for by a socket, keyed by packet id.
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    counter: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<AckResult<Vec<Value>>>>>,
}

impl PendingAcks {
    /// Assign the next ack id to the packet and register it.
    pub fn register(&self, packet: &mut Packet) -> (i64, Receiver<AckResult<Vec<Value>>>) {
        let (tx, rx) = oneshot::channel();
        let ack = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        packet.inner.set_ack_id(ack);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ack, tx);
        (ack, rx)
    }

    /// Complete the ack registered under `ack`, only once.
    pub fn resolve(&self, ack: i64, args: Vec<Value>) {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ack);
        match tx {
            Some(tx) => {
                tx.send(Ok(args)).ok();
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(ack, "received an unknown or expired ack");
            }
        }
    }

    /// Fail an ack. It is used when the packet could not be sent.
    pub fn fail(&self, ack: i64, err: AckError) {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ack);
        if let Some(tx) = tx {
            tx.send(Err(err)).ok();
        }
    }

    /// Drop every pending ack, the waiters get an [`AckError::Socket`].
    pub fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pin_project_lite::pin_project! {
    /// A [`Future`] of an ack response received from the peer with its corresponding [`Sid`].
    /// It is used internally by [`AckStream`].
    pub(crate) struct AckResultWithId {
        id: Sid,
        #[pin]
        result: Timeout<Receiver<AckResult<Vec<Value>>>>,
    }
}

impl AckResultWithId {
    pub fn new(id: Sid, rx: Receiver<AckResult<Vec<Value>>>, timeout: Duration) -> Self {
        Self {
            id,
            result: tokio::time::timeout(timeout, rx),
        }
    }
}

impl Future for AckResultWithId {
    type Output = (Sid, AckResult<Vec<Value>>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let project = self.project();
        match project.result.poll(cx) {
            Poll::Ready(v) => {
                let v = match v {
                    Ok(Ok(Ok(v))) => Ok(v),
                    Ok(Ok(Err(e))) => Err(e),
                    Ok(Err(_)) => Err(AckError::Socket(SocketError::Closed)),
                    Err(_) => Err(AckError::Timeout),
                };
                Poll::Ready((*project.id, v))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pin_project_lite::pin_project! {
    /// A [`Stream`]/[`Future`] of data received from the peer.
    ///
    /// It can be used in two ways:
    /// * As a [`Stream`]: It will yield all the ack responses with their corresponding socket id.
    /// It is useful when broadcasting to multiple sockets and therefore expecting
    /// more than one acknowledgement.
    /// * As a [`Future`]: It will yield the first ack response.
    /// Useful when expecting only one acknowledgement.
    ///
    /// If the peer didn't respond before the timeout, the [`AckStream`] will yield
    /// an [`AckError::Timeout`]. If the data sent by the peer cannot be deserialized as `T`,
    /// an [`AckError::Decode`] will be yielded. A tuple takes one ack argument per field,
    /// any other type takes the first argument.
    #[must_use = "futures and streams do nothing unless you `.await` or poll them"]
    pub struct AckStream<T> {
        #[pin]
        inner: AckInnerStream,
        _marker: PhantomData<fn() -> T>,
    }
}

pin_project_lite::pin_project! {
    #[project = InnerProj]
    pub(crate) enum AckInnerStream {
        Stream {
            #[pin]
            rxs: FuturesUnordered<AckResultWithId>,
        },

        Fut {
            #[pin]
            rx: AckResultWithId,
            polled: bool,
        },
    }
}

// ==== impl AckInnerStream ====

impl AckInnerStream {
    /// Send the packet to every socket and wait for an acknowledgement from each of them.
    pub fn broadcast<'a>(
        packet: Packet,
        sockets: impl Iterator<Item = &'a Arc<Socket>>,
        duration: Duration,
    ) -> Self {
        let rxs = FuturesUnordered::new();
        for socket in sockets {
            let rx = socket.send_with_ack(packet.clone());
            rxs.push(AckResultWithId::new(socket.id, rx, duration));
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("broadcast with ack to {} sockets", rxs.len());
        AckInnerStream::Stream { rxs }
    }

    /// Wait for the acknowledgement of a single peer.
    pub fn send(rx: Receiver<AckResult<Vec<Value>>>, duration: Duration, id: Sid) -> Self {
        AckInnerStream::Fut {
            polled: false,
            rx: AckResultWithId::new(id, rx, duration),
        }
    }
}

impl Stream for AckInnerStream {
    type Item = (Sid, AckResult<Vec<Value>>);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        use InnerProj::*;

        match self.project() {
            Fut { polled, .. } if *polled => Poll::Ready(None),
            Stream { rxs } => rxs.poll_next(cx),
            Fut { rx, polled } => match rx.poll(cx) {
                Poll::Ready(val) => {
                    *polled = true;
                    Poll::Ready(Some(val))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        use AckInnerStream::*;
        match self {
            Stream { rxs, .. } => rxs.size_hint(),
            Fut { polled: true, .. } => (0, Some(0)),
            Fut { .. } => (1, Some(1)),
        }
    }
}

impl FusedStream for AckInnerStream {
    fn is_terminated(&self) -> bool {
        use AckInnerStream::*;
        match self {
            Stream { rxs, .. } => rxs.is_terminated(),
            Fut { polled, .. } => *polled,
        }
    }
}

// ==== impl AckStream ====
impl<T> AckStream<T> {
    pub(crate) fn new(inner: AckInnerStream) -> Self {
        AckStream {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Stream for AckStream<T> {
    type Item = (Sid, AckResult<T>);

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .inner
            .poll_next(cx)
            .map(|v| v.map(|(s, v)| (s, map_ack_response(v))))
    }

    #[inline(always)]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T: DeserializeOwned> FusedStream for AckStream<T> {
    #[inline(always)]
    fn is_terminated(&self) -> bool {
        FusedStream::is_terminated(&self.inner)
    }
}

/// Awaiting a broadcast to zero sockets resolves with [`AckError::Socket`].
impl<T: DeserializeOwned> Future for AckStream<T> {
    type Output = AckResult<T>;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().inner.poll_next(cx) {
            Poll::Ready(Some(v)) => Poll::Ready(map_ack_response(v.1)),
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(Err(AckError::Socket(SocketError::Closed))),
        }
    }
}

impl<T: DeserializeOwned> FusedFuture for AckStream<T> {
    #[inline(always)]
    fn is_terminated(&self) -> bool {
        FusedStream::is_terminated(&self.inner)
    }
}

fn map_ack_response<T: DeserializeOwned>(ack: AckResult<Vec<Value>>) -> AckResult<T> {
    ack.and_then(|args| from_args(args).map_err(AckError::Decode))
}
