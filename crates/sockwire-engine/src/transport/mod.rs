//! Transport abstractions.
//!
//! * [`RawChannel`] is a frame-level bidirectional channel, typically a websocket.
//! * [`MessageSink`] is anything that accepts logical packet groups for a peer.
//!
//! Long-polling requests are handled by the [`EngineIo`](crate::EngineIo) polling methods and by
//! the [`service`](crate::service) dispatcher.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::Stream;
use futures_util::Sink;
use sockwire_engine_core::{Frame, PacketBuf};
use tokio::sync::{mpsc, watch};

use crate::errors::SendError;

pub(crate) mod polling;
pub(crate) mod ws;

#[cfg(feature = "tungstenite")]
#[cfg_attr(docsrs, doc(cfg(feature = "tungstenite")))]
pub mod tungstenite;

/// Number of times a heartbeat packet send is retried before giving up.
pub const HEARTBEAT_SEND_RETRIES: u32 = 3;

/// Delay before the retry number `attempt` (starting at 0): 100ms, 200ms, 400ms...
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 << attempt.min(10))
}

/// Error raised by the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel is closed.
    #[error("transport closed")]
    Closed,
    /// An IO error occurred on the underlying connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A long-polling request was answered with an error status.
    #[error("http error status: {0}")]
    Http(http::StatusCode),
    /// Any other transport error.
    #[error("transport error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// A frame-level full-duplex channel.
///
/// It is implemented for every type that is both a [`Stream`] of frames and a [`Sink`] of frames.
pub trait RawChannel:
    Stream<Item = Result<Frame, TransportError>>
    + Sink<Frame, Error = TransportError>
    + Send
    + Unpin
    + 'static
{
}

impl<T> RawChannel for T where
    T: Stream<Item = Result<Frame, TransportError>>
        + Sink<Frame, Error = TransportError>
        + Send
        + Unpin
        + 'static
{
}

/// Something that accepts packet groups for a remote peer.
///
/// A group is sent atomically: no other packet can be interleaved between its packets.
pub trait MessageSink {
    /// Queue a group of packets.
    fn send_packets(&self, packets: PacketBuf) -> Result<(), SendError>;
}

/// Closed flag shared between the tasks of a connection.
#[derive(Debug)]
pub(crate) struct CloseSignal(watch::Sender<bool>);

impl CloseSignal {
    pub fn new() -> Self {
        Self(watch::Sender::new(false))
    }

    /// Run `f` then mark the connection as closed.
    /// Only the first call runs `f`, returns whether this call closed the connection.
    pub fn close_with(&self, f: impl FnOnce()) -> bool {
        self.0.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            f();
            *closed = true;
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.0.subscribe();
        rx.wait_for(|closed| *closed).await.map(|_| ()).ok();
    }
}

/// One end of an in-memory [`RawChannel`] pair.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Create two connected in-memory channels.
/// Frames sent on one end are received on the other.
pub fn memory_channel() -> (MemoryChannel, MemoryChannel) {
    let (tx1, rx1) = mpsc::unbounded_channel();
    let (tx2, rx2) = mpsc::unbounded_channel();
    let a = MemoryChannel {
        tx: Some(tx1),
        rx: rx2,
    };
    let b = MemoryChannel {
        tx: Some(tx2),
        rx: rx1,
    };
    (a, b)
}

impl Stream for MemoryChannel {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

impl Sink<Frame> for MemoryChannel {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &self.tx {
            Some(tx) if !tx.is_closed() => Poll::Ready(Ok(())),
            _ => Poll::Ready(Err(TransportError::Closed)),
        }
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        self.tx
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.take();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};

    use super::*;

    #[tokio::test]
    async fn memory_channel_pair() {
        let (mut a, mut b) = memory_channel();
        a.send(Frame::Text("4hello".into())).await.unwrap();
        a.send(Frame::Binary(Bytes::from_static(&[1, 2]))).await.unwrap();
        assert_eq!(b.next().await.unwrap().unwrap(), Frame::Text("4hello".into()));
        assert_eq!(
            b.next().await.unwrap().unwrap(),
            Frame::Binary(Bytes::from_static(&[1, 2]))
        );

        a.close().await.unwrap();
        assert!(b.next().await.is_none());
        assert!(matches!(
            a.send(Frame::Text("1".into())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_signal_runs_once() {
        let signal = CloseSignal::new();
        let mut calls = 0;
        assert!(signal.close_with(|| calls += 1));
        assert!(!signal.close_with(|| calls += 1));
        assert_eq!(calls, 1);
        assert!(signal.is_closed());
        signal.closed().await;
    }

    #[test]
    fn retry_delays() {
        assert_eq!(retry_delay(0), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(400));
    }
}
