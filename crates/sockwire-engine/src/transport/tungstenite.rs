//! [`RawChannel`](super::RawChannel) adapter for [`tokio_tungstenite`] websockets.
//!
//! Websocket control frames (ping, pong) are handled by tungstenite and are not forwarded,
//! a close frame ends the stream.
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_core::Stream;
use futures_util::Sink;
use sockwire_engine_core::Frame;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{self, Message, Utf8Bytes},
};

use super::TransportError;

/// A [`WebSocketStream`] seen as a stream and a sink of engine.io [`Frame`]s.
#[derive(Debug)]
pub struct WsChannel<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsChannel<S> {
    /// Wrap an established websocket connection
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }

    /// Get back the websocket connection
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

impl<S> From<WebSocketStream<S>> for WsChannel<S> {
    fn from(inner: WebSocketStream<S>) -> Self {
        Self::new(inner)
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            tungstenite::Error::Io(err) => TransportError::Io(err),
            err => TransportError::Other(Box::new(err)),
        }
    }
}

impl<S> Stream for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let frame = match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                None | Some(Ok(Message::Close(_))) => return Poll::Ready(None),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(Message::Text(text))) => Ok(Frame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => Ok(Frame::Binary(data)),
                Some(Ok(_)) => continue,
            };
            return Poll::Ready(Some(frame));
        }
    }
}

impl<S> Sink<Frame> for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(Utf8Bytes::from(text)),
            Frame::Binary(data) => Message::Binary(data),
        };
        Pin::new(&mut self.inner).start_send(msg).map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    #[tokio::test]
    async fn frames_over_a_websocket() {
        let (a, b) = tokio::io::duplex(1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let mut server = WsChannel::new(server);
        let mut client = WsChannel::from(client);

        client.send(Frame::Text("4hello".into())).await.unwrap();
        client
            .send(Frame::Binary(vec![1, 2, 3].into()))
            .await
            .unwrap();
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Frame::Text("4hello".into())
        );
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Frame::Binary(vec![1, 2, 3].into())
        );

        client.close().await.unwrap();
        assert!(server.next().await.is_none());
    }
}
