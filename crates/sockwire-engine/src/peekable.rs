use sockwire_engine_core::{Packet, PacketBuf, payload::PacketSource};
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};

/// Peekable receiver for the outbound queue of a connection.
///
/// It is a thin wrapper around an [`UnboundedReceiver`] that allows to look at the next packet group
/// without consuming it, so the polling encoder can check that it fits in `max_payload`.
#[derive(Debug)]
pub(crate) struct PeekableReceiver<T> {
    rx: UnboundedReceiver<T>,
    next: Option<T>,
}

impl<T> PeekableReceiver<T> {
    pub fn new(rx: UnboundedReceiver<T>) -> Self {
        Self { rx, next: None }
    }

    pub fn peek(&mut self) -> Option<&T> {
        if self.next.is_none() {
            self.next = self.rx.try_recv().ok();
        }
        self.next.as_ref()
    }

    pub async fn recv(&mut self) -> Option<T> {
        match self.next.take() {
            Some(next) => Some(next),
            None => self.rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        match self.next.take() {
            Some(next) => Ok(next),
            None => self.rx.try_recv(),
        }
    }

    /// Wait until an item is available without consuming it.
    /// Returns false if the channel is closed and empty.
    ///
    /// It is cancel safe: an item received here is kept for the next read.
    pub async fn fill(&mut self) -> bool {
        if self.next.is_none() {
            self.next = self.rx.recv().await;
        }
        self.next.is_some()
    }

    pub fn close(&mut self) {
        self.rx.close()
    }
}

/// A [`PacketSource`] draining a [`PeekableReceiver`] up to the first [`Packet::Close`].
pub(crate) struct Drain<'a> {
    rx: &'a mut PeekableReceiver<PacketBuf>,
    saw_close: bool,
    heartbeat_only: bool,
}

impl<'a> Drain<'a> {
    pub fn new(rx: &'a mut PeekableReceiver<PacketBuf>) -> Self {
        Self {
            rx,
            saw_close: false,
            heartbeat_only: true,
        }
    }

    /// A close packet was drained, nothing will be sent after it.
    pub fn saw_close(&self) -> bool {
        self.saw_close
    }

    /// Only ping and pong packets were drained.
    pub fn heartbeat_only(&self) -> bool {
        self.heartbeat_only
    }
}

impl PacketSource for Drain<'_> {
    fn peek(&mut self) -> Option<&PacketBuf> {
        if self.saw_close {
            return None;
        }
        self.rx.peek()
    }

    fn pop(&mut self) -> Option<PacketBuf> {
        if self.saw_close {
            return None;
        }
        let packets = self.rx.try_recv().ok()?;
        for packet in &packets {
            match packet {
                Packet::Close => self.saw_close = true,
                Packet::Ping | Packet::Pong => (),
                _ => self.heartbeat_only = false,
            }
        }
        Some(packets)
    }
}
