//! Long-polling payloads.
//!
//! A long-polling request or response body holds several packets:
//! * with V4, packets are text and are separated by a `\x1e` record separator;
//! * with V3, packets are prefixed by their length. If the client supports binary and a binary
//!   packet is present, the whole payload uses the binary layout, otherwise the string layout.
//!
//! See [`encoder`] and [`decoder`].

use std::collections::VecDeque;

use bytes::Bytes;

use crate::PacketBuf;

pub mod decoder;
pub mod encoder;

pub use decoder::{PayloadError, decode};
pub use encoder::encode;

/// Record separator between V4 packets.
pub const PACKET_SEPARATOR_V4: u8 = b'\x1e';
/// Separator between the length prefix and the packet in a V3 string payload.
pub const STRING_PACKET_SEPARATOR_V3: u8 = b':';
/// Separator between the length digits and the packet in a V3 binary payload.
pub const BINARY_PACKET_SEPARATOR_V3: u8 = 0xff;

/// Content type of text payloads.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";
/// Content type of V3 binary payloads.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// An encoded long-polling payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// The payload body
    pub data: Bytes,
    /// Whether the payload uses the V3 binary layout
    pub has_binary: bool,
}

impl Payload {
    pub(crate) fn new(data: Bytes, has_binary: bool) -> Self {
        Self { data, has_binary }
    }

    /// The content type to send along with this payload.
    pub fn content_type(&self) -> &'static str {
        if self.has_binary {
            BINARY_CONTENT_TYPE
        } else {
            TEXT_CONTENT_TYPE
        }
    }
}

/// A queue of packet groups that an encoder drains.
///
/// Encoders peek at the next group to check it fits in the payload before consuming it,
/// so a group that does not fit stays in the queue for the next payload.
pub trait PacketSource {
    /// Look at the next packet group without consuming it.
    fn peek(&mut self) -> Option<&PacketBuf>;
    /// Consume the next packet group.
    fn pop(&mut self) -> Option<PacketBuf>;
}

impl PacketSource for VecDeque<PacketBuf> {
    fn peek(&mut self) -> Option<&PacketBuf> {
        self.front()
    }

    fn pop(&mut self) -> Option<PacketBuf> {
        self.pop_front()
    }
}
