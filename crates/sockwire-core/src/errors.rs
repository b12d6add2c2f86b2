/// Errors when decoding socket.io packets
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    /// Invalid packet type
    #[error("invalid packet type")]
    InvalidPacketType,

    /// The event name is missing or is not a string
    #[error("invalid event name")]
    InvalidEventName,

    /// The payload has the wrong shape for the packet type
    #[error("invalid data")]
    InvalidData,

    /// Invalid attachment count
    #[error("invalid attachments")]
    InvalidAttachments,

    /// The payload is not valid json
    #[error("invalid json payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// A placeholder could not be resolved
    #[error("attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    /// Received a binary attachment while no binary packet was waiting for it
    #[error("received unexpected binary data")]
    UnexpectedBinaryPacket,

    /// Received a text packet while a binary packet was waiting for attachments
    #[error("received unexpected string data")]
    UnexpectedStringPacket,

    /// Needs more binary data before the packet can be delivered. It is not exactly an error,
    /// it is used for control flow: the decoder returns [`ParseError::NeedsMoreBinaryData`]
    /// until all the attachments of the pending packet were received.
    #[error("needs more binary data before deserialization")]
    NeedsMoreBinaryData,
}

/// Error when resolving attachment placeholders
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    /// A placeholder refers to an attachment that was not received
    #[error("placeholder {num} is out of range, the packet has {len} attachments")]
    OutOfRange {
        /// The index of the placeholder
        num: usize,
        /// The number of attachments
        len: usize,
    },
}
