//! Protocol error types.

use bytes::Bytes;
use thiserror::Error;

/// Protocol-level errors that can occur while framing or parsing messages.
///
/// These always indicate a peer or version incompatibility. A well-formed
/// error response from the server is never a `ProtocolError`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected protocol version marker: {0:?}")]
    UnexpectedVersionMarker(Bytes),

    #[error("bad protocol status {0:?}")]
    BadStatus(Bytes),

    #[error("unknown message part type {0:#04x}")]
    InvalidPartType(u8),

    #[error("unexpected {part} part {state}")]
    UnexpectedPart {
        part: &'static str,
        state: &'static str,
    },

    #[error("message part too large: {size} bytes (max {max})")]
    PartTooLarge { size: u32, max: u32 },

    #[error("line too long: more than {max} bytes without a newline")]
    LineTooLong { max: usize },

    #[error("invalid length prefix {0:?}")]
    BadLength(Bytes),

    #[error("body not terminated by 'done': got {0:?}")]
    BadBodyTrailer(Bytes),

    #[error("invalid bencode: {0}")]
    Bencode(String),

    #[error("expected a {expected} structure")]
    BadStructure { expected: &'static str },

    #[error("argument {0:?} contains a tuple separator or newline")]
    InvalidArgument(Bytes),

    #[error("invalid wire value {value:?}: expected {expected}")]
    BadWireValue { value: Bytes, expected: &'static str },

    #[error("protocol version {0} does not support streamed request bodies")]
    StreamingUnsupported(u8),

    #[error("the message is already complete")]
    MessageFinished,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
