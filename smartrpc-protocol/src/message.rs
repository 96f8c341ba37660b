//! Request and response message types.

use crate::error::ProtocolError;
use bytes::Bytes;

/// A coalesced byte range requested through a readv body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadvRange {
    pub offset: u64,
    pub length: u64,
}

impl ReadvRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// Body attached to a request that is encoded in one go.
///
/// Streamed request bodies are encoded incrementally with
/// [`Encoder::encode_stream_start`](crate::Encoder::encode_stream_start).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    None,
    Bytes(Bytes),
    Readv(Vec<ReadvRange>),
}

/// A request: verb, argument tuple and optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Bytes,
    pub args: Vec<Bytes>,
    pub body: RequestBody,
}

impl Request {
    pub fn new(method: impl Into<Bytes>, args: Vec<Bytes>) -> Self {
        Self {
            method: method.into(),
            args,
            body: RequestBody::None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }

    pub fn with_readv(mut self, ranges: Vec<ReadvRange>) -> Self {
        self.body = RequestBody::Readv(ranges);
        self
    }

    /// The verb followed by its arguments, as sent on the wire.
    pub fn tuple(&self) -> Vec<Bytes> {
        let mut tuple = Vec::with_capacity(self.args.len() + 1);
        tuple.push(self.method.clone());
        tuple.extend(self.args.iter().cloned());
        tuple
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Body attached to an encoded response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    /// A single contiguous body.
    Bytes(Bytes),
    /// A body streamed as chunks, optionally interrupted by an error tuple.
    Stream {
        chunks: Vec<Bytes>,
        error: Option<Vec<Bytes>>,
    },
}

/// A response: status, argument tuple and optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub args: Vec<Bytes>,
    pub body: Payload,
}

impl Response {
    pub fn success(args: Vec<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Success,
            args,
            body: Payload::None,
        }
    }

    pub fn error(args: Vec<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Error,
            args,
            body: Payload::None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Payload::Bytes(body.into());
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        self.body = Payload::Stream {
            chunks,
            error: None,
        };
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// An event pulled from a [`Decoder`](crate::Decoder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// The argument tuple. For requests, the first element is the verb.
    Args {
        status: ResponseStatus,
        args: Vec<Bytes>,
    },
    /// Some body bytes. Chunk boundaries carry no meaning.
    BodyChunk(Bytes),
    /// The peer aborted a streamed body with an error tuple.
    BodyError(Vec<Bytes>),
    /// End of message.
    End,
}

/// Wire encoding of a boolean field.
pub fn encode_bool(value: bool) -> Bytes {
    Bytes::from_static(if value { b"yes" } else { b"no" })
}

/// Parses a `yes`/`no` boolean field.
pub fn parse_bool(value: &[u8]) -> Result<bool, ProtocolError> {
    match value {
        b"yes" => Ok(true),
        b"no" => Ok(false),
        _ => Err(ProtocolError::BadWireValue {
            value: Bytes::copy_from_slice(value),
            expected: "'yes' or 'no'",
        }),
    }
}

/// Parses a decimal ASCII integer field.
pub fn parse_int(value: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::BadWireValue {
            value: Bytes::copy_from_slice(value),
            expected: "a decimal integer",
        })
}

/// Parses a field where the empty string stands for "no value".
pub fn parse_optional(value: &[u8]) -> Option<Bytes> {
    if value.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(value))
    }
}
