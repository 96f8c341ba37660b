//! Encoder and decoder for smart protocol messages.

use crate::bencode::Value;
use crate::error::ProtocolError;
use crate::frame::{
    decode_tuple, encode_body, encode_chunk, encode_prefixed, encode_readv, encode_tuple,
    parse_body_length, parse_chunk_length, take_line, take_prefixed, MessagePart,
    BODY_TRAILER, CHUNKED_BODY_END, CHUNKED_BODY_ERROR, CHUNKED_BODY_START, STATUS_ERROR,
    STATUS_SUCCESS,
};
use crate::message::{MessageEvent, Payload, Request, RequestBody, Response, ResponseStatus};
use crate::version::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Version three message headers.
pub type Headers = BTreeMap<Bytes, Value>;

/// First elements of a version one response tuple that mark it as an error.
///
/// Version one has no status field; errors are recognised by their tag.
pub const V1_ERROR_TAGS: &[&[u8]] = &[
    b"error",
    b"norepository",
    b"NoSuchFile",
    b"FileExists",
    b"DirectoryNotEmpty",
    b"ShortReadvError",
    b"UnicodeEncodeError",
    b"UnicodeDecodeError",
    b"ReadOnlyError",
    b"nobranch",
    b"NoSuchRevision",
    b"nosuchrevision",
    b"LockContention",
    b"UnlockableTransport",
    b"LockFailed",
    b"TokenMismatch",
    b"ReadError",
    b"PermissionDenied",
];

fn encode_headers(headers: &Headers, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    encode_prefixed(&Value::Dict(headers.clone()).to_bytes(), buf)
}

/// Encodes requests and responses for a given protocol version.
pub struct Encoder;

impl Encoder {
    /// Encodes a complete request.
    ///
    /// `headers` are only sent by version three.
    pub fn encode_request(
        version: ProtocolVersion,
        request: &Request,
        headers: &Headers,
    ) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_slice(version.request_marker());
        let body = match &request.body {
            RequestBody::None => None,
            RequestBody::Bytes(bytes) => Some(bytes.clone()),
            RequestBody::Readv(ranges) => Some(encode_readv(ranges)),
        };

        match version {
            ProtocolVersion::One | ProtocolVersion::Two => {
                encode_tuple(&request.tuple(), &mut buf)?;
                if let Some(body) = body {
                    encode_body(&body, &mut buf);
                }
            }
            ProtocolVersion::Three => {
                encode_headers(headers, &mut buf)?;
                MessagePart::Structure(Value::from_args(&request.tuple())).encode(&mut buf)?;
                if let Some(body) = body {
                    MessagePart::Bytes(body).encode(&mut buf)?;
                }
                MessagePart::End.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Encodes the opening of a request whose body will be streamed.
    ///
    /// Follow with [`encode_stream_chunk`](Self::encode_stream_chunk) for
    /// each chunk and [`encode_end`](Self::encode_end).
    pub fn encode_stream_start(
        version: ProtocolVersion,
        method: &Bytes,
        args: &[Bytes],
        headers: &Headers,
    ) -> Result<BytesMut, ProtocolError> {
        if !version.supports_request_streams() {
            return Err(ProtocolError::StreamingUnsupported(version.number()));
        }
        let mut tuple = Vec::with_capacity(args.len() + 1);
        tuple.push(method.clone());
        tuple.extend(args.iter().cloned());

        let mut buf = BytesMut::new();
        buf.put_slice(version.request_marker());
        encode_headers(headers, &mut buf)?;
        MessagePart::Structure(Value::from_args(&tuple)).encode(&mut buf)?;
        Ok(buf)
    }

    /// Encodes one chunk of a streamed version three body.
    pub fn encode_stream_chunk(chunk: Bytes) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(chunk.len() + 5);
        MessagePart::Bytes(chunk).encode(&mut buf)?;
        Ok(buf)
    }

    /// Encodes an error status and tuple that abort a streamed version three body.
    pub fn encode_stream_error(args: &[Bytes]) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        MessagePart::OneByte(STATUS_ERROR).encode(&mut buf)?;
        MessagePart::Structure(Value::from_args(args)).encode(&mut buf)?;
        Ok(buf)
    }

    /// Encodes the end-of-message part.
    pub fn encode_end() -> BytesMut {
        let mut buf = BytesMut::with_capacity(1);
        buf.put_u8(b'e');
        buf
    }

    /// Encodes a complete response.
    pub fn encode_response(
        version: ProtocolVersion,
        response: &Response,
        headers: &Headers,
    ) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_slice(version.response_marker());

        match version {
            ProtocolVersion::One | ProtocolVersion::Two => {
                if version == ProtocolVersion::Two {
                    buf.put_slice(if response.is_success() {
                        b"success\n"
                    } else {
                        b"failed\n"
                    });
                }
                encode_tuple(&response.args, &mut buf)?;
                match &response.body {
                    Payload::None => {}
                    Payload::Bytes(body) => encode_body(body, &mut buf),
                    Payload::Stream { .. } if version == ProtocolVersion::One => {
                        return Err(ProtocolError::StreamingUnsupported(1));
                    }
                    Payload::Stream { chunks, error } => {
                        buf.put_slice(CHUNKED_BODY_START);
                        for chunk in chunks {
                            encode_chunk(chunk, &mut buf);
                        }
                        if let Some(error) = error {
                            // Each error argument is a chunk of its own.
                            buf.put_slice(CHUNKED_BODY_ERROR);
                            for arg in error {
                                encode_chunk(arg, &mut buf);
                            }
                        }
                        buf.put_slice(CHUNKED_BODY_END);
                    }
                }
            }
            ProtocolVersion::Three => {
                encode_headers(headers, &mut buf)?;
                let status = if response.is_success() {
                    STATUS_SUCCESS
                } else {
                    STATUS_ERROR
                };
                MessagePart::OneByte(status).encode(&mut buf)?;
                MessagePart::Structure(Value::from_args(&response.args)).encode(&mut buf)?;
                match &response.body {
                    Payload::None => {}
                    Payload::Bytes(body) => MessagePart::Bytes(body.clone()).encode(&mut buf)?,
                    Payload::Stream { chunks, error } => {
                        for chunk in chunks {
                            MessagePart::Bytes(chunk.clone()).encode(&mut buf)?;
                        }
                        if let Some(error) = error {
                            MessagePart::OneByte(STATUS_ERROR).encode(&mut buf)?;
                            MessagePart::Structure(Value::from_args(error)).encode(&mut buf)?;
                        }
                    }
                }
                MessagePart::End.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Marker,
    Headers,
    Status,
    Tuple(ResponseStatus),
    AwaitBodyDecision,
    BodyStart,
    BodyBytes(usize),
    BodyTrailer,
    ChunkHeader,
    ChunkBytes(usize),
    ErrorChunkHeader,
    ErrorChunkBytes(usize),
    Parts {
        status: Option<ResponseStatus>,
        args_seen: bool,
        error_pending: bool,
    },
    EndPending,
    Done,
}

/// Incremental decoder for one message.
///
/// Bytes are appended with [`extend`](Self::extend) as they arrive and
/// events are pulled with [`next_event`](Self::next_event), which returns
/// `Ok(None)` while more bytes are needed.
pub struct Decoder {
    version: ProtocolVersion,
    direction: Direction,
    expect_body: bool,
    state: State,
    buffer: BytesMut,
    headers: Headers,
    error_args: Vec<Bytes>,
}

impl Decoder {
    /// Creates a decoder for a response.
    ///
    /// Versions one and two do not announce bodies, so the caller states
    /// whether a successful response carries one. Version three ignores it.
    pub fn for_response(version: ProtocolVersion, expect_body: bool) -> Self {
        Self::new(version, Direction::Response, expect_body)
    }

    /// Creates a decoder for a request.
    ///
    /// For versions one and two, call [`expect_body`](Self::expect_body)
    /// after the `Args` event.
    pub fn for_request(version: ProtocolVersion) -> Self {
        Self::new(version, Direction::Request, false)
    }

    fn new(version: ProtocolVersion, direction: Direction, expect_body: bool) -> Self {
        let state = if version == ProtocolVersion::One {
            State::Tuple(ResponseStatus::Success)
        } else {
            State::Marker
        };
        Self {
            version,
            direction,
            expect_body,
            state,
            buffer: BytesMut::with_capacity(8192),
            headers: Headers::new(),
            error_args: Vec::new(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Takes any bytes buffered beyond the end of the message.
    pub fn take_unused(&mut self) -> Bytes {
        if !self.buffer.is_empty() {
            tracing::debug!("{} bytes left over after the message", self.buffer.len());
        }
        self.buffer.split().freeze()
    }

    /// Headers received with a version three message.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Tells a version one or two request decoder whether the verb carries a body.
    pub fn expect_body(&mut self, expect: bool) {
        if self.state == State::AwaitBodyDecision {
            self.state = if expect {
                State::BodyStart
            } else {
                State::EndPending
            };
        }
    }

    /// Attempts to decode the next event from the buffer.
    pub fn next_event(&mut self) -> Result<Option<MessageEvent>, ProtocolError> {
        loop {
            match self.state {
                State::Marker => {
                    let marker = match self.direction {
                        Direction::Request => self.version.request_marker(),
                        Direction::Response => self.version.response_marker(),
                    };
                    let n = self.buffer.len().min(marker.len());
                    if self.buffer[..n] != marker[..n] {
                        tracing::debug!(
                            "Expected {} marker, got {:?}",
                            self.version,
                            String::from_utf8_lossy(&self.buffer[..n])
                        );
                        return Err(ProtocolError::UnexpectedVersionMarker(
                            Bytes::copy_from_slice(&self.buffer[..n]),
                        ));
                    }
                    if n < marker.len() {
                        return Ok(None);
                    }
                    self.buffer.advance(marker.len());
                    self.state = match (self.version, self.direction) {
                        (ProtocolVersion::Three, _) => State::Headers,
                        (_, Direction::Response) => State::Status,
                        _ => State::Tuple(ResponseStatus::Success),
                    };
                }
                State::Headers => {
                    let Some(raw) = take_prefixed(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    match Value::decode(&raw)? {
                        Value::Dict(headers) => self.headers = headers,
                        _ => return Err(ProtocolError::BadStructure { expected: "dict" }),
                    }
                    self.state = State::Parts {
                        status: None,
                        args_seen: false,
                        error_pending: false,
                    };
                }
                State::Status => {
                    let Some(line) = take_line(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    let status = match &line[..] {
                        b"success" => ResponseStatus::Success,
                        b"failed" => ResponseStatus::Error,
                        _ => return Err(ProtocolError::BadStatus(line)),
                    };
                    self.state = State::Tuple(status);
                }
                State::Tuple(status) => {
                    let Some(line) = take_line(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    let args = decode_tuple(&line);
                    let status = if self.version == ProtocolVersion::One
                        && self.direction == Direction::Response
                        && V1_ERROR_TAGS.contains(&&args[0][..])
                    {
                        ResponseStatus::Error
                    } else {
                        status
                    };
                    self.state = match self.direction {
                        Direction::Request => State::AwaitBodyDecision,
                        Direction::Response
                            if self.expect_body && status == ResponseStatus::Success =>
                        {
                            State::BodyStart
                        }
                        Direction::Response => State::EndPending,
                    };
                    return Ok(Some(MessageEvent::Args { status, args }));
                }
                State::AwaitBodyDecision => return Ok(None),
                State::BodyStart => {
                    let Some(line) = take_line(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    if self.version == ProtocolVersion::Two
                        && line[..] == CHUNKED_BODY_START[..CHUNKED_BODY_START.len() - 1]
                    {
                        self.state = State::ChunkHeader;
                    } else {
                        self.state = State::BodyBytes(parse_body_length(&line)?);
                    }
                }
                State::BodyBytes(0) => self.state = State::BodyTrailer,
                State::BodyBytes(remaining) => {
                    let Some(chunk) = self.take_available(remaining) else {
                        return Ok(None);
                    };
                    self.state = State::BodyBytes(remaining - chunk.len());
                    return Ok(Some(MessageEvent::BodyChunk(chunk)));
                }
                State::BodyTrailer => {
                    if self.buffer.len() < BODY_TRAILER.len() {
                        return Ok(None);
                    }
                    let trailer = self.buffer.split_to(BODY_TRAILER.len()).freeze();
                    if trailer[..] != *BODY_TRAILER {
                        return Err(ProtocolError::BadBodyTrailer(trailer));
                    }
                    self.state = State::Done;
                    return Ok(Some(MessageEvent::End));
                }
                State::ChunkHeader => {
                    let Some(line) = take_line(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    if line[..] == CHUNKED_BODY_END[..CHUNKED_BODY_END.len() - 1] {
                        self.state = State::Done;
                        return Ok(Some(MessageEvent::End));
                    } else if line[..] == CHUNKED_BODY_ERROR[..CHUNKED_BODY_ERROR.len() - 1] {
                        self.state = State::ErrorChunkHeader;
                    } else {
                        self.state = State::ChunkBytes(parse_chunk_length(&line)?);
                    }
                }
                State::ChunkBytes(0) => self.state = State::ChunkHeader,
                State::ChunkBytes(remaining) => {
                    let Some(chunk) = self.take_available(remaining) else {
                        return Ok(None);
                    };
                    self.state = State::ChunkBytes(remaining - chunk.len());
                    return Ok(Some(MessageEvent::BodyChunk(chunk)));
                }
                State::ErrorChunkHeader => {
                    let Some(line) = take_line(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    if line[..] == CHUNKED_BODY_END[..CHUNKED_BODY_END.len() - 1] {
                        self.state = State::EndPending;
                        let args = std::mem::take(&mut self.error_args);
                        return Ok(Some(MessageEvent::BodyError(args)));
                    }
                    self.state = State::ErrorChunkBytes(parse_chunk_length(&line)?);
                }
                // One chunk per error argument, until `END`.
                State::ErrorChunkBytes(len) => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    self.error_args.push(self.buffer.split_to(len).freeze());
                    self.state = State::ErrorChunkHeader;
                }
                State::Parts {
                    status,
                    args_seen,
                    error_pending,
                } => {
                    let Some(part) = MessagePart::decode(&mut self.buffer)? else {
                        return Ok(None);
                    };
                    if let Some(event) = self.on_part(part, status, args_seen, error_pending)? {
                        return Ok(Some(event));
                    }
                }
                State::EndPending => {
                    self.state = State::Done;
                    return Ok(Some(MessageEvent::End));
                }
                State::Done => return Err(ProtocolError::MessageFinished),
            }
        }
    }

    fn take_available(&mut self, remaining: usize) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        let n = remaining.min(self.buffer.len());
        Some(self.buffer.split_to(n).freeze())
    }

    fn on_part(
        &mut self,
        part: MessagePart,
        status: Option<ResponseStatus>,
        args_seen: bool,
        error_pending: bool,
    ) -> Result<Option<MessageEvent>, ProtocolError> {
        match part {
            MessagePart::OneByte(b) if !args_seen => {
                if status.is_some() {
                    return Err(unexpected_part("status", "after status"));
                }
                let status = match b {
                    STATUS_SUCCESS => ResponseStatus::Success,
                    STATUS_ERROR => ResponseStatus::Error,
                    other => return Err(ProtocolError::BadStatus(Bytes::from(vec![other]))),
                };
                self.state = State::Parts {
                    status: Some(status),
                    args_seen,
                    error_pending,
                };
                Ok(None)
            }
            MessagePart::OneByte(STATUS_ERROR) if !error_pending => {
                self.state = State::Parts {
                    status,
                    args_seen,
                    error_pending: true,
                };
                Ok(None)
            }
            MessagePart::OneByte(other) => Err(ProtocolError::BadStatus(Bytes::from(vec![other]))),
            MessagePart::Structure(value) if !args_seen => {
                let status = match (self.direction, status) {
                    (_, Some(status)) => status,
                    (Direction::Request, None) => ResponseStatus::Success,
                    (Direction::Response, None) => {
                        return Err(unexpected_part("structure", "before status"));
                    }
                };
                let args = value.into_args()?;
                self.state = State::Parts {
                    status: Some(status),
                    args_seen: true,
                    error_pending: false,
                };
                Ok(Some(MessageEvent::Args { status, args }))
            }
            MessagePart::Structure(value) if error_pending => {
                self.state = State::Parts {
                    status,
                    args_seen,
                    error_pending: false,
                };
                Ok(Some(MessageEvent::BodyError(value.into_args()?)))
            }
            MessagePart::Structure(_) => Err(unexpected_part("structure", "after arguments")),
            MessagePart::Bytes(_) if !args_seen => Err(unexpected_part("body", "before arguments")),
            MessagePart::Bytes(_) if error_pending => {
                Err(unexpected_part("body", "after error status"))
            }
            MessagePart::Bytes(bytes) => Ok(Some(MessageEvent::BodyChunk(bytes))),
            MessagePart::End if !args_seen => Err(unexpected_part("end", "before arguments")),
            MessagePart::End => {
                self.state = State::Done;
                Ok(Some(MessageEvent::End))
            }
        }
    }
}

fn unexpected_part(part: &'static str, state: &'static str) -> ProtocolError {
    ProtocolError::UnexpectedPart { part, state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ReadvRange;

    fn b(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    fn software_headers() -> Headers {
        let mut headers = Headers::new();
        headers.insert(b(b"Software version"), Value::Bytes(b(b"2.6.0")));
        headers
    }

    /// Feeds `data` one byte at a time and collects events, merging body chunks.
    fn decode_all(mut decoder: Decoder, data: &[u8]) -> Vec<MessageEvent> {
        let mut events: Vec<MessageEvent> = Vec::new();
        for byte in data {
            decoder.extend(&[*byte]);
            while let Some(event) = decoder.next_event().unwrap() {
                match (events.last_mut(), event) {
                    (Some(MessageEvent::BodyChunk(prev)), MessageEvent::BodyChunk(more)) => {
                        let mut joined = BytesMut::from(&prev[..]);
                        joined.extend_from_slice(&more);
                        *prev = joined.freeze();
                    }
                    (_, event) => events.push(event),
                }
                if let Some(MessageEvent::Args { .. }) = events.last() {
                    decoder.expect_body(true);
                }
            }
        }
        assert!(decoder.is_finished());
        events
    }

    fn args(status: ResponseStatus, args: &[&'static [u8]]) -> MessageEvent {
        MessageEvent::Args {
            status,
            args: args.iter().map(|a| b(*a)).collect(),
        }
    }

    #[test]
    fn test_v1_request_wire_format() {
        let request = Request::new("Branch.get_parent", vec![b(b"quack/")]);
        let encoded =
            Encoder::encode_request(ProtocolVersion::One, &request, &Headers::new()).unwrap();
        assert_eq!(&encoded[..], b"Branch.get_parent\x01quack/\n");
    }

    #[test]
    fn test_v2_request_with_body_wire_format() {
        let request = Request::new("put", vec![b(b"a")]).with_body("xyz");
        let encoded =
            Encoder::encode_request(ProtocolVersion::Two, &request, &Headers::new()).unwrap();
        assert_eq!(&encoded[..], b"bzr request 2\nput\x01a\n3\nxyzdone\n");
    }

    #[test]
    fn test_v3_request_wire_format() {
        let request = Request::new("Branch.get_parent", vec![b(b"quack/")]);
        let encoded =
            Encoder::encode_request(ProtocolVersion::Three, &request, &software_headers()).unwrap();
        let mut expected = BytesMut::new();
        expected.put_slice(b"bzr message 3 (bzr 1.6)\n");
        let headers = b"d16:Software version5:2.6.0e";
        expected.put_u32(headers.len() as u32);
        expected.put_slice(headers);
        let structure = b"l17:Branch.get_parent6:quack/e";
        expected.put_u8(b's');
        expected.put_u32(structure.len() as u32);
        expected.put_slice(structure);
        expected.put_u8(b'e');
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_request_decoding_all_versions() {
        let request = Request::new("readv", vec![b(b"file")])
            .with_readv(vec![ReadvRange::new(0, 4), ReadvRange::new(10, 2)]);
        for version in ProtocolVersion::NEGOTIATION_ORDER {
            let encoded = Encoder::encode_request(version, &request, &software_headers()).unwrap();
            let events = decode_all(Decoder::for_request(version), &encoded);
            assert_eq!(
                events,
                vec![
                    args(ResponseStatus::Success, &[b"readv", b"file"]),
                    MessageEvent::BodyChunk(b(b"0,4\n10,2")),
                    MessageEvent::End,
                ],
                "version {}",
                version
            );
        }
    }

    #[test]
    fn test_v3_request_decoder_exposes_headers() {
        let request = Request::new("hello", vec![]);
        let encoded =
            Encoder::encode_request(ProtocolVersion::Three, &request, &software_headers()).unwrap();
        let mut decoder = Decoder::for_request(ProtocolVersion::Three);
        decoder.extend(&encoded);
        assert!(matches!(decoder.next_event().unwrap(), Some(MessageEvent::Args { .. })));
        assert_eq!(
            decoder.headers().get(&b(b"Software version")),
            Some(&Value::Bytes(b(b"2.6.0")))
        );
    }

    #[test]
    fn test_streamed_request() {
        let mut wire = Encoder::encode_stream_start(
            ProtocolVersion::Three,
            &b(b"Repository.insert_stream"),
            &[b(b"repo/")],
            &Headers::new(),
        )
        .unwrap();
        wire.extend_from_slice(&Encoder::encode_stream_chunk(b(b"one")).unwrap());
        wire.extend_from_slice(&Encoder::encode_stream_chunk(b(b"two")).unwrap());
        wire.extend_from_slice(&Encoder::encode_end());

        let events = decode_all(Decoder::for_request(ProtocolVersion::Three), &wire);
        assert_eq!(
            events,
            vec![
                args(ResponseStatus::Success, &[b"Repository.insert_stream", b"repo/"]),
                MessageEvent::BodyChunk(b(b"onetwo")),
                MessageEvent::End,
            ]
        );
    }

    #[test]
    fn test_stream_start_rejected_before_v3() {
        for version in [ProtocolVersion::One, ProtocolVersion::Two] {
            let result =
                Encoder::encode_stream_start(version, &b(b"x"), &[], &Headers::new());
            assert!(matches!(result, Err(ProtocolError::StreamingUnsupported(_))));
        }
    }

    #[test]
    fn test_response_decoding_all_versions() {
        let response = Response::success(vec![b(b"ok"), b(b"12")]).with_body("payload");
        for version in ProtocolVersion::NEGOTIATION_ORDER {
            let encoded = Encoder::encode_response(version, &response, &Headers::new()).unwrap();
            let events = decode_all(Decoder::for_response(version, true), &encoded);
            assert_eq!(
                events,
                vec![
                    args(ResponseStatus::Success, &[b"ok", b"12"]),
                    MessageEvent::BodyChunk(b(b"payload")),
                    MessageEvent::End,
                ],
                "version {}",
                version
            );
        }
    }

    #[test]
    fn test_response_without_body_expectation() {
        let response = Response::success(vec![b(b"")]);
        for version in [ProtocolVersion::One, ProtocolVersion::Two] {
            let encoded = Encoder::encode_response(version, &response, &Headers::new()).unwrap();
            let events = decode_all(Decoder::for_response(version, false), &encoded);
            assert_eq!(
                events,
                vec![args(ResponseStatus::Success, &[b""]), MessageEvent::End]
            );
        }
    }

    #[test]
    fn test_v1_error_detected_by_tag() {
        let mut decoder = Decoder::for_response(ProtocolVersion::One, true);
        decoder.extend(b"nobranch\n");
        assert_eq!(
            decoder.next_event().unwrap(),
            Some(args(ResponseStatus::Error, &[b"nobranch"]))
        );
        assert_eq!(decoder.next_event().unwrap(), Some(MessageEvent::End));
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_v2_failed_status() {
        let response = Response::error(vec![b(b"LockContention")]);
        let encoded =
            Encoder::encode_response(ProtocolVersion::Two, &response, &Headers::new()).unwrap();
        assert!(encoded.starts_with(b"bzr response 2\nfailed\n"));
        let events = decode_all(Decoder::for_response(ProtocolVersion::Two, true), &encoded);
        assert_eq!(
            events,
            vec![args(ResponseStatus::Error, &[b"LockContention"]), MessageEvent::End]
        );
    }

    #[test]
    fn test_v2_chunked_body_with_error() {
        let mut response = Response::success(vec![b(b"ok")]);
        response.body = Payload::Stream {
            chunks: vec![b(b"abc"), b(b"defghijklmnopqrstuvwxyz0123")],
            error: Some(vec![b(b"error"), b(b"boom")]),
        };
        let encoded =
            Encoder::encode_response(ProtocolVersion::Two, &response, &Headers::new()).unwrap();
        assert!(encoded.ends_with(b"END\n"));

        let events = decode_all(Decoder::for_response(ProtocolVersion::Two, true), &encoded);
        assert_eq!(
            events,
            vec![
                args(ResponseStatus::Success, &[b"ok"]),
                MessageEvent::BodyChunk(b(b"abcdefghijklmnopqrstuvwxyz0123")),
                MessageEvent::BodyError(vec![b(b"error"), b(b"boom")]),
                MessageEvent::End,
            ]
        );
    }

    #[test]
    fn test_v2_chunked_error_args_are_separate_chunks() {
        // As written by a bzr server: one chunk per error argument after ERR.
        let wire: &[u8] = b"bzr response 2\nsuccess\nok\nchunked\n3\nabcERR\n5\nerror4\nboomEND\n";

        let events = decode_all(Decoder::for_response(ProtocolVersion::Two, true), wire);
        assert_eq!(
            events,
            vec![
                args(ResponseStatus::Success, &[b"ok"]),
                MessageEvent::BodyChunk(b(b"abc")),
                MessageEvent::BodyError(vec![b(b"error"), b(b"boom")]),
                MessageEvent::End,
            ]
        );

        let mut response = Response::success(vec![b(b"ok")]);
        response.body = Payload::Stream {
            chunks: vec![b(b"abc")],
            error: Some(vec![b(b"error"), b(b"boom")]),
        };
        let encoded =
            Encoder::encode_response(ProtocolVersion::Two, &response, &Headers::new()).unwrap();
        assert_eq!(&encoded[..], wire);
    }

    #[test]
    fn test_v3_stream_error_after_chunks() {
        let mut response = Response::success(vec![b(b"ok")]);
        response.body = Payload::Stream {
            chunks: vec![b(b"a")],
            error: Some(vec![b(b"MemoryError")]),
        };
        let encoded =
            Encoder::encode_response(ProtocolVersion::Three, &response, &Headers::new()).unwrap();
        let events = decode_all(Decoder::for_response(ProtocolVersion::Three, true), &encoded);
        assert_eq!(
            events,
            vec![
                args(ResponseStatus::Success, &[b"ok"]),
                MessageEvent::BodyChunk(b(b"a")),
                MessageEvent::BodyError(vec![b(b"MemoryError")]),
                MessageEvent::End,
            ]
        );
    }

    #[test]
    fn test_v1_stream_response_unsupported() {
        let response = Response::success(vec![]).with_chunks(vec![b(b"x")]);
        let result = Encoder::encode_response(ProtocolVersion::One, &response, &Headers::new());
        assert!(matches!(result, Err(ProtocolError::StreamingUnsupported(1))));
    }

    #[test]
    fn test_marker_mismatch_detected_early() {
        // A version one server answering a version three request.
        let mut decoder = Decoder::for_response(ProtocolVersion::Three, false);
        decoder.extend(b"err");
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::UnexpectedVersionMarker(_))
        ));

        // A matching prefix just waits for more bytes.
        let mut decoder = Decoder::for_response(ProtocolVersion::Two, false);
        decoder.extend(b"bzr resp");
        assert!(decoder.next_event().unwrap().is_none());
        decoder.extend(b"onse 3\n");
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::UnexpectedVersionMarker(_))
        ));
    }

    #[test]
    fn test_v2_bad_status() {
        let mut decoder = Decoder::for_response(ProtocolVersion::Two, false);
        decoder.extend(b"bzr response 2\nmaybe\n");
        assert!(matches!(decoder.next_event(), Err(ProtocolError::BadStatus(_))));
    }

    #[test]
    fn test_bad_body_trailer() {
        let mut decoder = Decoder::for_response(ProtocolVersion::One, true);
        decoder.extend(b"ok\n3\nabcnope\n");
        assert!(matches!(decoder.next_event().unwrap(), Some(MessageEvent::Args { .. })));
        assert!(matches!(decoder.next_event().unwrap(), Some(MessageEvent::BodyChunk(_))));
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::BadBodyTrailer(_))
        ));
    }

    #[test]
    fn test_v3_response_requires_status_before_args() {
        let mut wire = BytesMut::new();
        wire.put_slice(MESSAGE_MARKER);
        encode_headers(&Headers::new(), &mut wire).unwrap();
        MessagePart::Structure(Value::from_args(&[b(b"ok")]))
            .encode(&mut wire)
            .unwrap();
        let mut decoder = Decoder::for_response(ProtocolVersion::Three, false);
        decoder.extend(&wire);
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::UnexpectedPart { part: "structure", .. })
        ));
    }

    #[test]
    fn test_v3_body_before_args_rejected() {
        let mut wire = BytesMut::new();
        wire.put_slice(MESSAGE_MARKER);
        encode_headers(&Headers::new(), &mut wire).unwrap();
        MessagePart::OneByte(STATUS_SUCCESS).encode(&mut wire).unwrap();
        MessagePart::Bytes(b(b"x")).encode(&mut wire).unwrap();
        let mut decoder = Decoder::for_response(ProtocolVersion::Three, false);
        decoder.extend(&wire);
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::UnexpectedPart { part: "body", .. })
        ));
    }

    #[test]
    fn test_unused_bytes_after_end() {
        let response = Response::success(vec![b(b"ok")]);
        let mut encoded =
            Encoder::encode_response(ProtocolVersion::Three, &response, &Headers::new()).unwrap();
        encoded.extend_from_slice(b"stale");
        let mut decoder = Decoder::for_response(ProtocolVersion::Three, false);
        decoder.extend(&encoded);
        assert!(matches!(decoder.next_event().unwrap(), Some(MessageEvent::Args { .. })));
        assert_eq!(decoder.next_event().unwrap(), Some(MessageEvent::End));
        assert_eq!(decoder.take_unused(), b(b"stale"));
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::MessageFinished)
        ));
    }

    #[test]
    fn test_decoder_logs_mismatch_and_leftovers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tracing_subscriber::layer::{Context, SubscriberExt};
        use tracing_subscriber::Layer;

        struct DebugCounter(Arc<AtomicUsize>);

        impl<S: tracing::Subscriber> Layer<S> for DebugCounter {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
                if *event.metadata().level() == tracing::Level::DEBUG {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let logged = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(DebugCounter(logged.clone()));
        tracing::subscriber::with_default(subscriber, || {
            let mut decoder = Decoder::for_response(ProtocolVersion::Three, false);
            decoder.extend(b"error\x01");
            assert!(decoder.next_event().is_err());
            assert_eq!(logged.load(Ordering::SeqCst), 1);

            // Nothing left over, nothing logged.
            let mut decoder = Decoder::for_response(ProtocolVersion::One, false);
            decoder.extend(b"ok\n");
            assert!(decoder.next_event().unwrap().is_some());
            assert!(decoder.take_unused().is_empty());
            assert_eq!(logged.load(Ordering::SeqCst), 1);

            let mut decoder = Decoder::for_response(ProtocolVersion::One, false);
            decoder.extend(b"ok\nstale");
            assert!(decoder.next_event().unwrap().is_some());
            assert_eq!(decoder.take_unused(), b(b"stale"));
            assert_eq!(logged.load(Ordering::SeqCst), 2);
        });
    }

    const MESSAGE_MARKER: &[u8] = crate::version::MESSAGE_VERSION_THREE;
}
