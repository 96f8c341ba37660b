//! Single request attempts over a medium.
//!
//! An attempt writes one request in a fixed protocol version and reads the
//! response up to its argument tuple. Negotiation and retries are layered
//! on top in [`crate::client`].

use crate::body::{BodySource, PendingResponse};
use crate::error::ClientError;
use crate::hooks::CallHookParams;
use crate::medium::{Medium, MediumInfo, MediumRequest};
use crate::translate::ErrorTuple;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use smartrpc_protocol::frame::encode_readv;
use smartrpc_protocol::{
    Decoder, Encoder, Headers, MessageEvent, ProtocolError, ProtocolVersion, ReadvRange, Request,
    RequestBody, ResponseStatus,
};
use std::io;

/// A call as the caller described it, before it is encoded.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Bytes,
    pub args: Vec<Bytes>,
    pub body: RequestBody,
    pub expect_response_body: bool,
}

impl Call {
    pub fn new(method: impl Into<Bytes>, args: Vec<Bytes>) -> Self {
        Self {
            method: method.into(),
            args,
            body: RequestBody::None,
            expect_response_body: false,
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

    pub fn expecting_body(mut self) -> Self {
        self.expect_response_body = true;
        self
    }

    pub fn method_str(&self) -> String {
        String::from_utf8_lossy(&self.method).into_owned()
    }

    pub(crate) fn request(&self) -> Request {
        Request {
            method: self.method.clone(),
            args: self.args.clone(),
            body: self.body.clone(),
        }
    }

    pub(crate) fn hook_params(&self, medium: MediumInfo) -> CallHookParams {
        let (body, readv_body) = match &self.body {
            RequestBody::None => (None, None),
            RequestBody::Bytes(body) => (Some(body.clone()), None),
            RequestBody::Readv(ranges) => (None, Some(encode_readv(ranges))),
        };
        CallHookParams {
            method: self.method.clone(),
            args: self.args.clone(),
            body,
            readv_body,
            medium,
        }
    }
}

/// How far an attempt got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Nothing was written.
    Open,
    /// Writing the request.
    Send,
    /// Waiting for the response tuple.
    Read,
    /// Consuming a response body after the tuple arrived.
    Body,
}

#[derive(Debug)]
pub(crate) struct AttemptFailure {
    pub phase: Phase,
    pub error: ClientError,
}

impl AttemptFailure {
    fn open(error: impl Into<ClientError>) -> Self {
        Self {
            phase: Phase::Open,
            error: error.into(),
        }
    }

    fn send(error: impl Into<ClientError>) -> Self {
        Self {
            phase: Phase::Send,
            error: error.into(),
        }
    }

    fn read(error: impl Into<ClientError>) -> Self {
        Self {
            phase: Phase::Read,
            error: error.into(),
        }
    }

    fn body(error: impl Into<ClientError>) -> Self {
        Self {
            phase: Phase::Body,
            error: error.into(),
        }
    }
}

/// A completed exchange. Anything that is not a failure of the medium.
pub(crate) enum AttemptOutcome {
    Success(PendingResponse),
    UnknownVerb(String),
    /// The server answered in a different protocol version.
    WrongVersion(ProtocolError),
    ApplicationError(ErrorTuple),
}

pub(crate) type AttemptResult = Result<AttemptOutcome, AttemptFailure>;

/// Sends `call` in `version` and reads the response tuple.
pub(crate) async fn attempt<M: Medium>(
    medium: &mut M,
    version: ProtocolVersion,
    call: &Call,
    headers: &Headers,
    read_size: usize,
) -> AttemptResult {
    let encoded = Encoder::encode_request(version, &call.request(), headers).map_err(AttemptFailure::open)?;
    let mut request = medium.get_request().map_err(AttemptFailure::open)?;
    tracing::debug!(
        "Sending {:?} in protocol {} ({} bytes)",
        call.method_str(),
        version,
        encoded.len()
    );
    request.accept_bytes(&encoded).await.map_err(AttemptFailure::send)?;
    request.finished_writing().await.map_err(AttemptFailure::send)?;

    let decoder = Decoder::for_response(version, call.expect_response_body);
    read_response(request, decoder, &call.method, call.expect_response_body, read_size).await
}

/// Sends a V3 request whose body is produced by `body` and reads the
/// response tuple. The response body is always read lazily.
pub(crate) async fn attempt_stream<M: Medium>(
    medium: &mut M,
    method: &Bytes,
    args: &[Bytes],
    body: &mut BoxStream<'_, io::Result<Bytes>>,
    headers: &Headers,
    read_size: usize,
) -> AttemptResult {
    let version = ProtocolVersion::Three;
    let start = Encoder::encode_stream_start(version, method, args, headers).map_err(AttemptFailure::open)?;
    let mut request = medium.get_request().map_err(AttemptFailure::open)?;
    tracing::debug!(
        "Sending streamed {:?} in protocol {}",
        String::from_utf8_lossy(method),
        version
    );
    request.accept_bytes(&start).await.map_err(AttemptFailure::send)?;

    while let Some(item) = body.next().await {
        match item {
            Ok(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                let part = Encoder::encode_stream_chunk(chunk).map_err(AttemptFailure::send)?;
                request.accept_bytes(&part).await.map_err(AttemptFailure::send)?;
            }
            Err(err) => {
                tracing::debug!("Request body stream failed: {}", err);
                abort_stream(&mut request, &err).await;
                request.finished_reading();
                return Err(AttemptFailure::send(ClientError::BodyStream(err)));
            }
        }
    }

    request
        .accept_bytes(&Encoder::encode_end())
        .await
        .map_err(AttemptFailure::send)?;
    request.finished_writing().await.map_err(AttemptFailure::send)?;

    let decoder = Decoder::for_response(version, true);
    read_response(request, decoder, method, true, read_size).await
}

/// Tells the server the body stream broke. Best effort: the medium is
/// reset afterwards whatever happens here.
async fn abort_stream<M: Medium>(request: &mut MediumRequest<'_, M>, err: &io::Error) {
    let error_args = [Bytes::from_static(b"error"), Bytes::from(err.to_string())];
    let mut tail = match Encoder::encode_stream_error(&error_args) {
        Ok(tail) => tail,
        Err(_) => BytesMut::new(),
    };
    tail.extend_from_slice(&Encoder::encode_end());
    if request.accept_bytes(&tail).await.is_ok() {
        let _ = request.finished_writing().await;
    }
}

async fn read_response<M: Medium>(
    mut request: MediumRequest<'_, M>,
    mut decoder: Decoder,
    method: &[u8],
    expect_body: bool,
    read_size: usize,
) -> AttemptResult {
    let version = decoder.version();
    let (status, args) = loop {
        match decoder.next_event() {
            Ok(Some(MessageEvent::Args { status, args })) => break (status, args),
            Ok(Some(_)) => {
                let err = ProtocolError::UnexpectedPart {
                    part: "body",
                    state: "before arguments",
                };
                return Err(AttemptFailure::read(err));
            }
            Ok(None) => {
                let bytes = request.read_bytes(read_size).await.map_err(AttemptFailure::read)?;
                decoder.extend(&bytes);
            }
            Err(err @ ProtocolError::UnexpectedVersionMarker(_)) => {
                tracing::debug!("Response is not protocol {}: {}", version, err);
                request.finished_reading();
                return Ok(AttemptOutcome::WrongVersion(err));
            }
            Err(err) => return Err(AttemptFailure::read(err)),
        }
    };
    tracing::debug!("Response tuple {:?} ({:?})", args, status);

    if is_unknown_verb(version, status, &args, method) {
        drain(&mut request, &mut decoder, read_size).await?;
        request.finished_reading();
        return Ok(AttemptOutcome::UnknownVerb(
            String::from_utf8_lossy(method).into_owned(),
        ));
    }

    if status == ResponseStatus::Error {
        drain(&mut request, &mut decoder, read_size).await?;
        request.finished_reading();
        return Ok(AttemptOutcome::ApplicationError(ErrorTuple::new(args)));
    }

    let body = if !expect_body {
        drain(&mut request, &mut decoder, read_size).await?;
        request.finished_reading();
        BodySource::Buffered(Bytes::new())
    } else if version == ProtocolVersion::One {
        let body = collect(&mut request, &mut decoder, read_size).await?;
        request.finished_reading();
        BodySource::Buffered(body)
    } else {
        request.detach();
        BodySource::Chunked(decoder)
    };
    Ok(AttemptOutcome::Success(PendingResponse { args, body }))
}

/// Whether the server rejected `method` as unknown.
pub(crate) fn is_unknown_verb(
    version: ProtocolVersion,
    status: ResponseStatus,
    args: &[Bytes],
    method: &[u8],
) -> bool {
    match version {
        ProtocolVersion::Three => {
            status == ResponseStatus::Error && args.first().map_or(false, |tag| tag == "UnknownMethod")
        }
        ProtocolVersion::One | ProtocolVersion::Two => {
            if args.len() != 2 || args[0] != "error" {
                return false;
            }
            let verb = String::from_utf8_lossy(method);
            args[1] == format!("Generic bzr smart protocol error: bad request '{}'", verb)
                || args[1] == format!("Generic bzr smart protocol error: bad request u'{}'", verb)
        }
    }
}

/// Reads and discards the rest of the message.
async fn drain<M: Medium>(
    request: &mut MediumRequest<'_, M>,
    decoder: &mut Decoder,
    read_size: usize,
) -> Result<(), AttemptFailure> {
    loop {
        match decoder.next_event().map_err(AttemptFailure::body)? {
            Some(MessageEvent::End) => return Ok(()),
            Some(_) => {}
            None => {
                let bytes = request.read_bytes(read_size).await.map_err(AttemptFailure::body)?;
                decoder.extend(&bytes);
            }
        }
    }
}

/// Reads the rest of a body into memory.
async fn collect<M: Medium>(
    request: &mut MediumRequest<'_, M>,
    decoder: &mut Decoder,
    read_size: usize,
) -> Result<Bytes, AttemptFailure> {
    let mut body = BytesMut::new();
    loop {
        match decoder.next_event().map_err(AttemptFailure::body)? {
            Some(MessageEvent::BodyChunk(chunk)) => body.extend_from_slice(&chunk),
            Some(MessageEvent::BodyError(args)) => {
                drain(request, decoder, read_size).await?;
                return Err(AttemptFailure::body(ClientError::ErrorFromServer(ErrorTuple::new(args))));
            }
            Some(MessageEvent::End) => return Ok(body.freeze()),
            Some(MessageEvent::Args { .. }) => {
                let err = ProtocolError::UnexpectedPart {
                    part: "structure",
                    state: "in body",
                };
                return Err(AttemptFailure::body(err));
            }
            None => {
                let bytes = request.read_bytes(read_size).await.map_err(AttemptFailure::body)?;
                decoder.extend(&bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_unknown_verb_v3() {
        let args = vec![b("UnknownMethod"), b("Foo.bar")];
        assert!(is_unknown_verb(
            ProtocolVersion::Three,
            ResponseStatus::Error,
            &args,
            b"Foo.bar"
        ));
        assert!(!is_unknown_verb(
            ProtocolVersion::Three,
            ResponseStatus::Success,
            &args,
            b"Foo.bar"
        ));
    }

    #[test]
    fn test_unknown_verb_v1_and_v2() {
        for version in [ProtocolVersion::One, ProtocolVersion::Two] {
            for text in [
                "Generic bzr smart protocol error: bad request 'Foo.bar'",
                "Generic bzr smart protocol error: bad request u'Foo.bar'",
            ] {
                let args = vec![b("error"), b(text)];
                assert!(is_unknown_verb(version, ResponseStatus::Error, &args, b"Foo.bar"));
            }
            let args = vec![
                b("error"),
                b("Generic bzr smart protocol error: bad request 'Other'"),
            ];
            assert!(!is_unknown_verb(version, ResponseStatus::Error, &args, b"Foo.bar"));
        }
    }

    #[test]
    fn test_hook_params_carry_encoded_readv() {
        let call = Call::new("readv", vec![b("file")])
            .with_readv(vec![ReadvRange::new(0, 10), ReadvRange::new(100, 5)]);
        let params = call.hook_params(MediumInfo {
            kind: crate::medium::MediumKind::Pipe,
            base: "bzr://h/".to_string(),
            protocol_version: None,
        });
        assert_eq!(params.readv_body.as_deref(), Some(&b"0,10\n100,5"[..]));
        assert!(params.body.is_none());
    }
}
