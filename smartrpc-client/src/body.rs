//! Response bodies.

use crate::error::ClientError;
use crate::medium::Medium;
use crate::translate::ErrorTuple;
use bytes::{Bytes, BytesMut};
use smartrpc_protocol::{Decoder, MessageEvent, ProtocolError};
use std::mem;

/// Where the bytes of a response body come from.
pub enum BodySource {
    /// Read in full before the call returned.
    Buffered(Bytes),
    /// Pulled from the medium on demand.
    Chunked(Decoder),
}

/// A successful response whose body has not been attached to the medium yet.
pub(crate) struct PendingResponse {
    pub args: Vec<Bytes>,
    pub body: BodySource,
}

/// The body of a response.
///
/// Holds the medium mutably, so no other call can start until the body is
/// read to the end, cancelled or dropped. Dropping a streamed body early
/// leaves the medium unusable until it is reset.
pub struct ResponseBody<'a, M: Medium + ?Sized> {
    medium: &'a mut M,
    source: BodySource,
    read_size: usize,
    finished: bool,
    server_error: Option<ErrorTuple>,
}

impl<'a, M: Medium + ?Sized> ResponseBody<'a, M> {
    pub(crate) fn new(medium: &'a mut M, source: BodySource, read_size: usize) -> Self {
        Self {
            medium,
            source,
            read_size,
            finished: false,
            server_error: None,
        }
    }

    /// Whether the whole body was read before the call returned.
    pub fn is_buffered(&self) -> bool {
        matches!(self.source, BodySource::Buffered(_))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the next chunk of the body, or `None` at the end.
    ///
    /// An error reported by the server part-way through the body is
    /// returned as [`ClientError::ErrorFromServer`] once the rest of the
    /// message has been consumed.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let decoder = match &mut self.source {
                BodySource::Buffered(bytes) => {
                    self.finished = true;
                    let bytes = mem::take(bytes);
                    return Ok(if bytes.is_empty() { None } else { Some(bytes) });
                }
                BodySource::Chunked(decoder) => decoder,
            };

            let event = match decoder.next_event() {
                Ok(event) => event,
                Err(e) => return self.fail(e.into()).await,
            };
            match event {
                Some(MessageEvent::BodyChunk(chunk)) => {
                    if chunk.is_empty() || self.server_error.is_some() {
                        continue;
                    }
                    return Ok(Some(chunk));
                }
                Some(MessageEvent::BodyError(args)) => {
                    tracing::debug!("Server reported an error while streaming a body");
                    self.server_error = Some(ErrorTuple::new(args));
                }
                Some(MessageEvent::End) => {
                    self.finish();
                    return match self.server_error.take() {
                        Some(tuple) => Err(ClientError::ErrorFromServer(tuple)),
                        None => Ok(None),
                    };
                }
                Some(MessageEvent::Args { .. }) => {
                    let err = ProtocolError::UnexpectedPart {
                        part: "structure",
                        state: "in body",
                    };
                    return self.fail(err.into()).await;
                }
                None => {
                    let bytes = match self.medium.read_bytes(self.read_size).await {
                        Ok(bytes) if bytes.is_empty() => {
                            let err = ClientError::ConnectionReset(
                                "connection closed while reading response body".to_string(),
                            );
                            return self.fail(err).await;
                        }
                        Ok(bytes) => bytes,
                        Err(e) => return self.fail(e).await,
                    };
                    if let BodySource::Chunked(decoder) = &mut self.source {
                        decoder.extend(&bytes);
                    }
                }
            }
        }
    }

    /// Reads the rest of the body into one buffer.
    pub async fn read_all(mut self) -> Result<Bytes, ClientError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Feeds each remaining chunk to `f`.
    pub async fn for_each_chunk<F>(mut self, mut f: F) -> Result<(), ClientError>
    where
        F: FnMut(Bytes),
    {
        while let Some(chunk) = self.next_chunk().await? {
            f(chunk);
        }
        Ok(())
    }

    /// Discards the rest of the body, leaving the medium ready for the next call.
    pub async fn cancel(mut self) -> Result<(), ClientError> {
        loop {
            match self.next_chunk().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                // The message was consumed; the server error is moot.
                Err(ClientError::ErrorFromServer(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let BodySource::Chunked(decoder) = &mut self.source {
            let unused = decoder.take_unused();
            if !unused.is_empty() {
                tracing::debug!("Discarding {} bytes after end of response", unused.len());
            }
            self.medium.state_mut().end_request();
        }
    }

    async fn fail(&mut self, err: ClientError) -> Result<Option<Bytes>, ClientError> {
        self.finished = true;
        self.medium.disconnect().await;
        Err(err)
    }
}

impl<'a, M: Medium + ?Sized> Drop for ResponseBody<'a, M> {
    fn drop(&mut self) {
        if !self.finished && matches!(self.source, BodySource::Chunked(_)) {
            tracing::error!("Response body dropped before it was fully read");
            self.medium.state_mut().abandon_request();
        }
    }
}
