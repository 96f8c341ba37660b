//! The medium a smart client talks over.
//!
//! A medium owns one physical channel to a server (a socket, an SSH pipe or
//! an HTTP POST exchange) and the facts learned about that server. Requests
//! are opened one at a time with [`Medium::get_request`].

use crate::error::ClientError;
use crate::url::{unescape, SmartUrl};
use async_trait::async_trait;
use bytes::Bytes;
use smartrpc_protocol::{ProtocolVersion, RemoteVersion};
use std::fmt;

/// Kind of physical channel behind a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumKind {
    Tcp,
    Ssh,
    Http,
    /// An already-connected byte stream, such as an in-process pipe.
    Pipe,
}

impl MediumKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediumKind::Tcp => "tcp",
            MediumKind::Ssh => "ssh",
            MediumKind::Http => "http",
            MediumKind::Pipe => "pipe",
        }
    }
}

impl fmt::Display for MediumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive snapshot of a medium, handed to call hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumInfo {
    pub kind: MediumKind,
    pub base: String,
    pub protocol_version: Option<ProtocolVersion>,
}

/// What a medium has learned about its server and the request in flight.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    /// Protocol version confirmed by a well-formed response.
    pub protocol_version: Option<ProtocolVersion>,
    remote_is_before: Option<RemoteVersion>,
    request_active: bool,
    abandoned: bool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tightest "remote is older than" bound recorded so far.
    pub fn remote_is_before(&self) -> Option<RemoteVersion> {
        self.remote_is_before
    }

    /// Whether the remote is known to be older than `version`.
    pub fn is_remote_before(&self, version: RemoteVersion) -> bool {
        self.remote_is_before.map_or(false, |bound| version >= bound)
    }

    /// Records that the remote is older than `version`.
    ///
    /// The bound only ever tightens. A looser bound is ignored with a
    /// diagnostic and `false` is returned.
    pub fn remember_remote_is_before(&mut self, version: RemoteVersion) -> bool {
        if let Some(bound) = self.remote_is_before {
            if version > bound {
                tracing::warn!(
                    "Not loosening remote version bound from before {} to before {}",
                    bound,
                    version
                );
                return false;
            }
        }
        self.remote_is_before = Some(version);
        true
    }

    pub fn is_request_active(&self) -> bool {
        self.request_active
    }

    /// Whether a response was dropped part-way through.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub(crate) fn begin_request(&mut self) -> Result<(), ClientError> {
        if self.abandoned {
            return Err(ClientError::BodyNotDrained);
        }
        if self.request_active {
            return Err(ClientError::RequestInProgress);
        }
        self.request_active = true;
        Ok(())
    }

    pub(crate) fn end_request(&mut self) {
        self.request_active = false;
    }

    pub(crate) fn abandon_request(&mut self) {
        self.request_active = false;
        self.abandoned = true;
    }

    /// Forgets the request in flight after the connection was closed.
    pub(crate) fn clear_request(&mut self) {
        self.request_active = false;
        self.abandoned = false;
    }
}

/// A channel to a smart server.
///
/// Implementations connect lazily on the first write. `read_bytes`
/// returns an empty buffer when the server closed the connection.
#[async_trait]
pub trait Medium: Send {
    fn kind(&self) -> MediumKind;

    /// The URL this medium was opened for.
    fn base(&self) -> &SmartUrl;

    fn state(&self) -> &ConnectionState;

    fn state_mut(&mut self) -> &mut ConnectionState;

    fn is_connected(&self) -> bool;

    /// Writes request bytes, connecting first if needed.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError>;

    /// Marks the end of the request bytes.
    async fn flush_request(&mut self) -> Result<(), ClientError>;

    /// Reads up to `max` response bytes.
    async fn read_bytes(&mut self, max: usize) -> Result<Bytes, ClientError>;

    /// Closes the physical connection. Buffered data is discarded.
    async fn close(&mut self);

    /// Closes the connection; the next request reconnects.
    async fn disconnect(&mut self) {
        if self.is_connected() {
            tracing::debug!("Disconnecting {} medium for {}", self.kind(), self.base());
        }
        self.close().await;
        self.state_mut().clear_request();
    }

    /// Forcibly drops the connection and any partially read response.
    async fn reset(&mut self) {
        tracing::debug!("Resetting {} medium for {}", self.kind(), self.base());
        self.close().await;
        self.state_mut().clear_request();
    }

    /// The path to send to the server for a transport at `url`.
    fn remote_path_from_transport(&self, url: &SmartUrl) -> String {
        let root = self.base().with_path("/");
        unescape(&root.relative_url(url))
    }

    fn info(&self) -> MediumInfo {
        MediumInfo {
            kind: self.kind(),
            base: self.base().to_string(),
            protocol_version: self.state().protocol_version,
        }
    }

    /// Opens a request on this medium.
    ///
    /// Fails with [`ClientError::BodyNotDrained`] if a previous response
    /// was dropped part-way through.
    fn get_request(&mut self) -> Result<MediumRequest<'_, Self>, ClientError>
    where
        Self: Sized,
    {
        self.state_mut().begin_request()?;
        Ok(MediumRequest {
            medium: self,
            phase: RequestPhase::Writing,
        })
    }
}

#[async_trait]
impl<M: Medium + ?Sized> Medium for Box<M> {
    fn kind(&self) -> MediumKind {
        (**self).kind()
    }

    fn base(&self) -> &SmartUrl {
        (**self).base()
    }

    fn state(&self) -> &ConnectionState {
        (**self).state()
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        (**self).state_mut()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        (**self).write_bytes(bytes).await
    }

    async fn flush_request(&mut self) -> Result<(), ClientError> {
        (**self).flush_request().await
    }

    async fn read_bytes(&mut self, max: usize) -> Result<Bytes, ClientError> {
        (**self).read_bytes(max).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    async fn disconnect(&mut self) {
        (**self).disconnect().await
    }

    async fn reset(&mut self) {
        (**self).reset().await
    }

    fn remote_path_from_transport(&self, url: &SmartUrl) -> String {
        (**self).remote_path_from_transport(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Writing,
    Reading,
    Finished,
}

/// One request/response exchange on a medium.
///
/// Dropping it before [`finished_reading`](Self::finished_reading) or
/// [`detach`](Self::detach) leaves the medium unusable until it is reset.
pub struct MediumRequest<'a, M: Medium + ?Sized> {
    medium: &'a mut M,
    phase: RequestPhase,
}

impl<'a, M: Medium + ?Sized> MediumRequest<'a, M> {
    pub async fn accept_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        debug_assert_eq!(self.phase, RequestPhase::Writing);
        self.medium.write_bytes(bytes).await
    }

    pub async fn finished_writing(&mut self) -> Result<(), ClientError> {
        self.medium.flush_request().await?;
        self.phase = RequestPhase::Reading;
        Ok(())
    }

    /// Reads response bytes. A closed connection is reported as a reset.
    pub async fn read_bytes(&mut self, max: usize) -> Result<Bytes, ClientError> {
        debug_assert_eq!(self.phase, RequestPhase::Reading);
        let bytes = self.medium.read_bytes(max).await?;
        if bytes.is_empty() {
            return Err(ClientError::ConnectionReset(
                "connection closed while reading response".to_string(),
            ));
        }
        Ok(bytes)
    }

    pub fn finished_reading(mut self) {
        self.phase = RequestPhase::Finished;
        self.medium.state_mut().end_request();
    }

    /// Releases the borrow while the response is still being read.
    ///
    /// The medium stays marked busy; the caller resumes reading through
    /// [`ResponseBody`](crate::body::ResponseBody).
    pub fn detach(mut self) {
        self.phase = RequestPhase::Finished;
    }

    pub fn medium(&mut self) -> &mut M {
        self.medium
    }
}

impl<'a, M: Medium + ?Sized> Drop for MediumRequest<'a, M> {
    fn drop(&mut self) {
        if self.phase != RequestPhase::Finished {
            self.medium.state_mut().abandon_request();
        }
    }
}
