//! Client error types.

use crate::translate::{translate_error, ErrorContext, ErrorTuple, SmartError};
use std::io;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot resolve host {host}: {source}")]
    HostLookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("request timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] smartrpc_protocol::ProtocolError),

    #[error("server does not support the {0} method")]
    UnknownVerb(String),

    #[error("{0} is not a smart server")]
    NotASmartServer(String),

    #[error("error received from smart server: {0}")]
    ErrorFromServer(ErrorTuple),

    #[error(transparent)]
    Server(#[from] SmartError),

    #[error("request body stream failed: {0}")]
    BodyStream(#[source] io::Error),

    #[error("previous response body was dropped before it was fully read")]
    BodyNotDrained,

    #[error("a request is already in progress on this medium")]
    RequestInProgress,

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => ClientError::ConnectionReset(err.to_string()),
            _ => ClientError::Io(err),
        }
    }
}

impl ClientError {
    /// Returns whether the connection was dropped underneath the request.
    pub fn is_connection_reset(&self) -> bool {
        matches!(self, ClientError::ConnectionReset(_))
    }

    /// Returns whether repeating the whole operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ConnectionReset(_) | ClientError::Timeout => true,
            ClientError::Server(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether the server rejected the verb itself.
    pub fn is_unknown_verb(&self) -> bool {
        matches!(self, ClientError::UnknownVerb(_))
    }

    /// The raw error tuple, if this is an untranslated server error.
    pub fn error_tuple(&self) -> Option<&ErrorTuple> {
        match self {
            ClientError::ErrorFromServer(tuple) => Some(tuple),
            ClientError::Server(SmartError::Unknown { tuple, .. }) => Some(tuple),
            _ => None,
        }
    }

    /// Translates a server error tuple into a [`SmartError`] using `context`.
    ///
    /// Every other error is returned unchanged.
    pub fn translate(self, context: &ErrorContext) -> Self {
        match self {
            ClientError::ErrorFromServer(tuple) => ClientError::Server(translate_error(tuple, context)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_io_reset_kinds_are_classified() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err: ClientError = io::Error::new(kind, "gone").into();
            assert!(err.is_connection_reset(), "{:?}", kind);
        }
        let err: ClientError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[test]
    fn test_translate_only_touches_server_errors() {
        let err = ClientError::ErrorFromServer(ErrorTuple::new(vec![Bytes::from_static(b"NotStacked")]));
        let ctx = ErrorContext::new().with_branch("bzr://host/trunk/");
        assert!(matches!(
            err.translate(&ctx),
            ClientError::Server(SmartError::NotStacked { .. })
        ));

        let err = ClientError::Timeout.translate(&ctx);
        assert!(matches!(err, ClientError::Timeout));
    }

    #[test]
    fn test_error_tuple_survives_failed_translation() {
        let tuple = ErrorTuple::new(vec![Bytes::from_static(b"SomethingNew"), Bytes::from_static(b"x")]);
        let err = ClientError::ErrorFromServer(tuple.clone()).translate(&ErrorContext::new());
        assert_eq!(err.error_tuple(), Some(&tuple));
    }
}
