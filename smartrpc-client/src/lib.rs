//! # smartrpc-client
//!
//! Client library for the bzr smart protocol.
//!
//! This crate provides:
//! - Mediums over TCP, SSH and HTTP
//! - Protocol version negotiation with a single retry after a reset
//! - Streaming response bodies and streamed request bodies
//! - Translation of server error tuples into typed errors
//! - Call hooks for observing outgoing requests

pub mod body;
pub mod client;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod http;
pub mod medium;
pub mod request;
pub mod stream;
pub mod tls;
pub mod translate;
pub mod ui;
pub mod url;
pub mod verbs;

#[cfg(test)]
mod test_support;

pub use body::ResponseBody;
pub use client::SmartClient;
pub use connection::{medium_for_url, ConnectionConfig, SshConnector, StreamMedium, TcpConnector};
pub use error::ClientError;
pub use hooks::{CallHookParams, SmartClientHooks};
pub use http::HttpMedium;
pub use medium::{ConnectionState, Medium, MediumInfo, MediumKind};
pub use request::Call;
pub use tls::TlsClientConfig;
pub use translate::{ErrorContext, ErrorTuple, SmartError};
pub use ui::{RecordingUi, TracingUi, UiSink};
pub use url::SmartUrl;
