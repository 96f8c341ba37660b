//! High-level client API.

use crate::body::{PendingResponse, ResponseBody};
use crate::connection::{medium_for_url, ConnectionConfig};
use crate::error::ClientError;
use crate::hooks::SmartClientHooks;
use crate::medium::Medium;
use crate::request::{self, AttemptFailure, AttemptOutcome, Call, Phase};
use crate::ui::{TracingUi, UiSink};
use crate::url::SmartUrl;
use crate::verbs;
use bytes::Bytes;
use futures::stream::BoxStream;
use smartrpc_protocol::bencode::Value;
use smartrpc_protocol::{Headers, ProtocolError, ProtocolVersion, ReadvRange};
use std::io;
use std::sync::Arc;

/// Default number of bytes requested per medium read.
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Headers sent with every version three request unless replaced.
pub fn default_headers() -> Headers {
    let mut headers = Headers::new();
    headers.insert(
        Bytes::from_static(b"Software version"),
        Value::Bytes(Bytes::from_static(env!("CARGO_PKG_VERSION").as_bytes())),
    );
    headers
}

fn to_args<A: AsRef<[u8]>>(args: &[A]) -> Vec<Bytes> {
    args.iter()
        .map(|a| Bytes::copy_from_slice(a.as_ref()))
        .collect()
}

/// A client for one smart server, speaking over one medium.
///
/// Calls take `&mut self`; a returned [`ResponseBody`] keeps the client
/// borrowed until it is read or dropped.
pub struct SmartClient<M: Medium = Box<dyn Medium>> {
    medium: M,
    hooks: Arc<SmartClientHooks>,
    ui: Arc<dyn UiSink>,
    headers: Headers,
    no_retry: bool,
    read_size: usize,
}

impl SmartClient<Box<dyn Medium>> {
    /// Opens a client for `url` with the medium its scheme calls for.
    pub fn for_url(url: &str, config: &ConnectionConfig) -> Result<Self, ClientError> {
        let url = SmartUrl::parse(url)?;
        let medium = medium_for_url(&url, config)?;
        Ok(SmartClient::new(medium).with_read_size(config.read_buffer_size))
    }
}

impl<M: Medium> SmartClient<M> {
    pub fn new(medium: M) -> Self {
        Self {
            medium,
            hooks: SmartClientHooks::global(),
            ui: Arc::new(TracingUi),
            headers: default_headers(),
            no_retry: false,
            read_size: DEFAULT_READ_SIZE,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<SmartClientHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_ui(mut self, ui: Arc<dyn UiSink>) -> Self {
        self.ui = ui;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Disables the single retry after a connection reset.
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn medium_mut(&mut self) -> &mut M {
        &mut self.medium
    }

    pub fn into_medium(self) -> M {
        self.medium
    }

    pub fn hooks(&self) -> &Arc<SmartClientHooks> {
        &self.hooks
    }

    /// The protocol version agreed with the server, once known.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.medium.state().protocol_version
    }

    pub fn remote_path_from_transport(&self, url: &SmartUrl) -> String {
        self.medium.remote_path_from_transport(url)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Calls `method`. Any response body is read and discarded.
    pub async fn call<A: AsRef<[u8]>>(
        &mut self,
        method: &str,
        args: &[A],
    ) -> Result<Vec<Bytes>, ClientError> {
        let call = Call::new(method.to_string(), to_args(args));
        Ok(self.dispatch(&call).await?.args)
    }

    /// Calls `method` and returns the response body for the caller to read.
    pub async fn call_expecting_body<A: AsRef<[u8]>>(
        &mut self,
        method: &str,
        args: &[A],
    ) -> Result<(Vec<Bytes>, ResponseBody<'_, M>), ClientError> {
        let call = Call::new(method.to_string(), to_args(args)).expecting_body();
        let pending = self.dispatch(&call).await?;
        Ok(self.attach(pending))
    }

    pub async fn call_with_body_bytes<A: AsRef<[u8]>>(
        &mut self,
        method: &str,
        args: &[A],
        body: impl Into<Bytes>,
    ) -> Result<Vec<Bytes>, ClientError> {
        let call = Call::new(method.to_string(), to_args(args)).with_body(body);
        Ok(self.dispatch(&call).await?.args)
    }

    pub async fn call_with_body_bytes_expecting_body<A: AsRef<[u8]>>(
        &mut self,
        method: &str,
        args: &[A],
        body: impl Into<Bytes>,
    ) -> Result<(Vec<Bytes>, ResponseBody<'_, M>), ClientError> {
        let call = Call::new(method.to_string(), to_args(args))
            .with_body(body)
            .expecting_body();
        let pending = self.dispatch(&call).await?;
        Ok(self.attach(pending))
    }

    /// Sends `ranges` as a readv body; the response body holds the data.
    pub async fn call_with_body_readv_array<A: AsRef<[u8]>>(
        &mut self,
        method: &str,
        args: &[A],
        ranges: &[ReadvRange],
    ) -> Result<(Vec<Bytes>, ResponseBody<'_, M>), ClientError> {
        let call = Call::new(method.to_string(), to_args(args))
            .with_readv(ranges.to_vec())
            .expecting_body();
        let pending = self.dispatch(&call).await?;
        Ok(self.attach(pending))
    }

    /// Calls `method` with a body produced by `body`, which is consumed
    /// once, in order. Version three only; never retried.
    ///
    /// Fails with [`ClientError::UnknownVerb`] without touching the wire if
    /// the server is known to predate streamed bodies. The returned body is
    /// empty when the server sent none.
    pub async fn call_with_body_stream<A: AsRef<[u8]>>(
        &mut self,
        method: &str,
        args: &[A],
        mut body: BoxStream<'_, io::Result<Bytes>>,
    ) -> Result<(Vec<Bytes>, ResponseBody<'_, M>), ClientError> {
        let call = Call::new(method.to_string(), to_args(args)).expecting_body();
        self.hooks.run_call_hooks(&call.hook_params(self.medium.info()));

        let stream_version = ProtocolVersion::Three;
        let known = self.medium.state().protocol_version;
        if known.map_or(false, |v| !v.supports_request_streams())
            || self.medium.state().is_remote_before(stream_version.introduced_in())
        {
            tracing::debug!("Remote is too old for a streamed {:?} request", method);
            return Err(ClientError::UnknownVerb(method.to_string()));
        }

        let result = request::attempt_stream(
            &mut self.medium,
            &call.method,
            &call.args,
            &mut body,
            &self.headers,
            self.read_size,
        )
        .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) => return Err(self.abandon_attempt(failure).await),
        };

        if let AttemptOutcome::WrongVersion(err) = outcome {
            self.medium.disconnect().await;
            if known.is_some() {
                return Err(ClientError::Protocol(err));
            }
            self.medium
                .state_mut()
                .remember_remote_is_before(stream_version.introduced_in());
            self.advise_downgrade(stream_version);
            return Err(ClientError::UnknownVerb(method.to_string()));
        }

        self.medium.state_mut().protocol_version = Some(stream_version);
        let pending = Self::settle(outcome)?;
        Ok(self.attach(pending))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn attach(&mut self, pending: PendingResponse) -> (Vec<Bytes>, ResponseBody<'_, M>) {
        let body = ResponseBody::new(&mut self.medium, pending.body, self.read_size);
        (pending.args, body)
    }

    async fn dispatch(&mut self, call: &Call) -> Result<PendingResponse, ClientError> {
        self.hooks.run_call_hooks(&call.hook_params(self.medium.info()));
        let mut retried = false;

        if let Some(version) = self.medium.state().protocol_version {
            let outcome = self.attempt_with_retry(version, call, &mut retried).await?;
            if let AttemptOutcome::WrongVersion(_) = outcome {
                self.medium.disconnect().await;
            }
            return Self::settle(outcome);
        }

        let mut last_error: Option<ProtocolError> = None;
        for version in ProtocolVersion::NEGOTIATION_ORDER {
            if self.medium.state().is_remote_before(version.introduced_in()) {
                tracing::debug!("Skipping protocol {}, remote is too old", version);
                continue;
            }
            let outcome = match self.attempt_with_retry(version, call, &mut retried).await {
                Ok(outcome) => outcome,
                // No older protocol left to fall back to.
                Err(ClientError::Protocol(err)) if version == ProtocolVersion::One => {
                    last_error = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            };
            match outcome {
                AttemptOutcome::WrongVersion(err) => {
                    if version != ProtocolVersion::One {
                        self.medium
                            .state_mut()
                            .remember_remote_is_before(version.introduced_in());
                    }
                    self.advise_downgrade(version);
                    self.medium.disconnect().await;
                    last_error = Some(err);
                }
                outcome => {
                    tracing::debug!("Server speaks protocol {}", version);
                    self.medium.state_mut().protocol_version = Some(version);
                    return Self::settle(outcome);
                }
            }
        }

        if let Some(err) = last_error {
            tracing::debug!("Giving up on protocol negotiation: {}", err);
        }
        self.medium.disconnect().await;
        Err(ClientError::NotASmartServer(self.medium.base().to_string()))
    }

    /// Runs one attempt, repeating it once after a connection reset where
    /// that is safe.
    async fn attempt_with_retry(
        &mut self,
        version: ProtocolVersion,
        call: &Call,
        retried: &mut bool,
    ) -> Result<AttemptOutcome, ClientError> {
        loop {
            let result = request::attempt(
                &mut self.medium,
                version,
                call,
                &self.headers,
                self.read_size,
            )
            .await;
            let failure = match result {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };
            let phase = failure.phase;
            let error = self.abandon_attempt(failure).await;

            if !error.is_connection_reset() || *retried || self.no_retry {
                return Err(error);
            }
            let message = match phase {
                Phase::Send => format!("ConnectionReset calling '{}', retrying", call.method_str()),
                Phase::Read if verbs::is_safe_to_send_twice(&call.method) => format!(
                    "ConnectionReset reading response for '{}', retrying",
                    call.method_str()
                ),
                _ => return Err(error),
            };
            *retried = true;
            tracing::debug!("Retrying after: {}", error);
            self.ui.advise(&message);
        }
    }

    /// Resets the medium if the attempt got as far as the wire.
    async fn abandon_attempt(&mut self, failure: AttemptFailure) -> ClientError {
        if failure.phase != Phase::Open {
            self.medium.reset().await;
        }
        failure.error
    }

    fn advise_downgrade(&self, version: ProtocolVersion) {
        self.ui.advise(&format!(
            "Server does not understand Bazaar network protocol {}, reconnecting.  \
             (Upgrade the server to avoid this.)",
            version.number()
        ));
    }

    fn settle(outcome: AttemptOutcome) -> Result<PendingResponse, ClientError> {
        match outcome {
            AttemptOutcome::Success(pending) => Ok(pending),
            AttemptOutcome::UnknownVerb(verb) => {
                tracing::debug!("Server does not know {:?}", verb);
                Err(ClientError::UnknownVerb(verb))
            }
            AttemptOutcome::ApplicationError(tuple) => {
                tracing::debug!("Server returned error {}", tuple);
                Err(ClientError::ErrorFromServer(tuple))
            }
            AttemptOutcome::WrongVersion(err) => Err(ClientError::Protocol(err)),
        }
    }
}
