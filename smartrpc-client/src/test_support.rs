//! In-process smart server for tests.
//!
//! Each connection is a `tokio::io::duplex` pair served by a spawned task
//! that speaks protocol versions up to `max_version`, detecting the version
//! of each request from its first line the way a real server does.

use crate::client::SmartClient;
use crate::connection::{ConnectionConfig, Connector, StreamMedium};
use crate::error::ClientError;
use crate::hooks::SmartClientHooks;
use crate::medium::MediumKind;
use crate::ui::RecordingUi;
use crate::url::SmartUrl;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use smartrpc_protocol::version::{MESSAGE_VERSION_THREE, REQUEST_VERSION_TWO};
use smartrpc_protocol::{Decoder, Encoder, Headers, MessageEvent, ProtocolVersion, Response};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// Verbs whose V1/V2 requests carry a body.
const BODY_VERBS: &[&[u8]] = &[b"put", b"append", b"readv", b"echo_body"];

/// What the server saw of one request.
#[derive(Debug, Clone)]
pub(crate) struct ReceivedRequest {
    pub version: ProtocolVersion,
    pub method: Bytes,
    pub args: Vec<Bytes>,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub body_error: Option<Vec<Bytes>>,
}

/// Misbehaviour applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Read one request, then hang up without answering.
    DropAfterRequest,
    /// Every client write fails as if the peer reset.
    FailWrites,
    /// Answer with a line of junk too long for any protocol.
    Garbage,
}

type Handler = dyn Fn(&ReceivedRequest) -> Option<Response> + Send + Sync;

struct ServerState {
    max_version: ProtocolVersion,
    handler: Box<Handler>,
    faults: Mutex<VecDeque<Fault>>,
    connections: AtomicUsize,
    requests: Mutex<Vec<ReceivedRequest>>,
}

/// A scripted server. The handler returns `None` for verbs it does not know.
#[derive(Clone)]
pub(crate) struct SimulatedServer {
    state: Arc<ServerState>,
}

impl SimulatedServer {
    pub fn new<F>(max_version: ProtocolVersion, handler: F) -> Self
    where
        F: Fn(&ReceivedRequest) -> Option<Response> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(ServerState {
                max_version,
                handler: Box::new(handler),
                faults: Mutex::new(VecDeque::new()),
                connections: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Applies `fault` to the next connection that has no fault yet.
    pub fn push_fault(&self, fault: Fault) {
        self.state.faults.lock().push_back(fault);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.requests.lock().clone()
    }

    /// Waits until at least `n` requests were recorded.
    pub async fn wait_for_requests(&self, n: usize) -> Vec<ReceivedRequest> {
        for _ in 0..200 {
            let requests = self.requests();
            if requests.len() >= n {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.requests()
    }

    pub fn medium(&self) -> StreamMedium<SimulatedConnector> {
        StreamMedium::new(
            SimulatedConnector {
                state: self.state.clone(),
            },
            SmartUrl::parse("bzr://simulated/").expect("static URL"),
            ConnectionConfig::new(),
        )
    }

    /// A client with private hooks and a recording UI.
    pub fn client(&self) -> (SmartClient<StreamMedium<SimulatedConnector>>, Arc<RecordingUi>) {
        let ui = Arc::new(RecordingUi::new());
        let client = SmartClient::new(self.medium())
            .with_hooks(Arc::new(SmartClientHooks::new()))
            .with_ui(ui.clone());
        (client, ui)
    }
}

pub(crate) struct SimulatedConnector {
    state: Arc<ServerState>,
}

#[async_trait]
impl Connector for SimulatedConnector {
    type Stream = FlakyStream;

    fn kind(&self) -> MediumKind {
        MediumKind::Pipe
    }

    async fn connect(&self) -> Result<FlakyStream, ClientError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        let fault = self.state.faults.lock().pop_front();
        tokio::spawn(serve(self.state.clone(), server, fault));
        Ok(FlakyStream {
            inner: client,
            fail_writes: fault == Some(Fault::FailWrites),
        })
    }
}

/// The client end of a simulated connection.
pub(crate) struct FlakyStream {
    inner: DuplexStream,
    fail_writes: bool,
}

impl AsyncRead for FlakyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlakyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fail_writes {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated reset",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

async fn read_more(io: &mut DuplexStream, buf: &mut BytesMut) -> bool {
    let mut chunk = [0u8; 4096];
    match io.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn detect_version(buf: &[u8], max: ProtocolVersion) -> ProtocolVersion {
    if max >= ProtocolVersion::Three && buf.starts_with(MESSAGE_VERSION_THREE) {
        ProtocolVersion::Three
    } else if max >= ProtocolVersion::Two && buf.starts_with(REQUEST_VERSION_TWO) {
        ProtocolVersion::Two
    } else {
        ProtocolVersion::One
    }
}

fn bad_request(method: &[u8]) -> Response {
    Response::error(vec![
        Bytes::from_static(b"error"),
        Bytes::from(format!(
            "Generic bzr smart protocol error: bad request '{}'",
            String::from_utf8_lossy(method)
        )),
    ])
}

fn unknown_verb(version: ProtocolVersion, method: &Bytes) -> Response {
    match version {
        ProtocolVersion::Three => Response::error(vec![
            Bytes::from_static(b"UnknownMethod"),
            method.clone(),
        ]),
        _ => bad_request(method),
    }
}

async fn serve(state: Arc<ServerState>, mut io: DuplexStream, fault: Option<Fault>) {
    let mut buf = BytesMut::new();
    if fault == Some(Fault::Garbage) {
        if read_more(&mut io, &mut buf).await {
            let _ = io.write_all(&vec![b'x'; smartrpc_protocol::MAX_LINE_LENGTH + 16]).await;
        }
        return;
    }

    loop {
        while !buf.contains(&b'\n') {
            if !read_more(&mut io, &mut buf).await {
                return;
            }
        }
        let version = detect_version(&buf, state.max_version);
        let mut decoder = Decoder::for_request(version);
        decoder.extend(&buf.split());

        let mut request = ReceivedRequest {
            version,
            method: Bytes::new(),
            args: Vec::new(),
            headers: Headers::new(),
            body: None,
            body_error: None,
        };
        let mut body = BytesMut::new();
        let mut saw_body = false;
        loop {
            match decoder.next_event() {
                Ok(Some(MessageEvent::Args { mut args, .. })) => {
                    if args.is_empty() {
                        return;
                    }
                    request.method = args.remove(0);
                    request.args = args;
                    if version == ProtocolVersion::One
                        && (request.method.starts_with(b"bzr message")
                            || request.method.starts_with(b"bzr request"))
                    {
                        // A newer protocol than this server speaks.
                        let reply = bad_request(&request.method);
                        if let Ok(encoded) = Encoder::encode_response(version, &reply, &Headers::new()) {
                            let _ = io.write_all(&encoded).await;
                        }
                        return;
                    }
                    decoder.expect_body(BODY_VERBS.contains(&&request.method[..]));
                }
                Ok(Some(MessageEvent::BodyChunk(chunk))) => {
                    saw_body = true;
                    body.extend_from_slice(&chunk);
                }
                Ok(Some(MessageEvent::BodyError(args))) => request.body_error = Some(args),
                Ok(Some(MessageEvent::End)) => break,
                Ok(None) => {
                    let mut more = BytesMut::new();
                    if !read_more(&mut io, &mut more).await {
                        return;
                    }
                    decoder.extend(&more);
                }
                Err(_) => return,
            }
        }
        if saw_body {
            request.body = Some(body.freeze());
        }
        request.headers = decoder.headers().clone();
        buf.extend_from_slice(&decoder.take_unused());
        state.requests.lock().push(request.clone());

        if fault == Some(Fault::DropAfterRequest) {
            return;
        }

        let response =
            (state.handler)(&request).unwrap_or_else(|| unknown_verb(version, &request.method));
        let encoded = match Encoder::encode_response(version, &response, &Headers::new()) {
            Ok(encoded) => encoded,
            Err(_) => return,
        };
        if io.write_all(&encoded).await.is_err() {
            return;
        }
    }
}

/// Converts string literals into an argument vector.
pub(crate) fn args(items: &[&str]) -> Vec<Bytes> {
    items
        .iter()
        .map(|s| Bytes::copy_from_slice(s.as_bytes()))
        .collect()
}
