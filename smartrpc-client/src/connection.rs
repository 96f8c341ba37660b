//! Connection settings and stream-based mediums.

use crate::error::ClientError;
use crate::http::HttpMedium;
use crate::medium::{ConnectionState, Medium, MediumKind};
use crate::stream::ClientStream;
use crate::tls::TlsClientConfig;
use crate::url::SmartUrl;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::process::Command;

/// Default read buffer size (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

pub const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Command run on the far side of an SSH connection.
pub const DEFAULT_REMOTE_BZR: &str = "bzr";

/// Settings shared by every medium a client opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    pub tls: TlsClientConfig,
    /// SSH client executable for `bzr+ssh://`.
    pub ssh_program: String,
    /// Path of the `bzr` executable on SSH hosts.
    pub remote_bzr: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            write_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: TlsClientConfig::default(),
            ssh_program: DEFAULT_SSH_PROGRAM.to_string(),
            remote_bzr: DEFAULT_REMOTE_BZR.to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    pub fn with_remote_bzr(mut self, path: impl Into<String>) -> Self {
        self.remote_bzr = path.into();
        self
    }
}

/// Runs `fut`, failing with [`ClientError::Timeout`] after `limit`.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => {
                tracing::debug!("Operation timed out after {:?}", limit);
                Err(ClientError::Timeout)
            }
        },
        None => fut.await.map_err(ClientError::from),
    }
}

/// Opens a TCP connection to the first reachable address of `host`.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream, ClientError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| ClientError::HostLookup {
            host: host.to_string(),
            source,
        })?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        tracing::debug!("Connecting to {}...", addr);
        match with_timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(err) => {
                tracing::debug!("Connection to {} failed: {}", addr, err);
                last_err = Some((addr, err));
            }
        }
    }

    match last_err {
        Some((_, ClientError::Timeout)) => Err(ClientError::Timeout),
        Some((addr, ClientError::Io(source))) => Err(ClientError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Some((addr, other)) => Err(ClientError::Connect {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, other.to_string()),
        }),
        None => Err(ClientError::HostLookup {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        }),
    }
}

/// Opens the byte stream a [`StreamMedium`] runs over.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn kind(&self) -> MediumKind;

    async fn connect(&self) -> Result<Self::Stream, ClientError>;
}

/// Connects to `bzr://host:port/`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = ClientStream;

    fn kind(&self) -> MediumKind {
        MediumKind::Tcp
    }

    async fn connect(&self) -> Result<ClientStream, ClientError> {
        let stream = connect_tcp(&self.host, self.port, self.connect_timeout).await?;
        Ok(ClientStream::Plain { stream })
    }
}

/// Runs `bzr serve --inet` on a remote host over an SSH subprocess.
#[derive(Debug, Clone)]
pub struct SshConnector {
    program: String,
    host: String,
    port: Option<u16>,
    user: Option<String>,
    remote_bzr: String,
}

impl SshConnector {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            program: DEFAULT_SSH_PROGRAM.to_string(),
            host: host.into(),
            port: None,
            user: None,
            remote_bzr: DEFAULT_REMOTE_BZR.to_string(),
        }
    }

    pub fn for_url(url: &SmartUrl, config: &ConnectionConfig) -> Self {
        Self {
            program: config.ssh_program.clone(),
            host: url.host().to_string(),
            port: url.port(),
            user: url.user().map(str::to_string),
            remote_bzr: config.remote_bzr.clone(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_remote_bzr(mut self, path: impl Into<String>) -> Self {
        self.remote_bzr = path.into();
        self
    }

    /// Arguments passed to the SSH program.
    pub fn command_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-oForwardX11=no",
            "-oForwardAgent=no",
            "-oClearAllForwardings=yes",
            "-oNoHostAuthenticationForLocalhost=yes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(self.host.clone());
        args.extend(
            [
                self.remote_bzr.as_str(),
                "serve",
                "--inet",
                "--directory=/",
                "--allow-writes",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Stream = ClientStream;

    fn kind(&self) -> MediumKind {
        MediumKind::Ssh
    }

    async fn connect(&self) -> Result<ClientStream, ClientError> {
        let args = self.command_args();
        tracing::debug!("Spawning {} {}", self.program, args.join(" "));
        let spawn_err = |source| ClientError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(io::Error::new(io::ErrorKind::BrokenPipe, "no stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(io::Error::new(io::ErrorKind::BrokenPipe, "no stdout pipe")))?;
        Ok(ClientStream::Ssh {
            stdout,
            stdin,
            child,
        })
    }
}

/// A medium over a bidirectional byte stream: TCP, SSH pipes, or a pipe
/// handed in by the caller.
pub struct StreamMedium<C: Connector> {
    connector: C,
    base: SmartUrl,
    config: ConnectionConfig,
    stream: Option<C::Stream>,
    state: ConnectionState,
    read_buf: Vec<u8>,
}

impl<C: Connector> StreamMedium<C> {
    pub fn new(connector: C, base: SmartUrl, config: ConnectionConfig) -> Self {
        let read_buf = vec![0u8; config.read_buffer_size];
        Self {
            connector,
            base,
            config,
            stream: None,
            state: ConnectionState::new(),
            read_buf,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl<C: Connector> Medium for StreamMedium<C> {
    fn kind(&self) -> MediumKind {
        self.connector.kind()
    }

    fn base(&self) -> &SmartUrl {
        &self.base
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        if self.stream.is_none() {
            tracing::debug!("Connecting {} medium to {}", self.connector.kind(), self.base);
            self.stream = Some(self.connector.connect().await?);
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(ClientError::ConnectionReset("medium is not connected".to_string())),
        };
        with_timeout(self.config.write_timeout, stream.write_all(bytes)).await
    }

    async fn flush_request(&mut self) -> Result<(), ClientError> {
        match self.stream.as_mut() {
            Some(stream) => with_timeout(self.config.write_timeout, stream.flush()).await,
            None => Ok(()),
        }
    }

    async fn read_bytes(&mut self, max: usize) -> Result<Bytes, ClientError> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(ClientError::ConnectionReset("medium is not connected".to_string())),
        };
        let limit = max.clamp(1, self.read_buf.len());
        let n = with_timeout(self.config.read_timeout, stream.read(&mut self.read_buf[..limit])).await?;
        Ok(Bytes::copy_from_slice(&self.read_buf[..n]))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Error shutting down {} stream: {}", self.connector.kind(), e);
            }
        }
    }
}

/// Opens the right medium for `url`.
///
/// `bzr://` uses TCP, `bzr+ssh://` an SSH subprocess, and `bzr+http(s)://`
/// or plain `http(s)://` POSTs to the `.bzr/smart` endpoint.
pub fn medium_for_url(
    url: &SmartUrl,
    config: &ConnectionConfig,
) -> Result<Box<dyn Medium>, ClientError> {
    match url.scheme() {
        "bzr" => {
            let connector = TcpConnector::new(url.host(), url.port_or_default())
                .with_connect_timeout(config.connect_timeout);
            Ok(Box::new(StreamMedium::new(connector, url.clone(), config.clone())))
        }
        "bzr+ssh" => {
            let connector = SshConnector::for_url(url, config);
            Ok(Box::new(StreamMedium::new(connector, url.clone(), config.clone())))
        }
        "bzr+http" | "bzr+https" | "http" | "https" => {
            Ok(Box::new(HttpMedium::new(url.clone(), config.clone())))
        }
        other => Err(ClientError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {:?}", other),
        }),
    }
}
