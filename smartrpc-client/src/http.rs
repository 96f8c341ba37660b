//! Smart requests tunnelled through HTTP POST.
//!
//! Each request is buffered until it is complete, then POSTed to the
//! `.bzr/smart` endpoint below the base URL. The response body is served
//! back to the protocol decoder from memory.

use crate::connection::{connect_tcp, with_timeout, ConnectionConfig};
use crate::error::ClientError;
use crate::medium::{ConnectionState, Medium, MediumKind};
use crate::stream::ClientStream;
use crate::tls::connect_tls;
use crate::url::{unescape, SmartUrl};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;

/// Path of the smart endpoint relative to a branch or repository URL.
pub const SMART_ENDPOINT: &str = ".bzr/smart";

pub struct HttpMedium {
    base: SmartUrl,
    config: ConnectionConfig,
    state: ConnectionState,
    request: BytesMut,
    response: Option<Bytes>,
}

impl HttpMedium {
    pub fn new(base: SmartUrl, config: ConnectionConfig) -> Self {
        Self {
            base,
            config,
            state: ConnectionState::new(),
            request: BytesMut::new(),
            response: None,
        }
    }

    /// The URL requests are POSTed to.
    pub fn endpoint(&self) -> SmartUrl {
        self.base.without_bzr_prefix().join(SMART_ENDPOINT)
    }

    fn host_header(url: &SmartUrl) -> String {
        let host = if url.host().contains(':') {
            format!("[{}]", url.host())
        } else {
            url.host().to_string()
        };
        match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    async fn post(&self, body: Bytes) -> Result<Bytes, ClientError> {
        let url = self.endpoint();
        let tcp = connect_tcp(url.host(), url.port_or_default(), self.config.connect_timeout).await?;
        let stream = if url.scheme() == "https" {
            ClientStream::Tls {
                stream: connect_tls(&self.config.tls, url.host(), tcp).await?,
            }
        } else {
            ClientStream::Plain { stream: tcp }
        };

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(http_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("HTTP connection closed with error: {}", e);
            }
        });

        tracing::debug!("POST {} ({} bytes)", url, body.len());
        let request = Request::builder()
            .method(Method::POST)
            .uri(url.path())
            .header(header::HOST, Self::host_header(&url))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(body))
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let exchange = async {
            let response = sender.send_request(request).await.map_err(hyper_to_io)?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(hyper_to_io)?
                .to_bytes();
            Ok::<_, io::Error>((status, bytes))
        };
        let (status, bytes) = with_timeout(self.config.read_timeout, exchange).await?;

        if status != StatusCode::OK {
            return Err(ClientError::Http(format!("POST {} returned {}", url, status)));
        }
        tracing::debug!("Received {} byte smart response", bytes.len());
        Ok(bytes)
    }
}

fn http_error(err: hyper::Error) -> ClientError {
    ClientError::from(hyper_to_io(err))
}

/// Maps a hyper error to I/O so dropped connections count as resets.
fn hyper_to_io(err: hyper::Error) -> io::Error {
    let kind = if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
        io::ErrorKind::ConnectionReset
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err)
}

#[async_trait]
impl Medium for HttpMedium {
    fn kind(&self) -> MediumKind {
        MediumKind::Http
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
        self.response.is_some()
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.request.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush_request(&mut self) -> Result<(), ClientError> {
        let body = self.request.split().freeze();
        let response = self.post(body).await?;
        self.response = Some(response);
        Ok(())
    }

    async fn read_bytes(&mut self, max: usize) -> Result<Bytes, ClientError> {
        match self.response.as_mut() {
            Some(buf) => {
                let n = max.min(buf.len());
                Ok(buf.split_to(n))
            }
            None => Ok(Bytes::new()),
        }
    }

    async fn close(&mut self) {
        self.request.clear();
        self.response = None;
    }

    /// Paths are relative to the endpoint's directory, not the host root.
    fn remote_path_from_transport(&self, url: &SmartUrl) -> String {
        unescape(&self.base.without_bzr_prefix().relative_url(&url.without_bzr_prefix()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn medium(url: &str) -> HttpMedium {
        HttpMedium::new(SmartUrl::parse(url).unwrap(), ConnectionConfig::new())
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            medium("bzr+http://host/repo/branch/").endpoint().to_string(),
            "http://host/repo/branch/.bzr/smart"
        );
        assert_eq!(
            medium("https://host:8443/repo").endpoint().to_string(),
            "https://host:8443/repo/.bzr/smart"
        );
    }

    #[test]
    fn test_host_header() {
        let url = SmartUrl::parse("http://[::1]:8080/").unwrap();
        assert_eq!(HttpMedium::host_header(&url), "[::1]:8080");
        let url = SmartUrl::parse("http://host/").unwrap();
        assert_eq!(HttpMedium::host_header(&url), "host");
    }

    #[test]
    fn test_remote_path_is_relative_to_base() {
        let m = medium("bzr+http://host/repo/");
        let path = m.remote_path_from_transport(&SmartUrl::parse("bzr+http://host/repo/trunk%20x").unwrap());
        assert_eq!(path, "trunk x");
        let path = m.remote_path_from_transport(&SmartUrl::parse("http://host/repo/").unwrap());
        assert_eq!(path, ".");
    }

    #[tokio::test]
    async fn test_post_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            // Read until the 5 byte body after the header block has arrived.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                    if received.len() >= pos + 4 + 5 {
                        break;
                    }
                }
            }
            let body = b"ok\x01yes\n";
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        let mut m = medium(&format!("bzr+http://127.0.0.1:{}/repo/", port));
        let mut request = m.get_request().unwrap();
        request.accept_bytes(b"hello").await.unwrap();
        request.finished_writing().await.unwrap();
        let reply = request.read_bytes(3).await.unwrap();
        assert_eq!(&reply[..], b"ok\x01");
        let reply = request.read_bytes(1024).await.unwrap();
        assert_eq!(&reply[..], b"yes\n");
        request.finished_reading();

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /repo/.bzr/smart HTTP/1.1\r\n"));
        assert!(received.to_ascii_lowercase().contains("content-type: application/octet-stream"));
        assert!(received.ends_with("hello"));
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let mut m = medium(&format!("http://127.0.0.1:{}/", port));
        let mut request = m.get_request().unwrap();
        request.accept_bytes(b"x").await.unwrap();
        let err = request.finished_writing().await.unwrap_err();
        assert!(matches!(err, ClientError::Http(msg) if msg.contains("404")));
    }
}
