//! HTTP client for the Docker Engine API over a Unix domain socket.
//!
//! Podman's docker-compatible service speaks the same API; point the
//! socket path at `/run/podman/podman.sock` (rootful) or
//! `/run/user/<uid>/podman/podman.sock` (rootless).

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::TryStreamExt;
use http::{header, Method, Request, Response};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::debug;

use occystrap_core::error::{ImageError, Result};

/// Default socket path for the Docker daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Client for the Docker Engine API.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Creates a client for the daemon at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The socket path this client talks to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Performs a GET request and parses the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.build_request(Method::GET, path, Full::new(Bytes::new()))?;
        let response = self.send(request).await?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ImageError::Daemon(format!("failed to read response: {e}")))?
            .to_bytes();
        check_status(status, &body)?;
        serde_json::from_slice(&body)
            .map_err(|e| ImageError::Daemon(format!("failed to parse response: {e}")))
    }

    /// Performs a GET request, returning the response body for streaming.
    pub async fn get_stream(&self, path: &str) -> Result<Incoming> {
        let request = self.build_request(Method::GET, path, Full::new(Bytes::new()))?;
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            check_status(status, &body)?;
            return Err(ImageError::Daemon(format!("daemon API error {status}")));
        }
        Ok(response.into_body())
    }

    /// POSTs the contents of a file as `application/x-tar`, streaming it
    /// rather than loading it into memory.
    pub async fn post_tar_file(&self, path: &str, file: std::fs::File, len: u64) -> Result<()> {
        let stream = tokio_util::io::ReaderStream::new(tokio::fs::File::from_std(file));
        let body = StreamBody::new(
            stream
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://localhost{path}"))
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/x-tar")
            .header(header::CONTENT_LENGTH, len)
            .body(body)
            .map_err(|e| ImageError::Daemon(format!("failed to build request: {e}")))?;

        let response = self.send(request).await?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        check_status(status, &body)
    }

    fn build_request<B>(&self, method: Method, path: &str, body: B) -> Result<Request<B>> {
        Request::builder()
            .method(method)
            .uri(format!("http://localhost{path}"))
            .header(header::HOST, "localhost")
            .body(body)
            .map_err(|e| ImageError::Daemon(format!("failed to build request: {e}")))
    }

    /// Opens a connection, sends one request, and leaves the connection
    /// task running until the response body is drained.
    async fn send<B>(&self, request: Request<B>) -> Result<Response<Incoming>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        debug!(
            method = %request.method(),
            path = %request.uri().path(),
            "daemon API request"
        );
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ImageError::Daemon(format!(
                "failed to connect to daemon at {}: {e}",
                self.socket_path.display()
            ))
        })?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ImageError::Daemon(format!("HTTP handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("daemon connection closed: {e}");
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| ImageError::Daemon(format!("request failed: {e}")))
    }
}

fn check_status(status: http::StatusCode, body: &[u8]) -> Result<()> {
    if status == http::StatusCode::NOT_FOUND {
        return Err(ImageError::NotFound(String::from_utf8_lossy(body).into_owned()));
    }
    if !status.is_success() {
        return Err(ImageError::Daemon(format!(
            "daemon API error {status}: {}",
            String::from_utf8_lossy(body)
        )));
    }
    Ok(())
}
