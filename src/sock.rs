//! Per-DAG control socket: minimal HTTP/1 over a unix-domain socket.
//!
//! The socket doubles as the cross-process run lock: bind-or-fail semantics
//! guarantee at most one server per DAG. A stale socket file is unlinked
//! only when a probe gets connection refused; a timeout means someone may
//! still own it and is surfaced instead.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, warn};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Response returned by a request handler.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
}

impl Response {
    pub fn ok_text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: "text/plain",
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: "application/json",
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: "Not Found".to_string(),
            content_type: "text/plain",
        }
    }

    fn status_text(&self) -> &'static str {
        match self.status {
            200 => "OK",
            404 => "Not Found",
            _ => "Internal Server Error",
        }
    }
}

/// Handler invoked per request with (method, path).
pub type Handler = Arc<dyn Fn(&str, &str) -> Response + Send + Sync>;

pub struct Server {
    listener: UnixListener,
    addr: PathBuf,
}

impl Server {
    /// Bind the socket, unlinking a stale file if nothing answers it.
    pub async fn bind(addr: &Path) -> Result<Self> {
        match UnixListener::bind(addr) {
            Ok(listener) => Ok(Self {
                listener,
                addr: addr.to_path_buf(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                let probe = Client::new(addr).request("GET", "/status").await;
                match probe {
                    Err(Error::SocketRefused) => {
                        debug!("removing stale socket {:?}", addr);
                        std::fs::remove_file(addr)?;
                        let listener = UnixListener::bind(addr)?;
                        Ok(Self {
                            listener,
                            addr: addr.to_path_buf(),
                        })
                    }
                    Err(Error::SocketTimeout) => Err(Error::SocketTimeout),
                    _ => Err(Error::Io(e)),
                }
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn addr(&self) -> &Path {
        &self.addr
    }

    /// Accept loop: one task per connection, until `shutdown` flips. The
    /// socket file is unlinked on the way out.
    pub async fn serve(self, handler: Handler, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    debug!("socket connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("socket accept failed: {e}");
                            break;
                        }
                    }
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.addr) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to unlink socket {:?}: {}", self.addr, e);
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, handler: Handler) -> Result<()> {
    let head = read_request_head(&mut stream).await?;
    let mut parts = head
        .lines()
        .next()
        .unwrap_or_default()
        .split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let response = handler(&method, &path);
    let payload = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        response.status,
        response.status_text(),
        response.content_type,
        response.body.len(),
        response.body
    );
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn read_request_head(stream: &mut UnixStream) -> Result<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(CLIENT_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| Error::SocketTimeout)??;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&head).to_string())
}

pub struct Client {
    addr: PathBuf,
}

impl Client {
    pub fn new(addr: &Path) -> Self {
        Self {
            addr: addr.to_path_buf(),
        }
    }

    /// Issue one request, returning (status code, body). Times out after
    /// one second with a distinct error so callers can tell a hung server
    /// from an absent one.
    pub async fn request(&self, method: &str, path: &str) -> Result<(u16, String)> {
        tokio::time::timeout(CLIENT_TIMEOUT, self.request_inner(method, path))
            .await
            .map_err(|_| Error::SocketTimeout)?
    }

    async fn request_inner(&self, method: &str, path: &str) -> Result<(u16, String)> {
        let mut stream = UnixStream::connect(&self.addr).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                    Error::SocketRefused
                }
                _ => Error::Io(e),
            }
        })?;

        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let text = String::from_utf8_lossy(&raw).to_string();

        let status = text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| Error::Other("malformed response".to_string()))?;
        let body = match text.find("\r\n\r\n") {
            Some(idx) => text[idx + 4..].to_string(),
            None => String::new(),
        };
        Ok((status, body))
    }
}
