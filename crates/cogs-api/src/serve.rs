//! Listeners for the API
//!
//! `axum::serve` only speaks TCP, so connections are driven by hyper
//! directly: one HTTP/1 connection task per accepted stream, with the peer
//! attached to every request. hyper rejects `CONNECT` to a path, so the
//! request head is read first and `CONNECT /api` is answered here before
//! hyper ever sees the stream.

use axum::http::StatusCode;
use axum::{Extension, Router};
use cogs_core::Peer;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::rest::{create_router, resolve_requester, status_code, AppState};
use crate::rpc::serve_tunnel;

/// Path the RPC tunnel is opened on
pub const API_PATH: &str = "/api";

/// Reply to an accepted tunnel, after which the stream carries RPC lines
pub const CONNECTED: &[u8] = b"HTTP/1.0 200 Connected to cogs\r\n\r\n";

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Longest `CONNECT` head accepted
const MAX_HEAD: usize = 8 * 1024;

/// Router and the state behind it, shared by every connection
#[derive(Clone)]
pub struct Api {
    router: Router,
    state: Arc<AppState>,
}

impl Api {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            router: create_router(state.clone()),
            state,
        }
    }
}

/// Bind a unix socket, replacing a stale socket file
pub fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    UnixListener::bind(path)
}

fn unix_peer(stream: &UnixStream) -> Peer {
    match stream.peer_cred() {
        Ok(cred) => Peer::Unix {
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
            uid: Some(cred.uid()),
        },
        Err(e) => {
            debug!(error = %e, "No peer credentials");
            Peer::Unix {
                pid: None,
                uid: None,
            }
        }
    }
}

/// Serve the API on a unix socket until shutdown is signalled
pub async fn serve_unix(listener: UnixListener, api: Api, mut shutdown: watch::Receiver<bool>) {
    info!(address = ?listener.local_addr().ok(), "Listening on unix socket");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let peer = unix_peer(&stream);
                    serve_connection(stream, api.clone(), peer);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept unix connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("Unix listener stopped");
}

/// Serve the API on a TCP socket until shutdown is signalled
pub async fn serve_tcp(listener: TcpListener, api: Api, mut shutdown: watch::Receiver<bool>) {
    info!(address = ?listener.local_addr().ok(), "Listening on TCP socket");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => serve_connection(stream, api.clone(), Peer::Tcp(addr)),
                Err(e) => {
                    warn!(error = %e, "Failed to accept TCP connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("TCP listener stopped");
}

fn serve_connection<S>(mut stream: S, api: Api, peer: Peer)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        debug!(peer = %peer, "Connection accepted");

        let (opening, unread) = match read_opening(&mut stream).await {
            Ok(opening) => opening,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to read request");
                return;
            }
        };
        let stream = Rewind::new(unread, stream);

        match opening {
            Opening::Connect(target) => open_tunnel(stream, &target, api.state, peer).await,
            Opening::Http => {
                let service = TowerToHyperService::new(api.router.layer(Extension(peer)));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(error = %e, "Connection closed with error");
                }
            }
        }
    });
}

/// How a connection starts
#[derive(Debug, PartialEq, Eq)]
enum Opening {
    /// A `CONNECT` request to the given target
    Connect(String),
    /// Anything else, left to hyper
    Http,
}

/// Read just enough of a connection to tell a `CONNECT` from other requests
///
/// Returns the bytes read but not consumed: the whole prefix for plain HTTP,
/// whatever followed the head for a `CONNECT`. Go clients end the head with
/// a bare `\n\n`, so both line endings are accepted.
async fn read_opening<S>(stream: &mut S) -> io::Result<(Opening, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let seen = head.len().min(CONNECT_PREFIX.len());
        if head[..seen] != CONNECT_PREFIX[..seen] {
            return Ok((Opening::Http, head));
        }

        if let Some(end) = head_end(&head) {
            let target = connect_target(&head[..end])?;
            let rest = head.split_off(end);
            return Ok((Opening::Connect(target), rest));
        }

        if head.len() > MAX_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT head too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok((Opening::Http, head));
        }
        head.extend_from_slice(&chunk[..n]);
    }
}

/// Offset just past the blank line ending a request head
fn head_end(buf: &[u8]) -> Option<usize> {
    (1..buf.len()).find_map(|i| {
        let blank = buf[i] == b'\n'
            && (buf[i - 1] == b'\n' || (i >= 2 && buf[i - 1] == b'\r' && buf[i - 2] == b'\n'));
        blank.then_some(i + 1)
    })
}

fn connect_target(head: &[u8]) -> io::Result<String> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    let line = std::str::from_utf8(line).map_err(|_| invalid("request line is not UTF-8"))?;

    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["CONNECT", target, version] if version.starts_with("HTTP/1.") => Ok(target.to_string()),
        _ => Err(invalid("malformed CONNECT request line")),
    }
}

/// Answer a `CONNECT` and serve RPC calls on the stream
async fn open_tunnel<S>(mut stream: S, target: &str, state: Arc<AppState>, peer: Peer)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if target != API_PATH {
        debug!(peer = %peer, target = target, "CONNECT to unknown path");
        reject(&mut stream, StatusCode::NOT_FOUND, "not found").await;
        return;
    }

    let owner = match resolve_requester(state.identity.as_ref(), &peer).await {
        Ok(owner) => owner,
        Err(e) => {
            reject(&mut stream, status_code(&e), &e.to_string()).await;
            return;
        }
    };

    if let Err(e) = stream.write_all(CONNECTED).await {
        debug!(peer = %peer, error = %e, "Tunnel closed before it opened");
        return;
    }

    serve_tunnel(stream, state, owner).await;
}

async fn reject<S>(stream: &mut S, status: StatusCode, message: &str)
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.0 {} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        message.len(),
        message
    );

    let written = async {
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    };
    if let Err(e) = written.await {
        debug!(error = %e, "Failed to reject tunnel");
    }
}

/// Stream with bytes already read from it put back in front
struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_unix_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("cogs.sock");

        let first = bind_unix(&path).unwrap();
        drop(first);
        assert!(path.exists());

        let _second = bind_unix(&path).unwrap();
        UnixStream::connect(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_request_is_replayed() {
        let request = b"GET /wait?gpu=1 HTTP/1.1\r\nhost: cogs\r\n\r\n".to_vec();
        let mut reader = std::io::Cursor::new(request.clone());

        let (opening, unread) = read_opening(&mut reader).await.unwrap();
        assert_eq!(opening, Opening::Http);

        let mut replayed = Vec::new();
        Rewind::new(unread, reader)
            .read_to_end(&mut replayed)
            .await
            .unwrap();
        assert_eq!(replayed, request);
    }

    #[tokio::test]
    async fn test_connect_head_is_consumed() {
        let mut reader =
            std::io::Cursor::new(b"CONNECT /api HTTP/1.0\r\n\r\n{\"id\":1}\n".to_vec());
        let (opening, unread) = read_opening(&mut reader).await.unwrap();
        assert_eq!(opening, Opening::Connect("/api".to_string()));
        assert_eq!(unread, b"{\"id\":1}\n");

        let mut go_style = std::io::Cursor::new(b"CONNECT /api HTTP/1.0\n\n".to_vec());
        let (opening, unread) = read_opening(&mut go_style).await.unwrap();
        assert_eq!(opening, Opening::Connect("/api".to_string()));
        assert!(unread.is_empty());

        let mut garbage = std::io::Cursor::new(b"CONNECT /api\r\n\r\n".to_vec());
        assert!(read_opening(&mut garbage).await.is_err());
    }

    #[test]
    fn test_head_end() {
        assert_eq!(head_end(b"CONNECT /api HTTP/1.0\r\n\r\nrest"), Some(25));
        assert_eq!(head_end(b"CONNECT /api HTTP/1.0\n\n"), Some(23));
        assert_eq!(head_end(b"CONNECT /api HTTP/1.0\r\n"), None);
    }

    #[tokio::test]
    async fn test_unix_peer_credentials() {
        let (a, _b) = UnixStream::pair().unwrap();
        match unix_peer(&a) {
            Peer::Unix { pid, uid } => {
                assert_eq!(pid, Some(std::process::id()));
                assert!(uid.is_some());
            }
            other => panic!("unexpected peer {:?}", other),
        }
    }
}
