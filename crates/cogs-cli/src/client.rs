//! Connections to the daemon
//!
//! Plain requests go over HTTP/1.1, on a unix socket or TCP. The RPC tunnel
//! is an HTTP/1.0 `CONNECT /api` after which the stream carries RPC lines.

use anyhow::{anyhow, bail, Context, Result};
use cogs_core::rpc::{RpcRequest, RpcResponse};
use hyper::body::{Body as _, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines,
    ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

/// Where `cogsd` listens unless told otherwise
pub const DEFAULT_SERVER: &str = "unix:///var/run/cogs.sock";

/// Host header sent over unix sockets
const UNIX_HOST: &str = "cogs";

/// Longest tunnel reply head accepted
const MAX_HEAD: usize = 8 * 1024;

/// Byte stream to the daemon
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Daemon address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Server {
    /// `unix:///path/to/socket`
    Unix(PathBuf),
    /// `http://host:port`, stored as `host:port`
    Tcp(String),
}

impl Server {
    pub fn parse(address: &str) -> Result<Self> {
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("missing socket path in {}", address);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if let Some(rest) = address.strip_prefix("http://") {
            let authority = rest.trim_end_matches('/');
            if authority.is_empty() || authority.contains('/') {
                bail!("invalid server address {}", address);
            }
            return Ok(Self::Tcp(authority.to_string()));
        }

        bail!(
            "unsupported server address {} (expected unix:///path or http://host:port)",
            address
        )
    }
}

/// API client for communicating with the daemon
pub struct ApiClient {
    server: Server,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            http: reqwest::Client::new(),
        }
    }

    /// GET `path` and return the body, failing with the daemon's message on
    /// any non-success status
    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        debug!(server = ?self.server, path, "GET");

        match &self.server {
            Server::Tcp(authority) => {
                let response = self
                    .http
                    .get(format!("http://{}{}", authority, path))
                    .send()
                    .await
                    .with_context(|| format!("failed to reach {}", authority))?;
                let status = response.status().as_u16();
                let body = response.bytes().await?.to_vec();
                check(status, body)
            }
            Server::Unix(_) => {
                let stream = self.connect().await?;
                let response = request(stream, UNIX_HOST, Method::GET, path).await?;
                let status = response.status().as_u16();
                let body = collect(response.into_body()).await?;
                check(status, body)
            }
        }
    }

    /// Open an RPC tunnel
    pub async fn tunnel(&self) -> Result<Tunnel<Box<dyn Stream>>> {
        let mut stream = self.connect().await?;
        stream.write_all(b"CONNECT /api HTTP/1.0\r\n\r\n").await?;
        stream.flush().await?;

        let head = read_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| anyhow!("malformed tunnel reply: {}", status_line.trim()))?;

        if status != 200 {
            let mut body = Vec::new();
            stream.read_to_end(&mut body).await?;
            check(status, body)?;
            bail!("server refused the tunnel with status {}", status);
        }

        debug!(server = ?self.server, "Tunnel open");
        Ok(Tunnel::new(stream))
    }

    async fn connect(&self) -> Result<Box<dyn Stream>> {
        match &self.server {
            Server::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("failed to connect to {}", path.display()))?;
                Ok(Box::new(stream))
            }
            Server::Tcp(authority) => {
                let stream = TcpStream::connect(authority.as_str())
                    .await
                    .with_context(|| format!("failed to connect to {}", authority))?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Read a reply head without consuming anything after it
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut head = Vec::new();
    while !(head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n")) {
        if head.len() > MAX_HEAD {
            bail!("tunnel reply head too large");
        }
        let byte = stream
            .read_u8()
            .await
            .context("server closed the connection")?;
        head.push(byte);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Issue a single request on a fresh connection
async fn request<IO>(io: IO, host: &str, method: Method, uri: &str) -> Result<Response<Incoming>>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Connection closed with error");
        }
    });

    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(hyper::header::HOST, host)
        .body(String::new())?;
    Ok(sender.send_request(request).await?)
}

async fn collect(mut body: Incoming) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(frame) = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        if let Ok(chunk) = frame?.into_data() {
            data.extend_from_slice(&chunk);
        }
    }
    Ok(data)
}

fn check(status: u16, body: Vec<u8>) -> Result<Vec<u8>> {
    if (200..300).contains(&status) {
        return Ok(body);
    }
    let message = String::from_utf8_lossy(&body);
    bail!("server returned {}: {}", status, message.trim())
}

/// Client end of an RPC tunnel
pub struct Tunnel<IO> {
    lines: Lines<BufReader<ReadHalf<IO>>>,
    writer: WriteHalf<IO>,
    next_id: u64,
}

impl<IO> Tunnel<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    pub fn new(io: IO) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 0,
        }
    }

    /// Call `method` and wait for its result
    pub async fn call(&mut self, method: &str, params: impl Serialize) -> Result<Value> {
        self.next_id += 1;
        let request = RpcRequest::new(self.next_id, method, params)?;

        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("server closed the tunnel"))?;
        let response: RpcResponse =
            serde_json::from_str(&line).context("malformed reply from server")?;

        match response.error {
            Some(e) => Err(anyhow!("{} failed: {}", method, e)),
            None => Ok(response.result),
        }
    }
}
