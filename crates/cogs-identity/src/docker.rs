//! Container runtime access
//!
//! The resolver only needs a listing of running containers with their labels
//! and network addresses. `DockerClient` fetches it from the Docker Engine API
//! over its unix socket.

use async_trait::async_trait;
use cogs_core::{CogsError, CogsResult};
use hyper::body::Body as _;
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// A running container as seen by the resolver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Full container ID
    pub id: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Addresses on the container's attached networks
    pub addresses: Vec<IpAddr>,
}

impl ContainerSummary {
    /// Whether `id` names this container (full ID or unambiguous prefix)
    pub fn matches_id(&self, id: &str) -> bool {
        !id.is_empty() && self.id.starts_with(id)
    }
}

/// Source of container metadata
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers
    async fn list_containers(&self) -> CogsResult<Vec<ContainerSummary>>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}

/// Time allowed for one request unless configured otherwise
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Docker Engine API client speaking HTTP/1 over a unix socket
pub struct DockerClient {
    socket: PathBuf,
    timeout: Duration,
}

impl DockerClient {
    /// Create a client for the daemon listening on `socket`
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound each request, from connecting to the last body byte
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue a GET request and return the response body
    ///
    /// Callers may hold the state lock while waiting, so a daemon that
    /// accepts the connection but never answers must fail here.
    async fn get(&self, path: &str) -> CogsResult<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.fetch(path)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(path = path, timeout = ?self.timeout, "Docker API did not answer");
                Err(CogsError::Infrastructure(format!(
                    "docker did not answer {} within {:?}",
                    path, self.timeout
                )))
            }
        }
    }

    async fn fetch(&self, path: &str) -> CogsResult<Vec<u8>> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            CogsError::Infrastructure(format!(
                "cannot connect to {}: {}",
                self.socket.display(),
                e
            ))
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| CogsError::Infrastructure(format!("docker handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Docker connection closed with error");
            }
        });

        let request = Request::get(path)
            .header(HOST, "docker")
            .body(String::new())
            .map_err(|e| CogsError::Internal(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| CogsError::Infrastructure(format!("docker request failed: {}", e)))?;

        let status = response.status();
        let mut body = response.into_body();
        let mut data = Vec::new();
        while let Some(frame) =
            std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await
        {
            let frame = frame
                .map_err(|e| CogsError::Infrastructure(format!("docker body error: {}", e)))?;
            if let Ok(chunk) = frame.into_data() {
                data.extend_from_slice(&chunk);
            }
        }

        if status != StatusCode::OK {
            warn!(
                path = path,
                status = %status,
                "Docker API returned an error"
            );
            return Err(CogsError::Infrastructure(format!(
                "docker returned {} for {}",
                status, path
            )));
        }

        Ok(data)
    }
}

/// Subset of the `/containers/json` entry we use
#[derive(Debug, Deserialize)]
struct DockerContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: Option<DockerNetworkSettings>,
}

#[derive(Debug, Deserialize)]
struct DockerNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: Option<HashMap<String, DockerNetwork>>,
}

#[derive(Debug, Deserialize)]
struct DockerNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

impl From<DockerContainer> for ContainerSummary {
    fn from(container: DockerContainer) -> Self {
        let addresses = container
            .network_settings
            .and_then(|s| s.networks)
            .map(|networks| {
                networks
                    .values()
                    .filter_map(|n| n.ip_address.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: container.id,
            labels: container.labels.unwrap_or_default(),
            addresses,
        }
    }
}

/// Decode a `/containers/json` response body
pub fn parse_container_list(body: &[u8]) -> CogsResult<Vec<ContainerSummary>> {
    let containers: Vec<DockerContainer> = serde_json::from_slice(body)
        .map_err(|e| CogsError::Infrastructure(format!("invalid container list: {}", e)))?;
    Ok(containers.into_iter().map(ContainerSummary::from).collect())
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self) -> CogsResult<Vec<ContainerSummary>> {
        let body = self.get("/containers/json").await?;
        let containers = parse_container_list(&body)?;
        debug!(count = containers.len(), "Listed containers");
        Ok(containers)
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}
