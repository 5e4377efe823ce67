//! Owner resolution for processes and connections
//!
//! A process is attributed to the owner of the container it runs in: the
//! first container label, in priority order, whose value is an email address.

use async_trait::async_trait;
use chrono::Utc;
use cogs_core::{CogsError, CogsResult, IdentityConfig, Peer, ProcessInfo};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::address::parse_address;
use crate::cache::TtlCache;
use crate::cgroup::{pid_to_command, pid_to_container};
use crate::docker::{ContainerRuntime, ContainerSummary};

/// Attribution of processes and connections to accountable owners
#[async_trait]
pub trait Identify: Send + Sync {
    /// Describe a process attached to a device
    ///
    /// Host processes and containers without an owner label yield an empty
    /// `owner`; a vanished process or a runtime failure is an error.
    async fn identify_process(&self, pid: u32) -> CogsResult<ProcessInfo>;

    /// Resolve the owner behind an API connection
    async fn identify_peer(&self, peer: &Peer) -> CogsResult<String>;
}

/// Resolver backed by `/proc` and a container runtime
pub struct IdentityResolver {
    /// Root of the proc filesystem
    proc_root: PathBuf,
    /// Container metadata source
    runtime: Arc<dyn ContainerRuntime>,
    /// Owners indexed by container ID
    owners: TtlCache<String, String>,
    /// Label keys holding the owner, highest priority first
    labels: Vec<String>,
}

impl IdentityResolver {
    /// Create a new resolver
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &IdentityConfig) -> Self {
        info!(
            runtime = runtime.name(),
            cache_ttl_secs = config.cache_ttl_secs,
            labels = ?config.owner_labels,
            "Identity resolver initialized"
        );

        Self {
            proc_root: config.proc_root.clone(),
            runtime,
            owners: TtlCache::new(Duration::from_secs(config.cache_ttl_secs)),
            labels: config.owner_labels.clone(),
        }
    }

    /// Resolve the owner of a container, using the cache when possible
    pub async fn find_owner(&self, container_id: &str) -> CogsResult<String> {
        if let Some(owner) = self.owners.get(&container_id.to_string()).await {
            return Ok(owner);
        }

        let containers = self.runtime.list_containers().await?;
        let container = containers
            .iter()
            .find(|c| c.matches_id(container_id))
            .ok_or_else(|| CogsError::ContainerNotFound(container_id.to_string()))?;

        let owner = self
            .owner_from_labels(container)
            .ok_or_else(|| CogsError::OwnerNotFound(container_id.to_string()))?;

        debug!(container = %container_id, owner = %owner, "Resolved container owner");
        self.owners
            .insert(container_id.to_string(), owner.clone())
            .await;

        Ok(owner)
    }

    /// Find the container attached to a network address
    pub async fn find_container(&self, address: IpAddr) -> CogsResult<String> {
        let containers = self.runtime.list_containers().await?;
        containers
            .into_iter()
            .find(|c| c.addresses.contains(&address))
            .map(|c| c.id)
            .ok_or_else(|| CogsError::ContainerNotFound(address.to_string()))
    }

    fn owner_from_labels(&self, container: &ContainerSummary) -> Option<String> {
        self.labels
            .iter()
            .filter_map(|key| container.labels.get(key))
            .find_map(|value| parse_address(value))
    }
}

#[async_trait]
impl Identify for IdentityResolver {
    async fn identify_process(&self, pid: u32) -> CogsResult<ProcessInfo> {
        let command = pid_to_command(&self.proc_root, pid).await?;

        let (context, owner) = match pid_to_container(&self.proc_root, pid).await {
            Ok(container) => match self.find_owner(&container).await {
                Ok(owner) => (container, owner),
                Err(e) if e.is_not_found() => {
                    debug!(pid = pid, container = %container, error = %e, "No owner for process");
                    (container, String::new())
                }
                Err(e) => return Err(e),
            },
            Err(CogsError::NotContainerized(_)) => (String::new(), String::new()),
            Err(e) => return Err(e),
        };

        Ok(ProcessInfo {
            pid,
            command,
            owner,
            context,
            duration: 0,
            observed_at: Some(Utc::now()),
        })
    }

    async fn identify_peer(&self, peer: &Peer) -> CogsResult<String> {
        let container = match peer {
            Peer::Unix { pid: Some(pid), .. } => pid_to_container(&self.proc_root, *pid).await?,
            Peer::Unix { pid: None, .. } => {
                return Err(CogsError::ProcessNotFound(0));
            }
            Peer::Tcp(addr) => self.find_container(addr.ip()).await?,
        };

        self.find_owner(&container).await
    }
}
