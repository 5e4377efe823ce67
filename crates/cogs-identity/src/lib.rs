//! cogs-identity: Ownership resolution
//!
//! This crate maps processes and API connections to accountable owners:
//! - `/proc` inspection to find a process's container
//! - Container label lookup through the Docker Engine API
//! - A TTL cache of resolved owners

pub mod address;
pub mod cache;
pub mod cgroup;
pub mod docker;
pub mod resolver;

pub use address::parse_address;
pub use cache::TtlCache;
pub use docker::{ContainerRuntime, ContainerSummary, DockerClient};
pub use resolver::{Identify, IdentityResolver};
