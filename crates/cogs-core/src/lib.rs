//! cogs-core: Core types for the cogs claim broker
//!
//! This crate provides the fundamental types used throughout cogs:
//! - Device, claim, process and node status types
//! - Configuration types
//! - Error handling
//! - The in-process event bus
//! - RPC tunnel wire types

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod peer;
pub mod rpc;
pub mod status;

pub use bus::{EventBus, Subscriber, Topic};
pub use config::*;
pub use device::*;
pub use error::*;
pub use peer::Peer;
pub use status::*;
