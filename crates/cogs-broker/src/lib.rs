//! cogs-broker: Device state and claim admission for cogs
//!
//! This crate owns the authoritative node state and the claim logic on top of it:
//! - The device/claim/process state store
//! - Device placement decisions
//! - Admission control with waits, releases and the grace sweeper

pub mod broker;
pub mod placement;
pub mod store;

pub use broker::{ClaimBroker, Wait};
pub use placement::{LowestNumberFirst, PlacementStrategy};
pub use store::{ClaimBook, StateStore};

use cogs_core::EventBus;
use std::sync::Arc;

/// Register the store and broker on the bus
///
/// The store is subscribed first so that a woken claim already sees the
/// state produced by the event that woke it.
pub async fn subscribe(bus: &EventBus, store: Arc<StateStore>, broker: Arc<ClaimBroker>) {
    bus.device_updated.subscribe(store.clone()).await;
    bus.claim_observed.subscribe(store).await;
    bus.device_updated.subscribe(broker.clone()).await;
    bus.claim_observed.subscribe(broker).await;
}
