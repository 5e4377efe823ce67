//! Device, claim and process state of the node

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cogs_core::{Claim, ClaimInfo, Device, DeviceStatus, NodeStatus, Subscriber};
use cogs_identity::Identify;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

/// Authoritative in-memory state, guarded by a single lock
pub struct StateStore {
    /// Devices keyed by UUID
    status: RwLock<NodeStatus>,
    /// Process owner resolution
    identity: Arc<dyn Identify>,
}

impl StateStore {
    /// Create a store seeded with the enumerated devices
    pub fn new(devices: Vec<Device>, identity: Arc<dyn Identify>) -> Self {
        info!(devices = devices.len(), "State store initialized");

        Self {
            status: RwLock::new(NodeStatus::from_devices(devices)),
            identity,
        }
    }

    /// Deep copy of the current state with durations filled in
    pub async fn snapshot(&self) -> NodeStatus {
        let mut snapshot = self.status.read().await.clone();
        snapshot.refresh_durations(Utc::now());
        snapshot
    }

    /// Copy fresh metrics onto the matching device
    pub async fn apply_device_update(&self, device: &Device) {
        let mut status = self.status.write().await;

        match status.devices.get_mut(&device.uuid) {
            Some(existing) => existing.info.update_metrics(device),
            None => {
                info!(uuid = %device.uuid, number = device.number, "Tracking new device");
                status
                    .devices
                    .insert(device.uuid.clone(), DeviceStatus::new(device.clone()));
            }
        }
    }

    /// Record which process the process feed saw on a device
    ///
    /// Holds the write lock across identity resolution. Never touches the
    /// claim itself.
    pub async fn apply_claim_observation(&self, claim: &Claim) {
        let mut status = self.status.write().await;

        let Some(device) = status.by_number_mut(claim.device_number) else {
            trace!(number = claim.device_number, "Observation for unknown device");
            return;
        };

        if claim.is_vacant() {
            if !device.processes.is_empty() {
                debug!(number = claim.device_number, "Device has no processes");
            }
            device.clear_processes();
            return;
        }

        match self.identity.identify_process(claim.pid).await {
            Ok(process) => {
                trace!(
                    number = claim.device_number,
                    pid = process.pid,
                    owner = %process.owner,
                    "Process observed"
                );
                device.upsert_process(process);
            }
            Err(e) if e.is_not_found() => {
                debug!(pid = claim.pid, error = %e, "Process vanished before it was identified");
            }
            Err(e) => {
                warn!(pid = claim.pid, error = %e, "Failed to identify process");
            }
        }
    }

    /// Find a device by its number
    pub async fn device_by_number(&self, number: u32) -> Option<Device> {
        self.status
            .read()
            .await
            .by_number(number)
            .map(|d| d.info.clone())
    }

    /// Number of tracked devices
    pub async fn device_count(&self) -> usize {
        self.status.read().await.devices.len()
    }

    /// Run `f` against the claims under the write lock
    pub async fn with_claims<R>(&self, f: impl FnOnce(&mut ClaimBook<'_>) -> R) -> R {
        let mut status = self.status.write().await;
        let mut book = ClaimBook {
            status: &mut *status,
            now: Utc::now(),
        };
        f(&mut book)
    }
}

/// Claim-level view of the state, only reachable through `with_claims`
pub struct ClaimBook<'a> {
    status: &'a mut NodeStatus,
    now: DateTime<Utc>,
}

impl ClaimBook<'_> {
    /// Time at which the lock was taken
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Numbers of unclaimed devices, ascending
    pub fn free_numbers(&self) -> Vec<u32> {
        self.status.free_numbers()
    }

    pub fn total(&self) -> usize {
        self.status.devices.len()
    }

    /// Claim on a device, `None` if no such device exists
    pub fn claim(&self, number: u32) -> Option<&ClaimInfo> {
        self.status.by_number(number).map(|d| &d.claim)
    }

    pub fn device(&self, number: u32) -> Option<&Device> {
        self.status.by_number(number).map(|d| &d.info)
    }

    /// All claims with their device numbers
    pub fn claims(&self) -> impl Iterator<Item = (u32, &ClaimInfo)> + '_ {
        self.status
            .devices
            .values()
            .map(|d| (d.info.number, &d.claim))
    }

    /// Grant a device to `user`, or free it with `None`
    ///
    /// Returns false if the device does not exist.
    pub fn set_claim(&mut self, number: u32, user: Option<&str>) -> bool {
        let now = self.now;
        let Some(device) = self.status.by_number_mut(number) else {
            return false;
        };

        match user {
            Some(user) => device.claim.grant(user, now),
            None => device.claim.clear(),
        }
        true
    }

    /// Note that process `pid` runs on a claimed device
    ///
    /// The process must already be recorded on the device, and it counts
    /// only if it belongs to the claimant or to nobody known. Host clients
    /// claim under a peer-derived identity while their processes carry no
    /// owner, so an unattributed process cannot be told apart from theirs.
    /// Returns true if the claim was not occupied before.
    pub fn mark_occupied(&mut self, number: u32, pid: u32) -> bool {
        let Some(device) = self.status.by_number_mut(number) else {
            return false;
        };
        if device.claim.is_free() || device.claim.occupied {
            return false;
        }

        let user = &device.claim.user;
        let attributed = device
            .processes
            .iter()
            .any(|p| p.pid == pid && (p.owner.is_empty() || p.owner == *user));
        if attributed {
            device.claim.occupied = true;
        }
        attributed
    }
}

#[async_trait]
impl Subscriber<Device> for StateStore {
    async fn handle(&self, event: &Device) {
        self.apply_device_update(event).await;
    }
}

#[async_trait]
impl Subscriber<Claim> for StateStore {
    async fn handle(&self, event: &Claim) {
        self.apply_claim_observation(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{devices, StaticIdentity};

    fn store(count: u32) -> StateStore {
        StateStore::new(devices(count), Arc::new(StaticIdentity))
    }

    fn observe(number: u32, pid: u32) -> Claim {
        Claim {
            device_number: number,
            pid,
        }
    }

    #[tokio::test]
    async fn test_snapshot_reflects_latest_metrics() {
        let store = store(2);

        let mut sample = Device::new(1, "GPU-0001", "");
        sample.utilization = 10;
        store.apply_device_update(&sample).await;
        sample.utilization = 80;
        sample.memory = 2048;
        sample.temperature = 45;
        store.apply_device_update(&sample).await;

        let snapshot = store.snapshot().await;
        let device = &snapshot.devices["GPU-0001"].info;
        assert_eq!(device.utilization, 80);
        assert_eq!(device.memory, 2048);
        assert_eq!(device.temperature, 45);
        assert_eq!(device.name, "Tesla T4");
    }

    #[tokio::test]
    async fn test_unknown_uuid_adds_device() {
        let store = store(1);
        store
            .apply_device_update(&Device::new(5, "GPU-new", "A100"))
            .await;

        assert_eq!(store.device_count().await, 2);
        let snapshot = store.snapshot().await;
        assert!(snapshot.devices["GPU-new"].claim.is_free());
        assert!(snapshot.devices["GPU-new"].processes.is_empty());
    }

    #[tokio::test]
    async fn test_observation_upserts_process() {
        let store = store(2);

        store.apply_claim_observation(&observe(0, 42)).await;
        store.apply_claim_observation(&observe(0, 42)).await;
        store.apply_claim_observation(&observe(0, 43)).await;

        let snapshot = store.snapshot().await;
        let processes = &snapshot.devices["GPU-0000"].processes;
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].pid, 42);
        assert_eq!(processes[0].owner, "alice@example.com");
        assert!(snapshot.devices["GPU-0001"].processes.is_empty());
    }

    #[tokio::test]
    async fn test_vacant_observation_keeps_claim() {
        let store = store(1);
        store
            .with_claims(|book| book.set_claim(0, Some("bob@example.com")))
            .await;
        store.apply_claim_observation(&observe(0, 42)).await;

        store.apply_claim_observation(&observe(0, 0)).await;

        let snapshot = store.snapshot().await;
        let status = &snapshot.devices["GPU-0000"];
        assert!(status.processes.is_empty());
        assert_eq!(status.claim.user, "bob@example.com");
    }

    #[tokio::test]
    async fn test_failed_identification_is_skipped() {
        let store = store(1);

        store
            .apply_claim_observation(&observe(0, StaticIdentity::VANISHED))
            .await;
        store
            .apply_claim_observation(&observe(0, StaticIdentity::BROKEN))
            .await;
        store.apply_claim_observation(&observe(9, 42)).await;

        let snapshot = store.snapshot().await;
        assert!(snapshot.devices["GPU-0000"].processes.is_empty());
    }

    #[tokio::test]
    async fn test_claim_book() {
        let store = store(3);

        let (granted, missing) = store
            .with_claims(|book| {
                (
                    book.set_claim(1, Some("carol@example.com")),
                    book.set_claim(7, Some("carol@example.com")),
                )
            })
            .await;
        assert!(granted);
        assert!(!missing);

        store
            .with_claims(|book| {
                assert_eq!(book.total(), 3);
                assert_eq!(book.free_numbers(), vec![0, 2]);
                assert_eq!(book.claim(1).unwrap().user, "carol@example.com");
                assert!(book.claim(7).is_none());
                assert_eq!(book.claims().filter(|(_, c)| !c.is_free()).count(), 1);

                book.set_claim(1, None);
                assert_eq!(book.free_numbers(), vec![0, 1, 2]);
            })
            .await;

        assert_eq!(store.device_by_number(2).await.unwrap().uuid, "GPU-0002");
        assert!(store.device_by_number(3).await.is_none());
    }

    #[tokio::test]
    async fn test_occupancy_follows_process_owner() {
        let store = store(2);
        store
            .with_claims(|book| {
                book.set_claim(0, Some("alice@example.com"));
                book.set_claim(1, Some("bob@example.com"));
            })
            .await;

        store
            .apply_claim_observation(&observe(0, StaticIdentity::STRANGER))
            .await;
        store
            .apply_claim_observation(&observe(1, StaticIdentity::HOST))
            .await;

        store
            .with_claims(|book| {
                // Unrecorded pids and other owners' processes do not count.
                assert!(!book.mark_occupied(0, 42));
                assert!(!book.mark_occupied(0, StaticIdentity::STRANGER));
                assert!(!book.claim(0).unwrap().occupied);

                assert!(book.mark_occupied(1, StaticIdentity::HOST));
                assert!(!book.mark_occupied(1, StaticIdentity::HOST));
            })
            .await;

        store.apply_claim_observation(&observe(0, 42)).await;
        store
            .with_claims(|book| assert!(book.mark_occupied(0, 42)))
            .await;
    }
}
