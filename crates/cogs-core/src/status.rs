//! Node, device, claim and process status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::Device;

/// Ownership of a device
///
/// An empty `user` means the device is free.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimInfo {
    /// Identity holding the claim
    pub user: String,
    /// Claim age in seconds
    pub duration: i64,
    /// When the claim was granted
    #[serde(skip)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Whether a process has been seen on the device since the grant
    #[serde(skip)]
    pub occupied: bool,
}

impl ClaimInfo {
    /// Whether nobody holds this device
    pub fn is_free(&self) -> bool {
        self.user.is_empty()
    }

    /// Assign the device to `user`
    pub fn grant(&mut self, user: &str, now: DateTime<Utc>) {
        self.user = user.to_string();
        self.duration = 0;
        self.claimed_at = Some(now);
        self.occupied = false;
    }

    /// Return the device to the free pool
    pub fn clear(&mut self) {
        *self = ClaimInfo::default();
    }
}

/// A process attached to a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Command line
    pub command: String,
    /// Accountable owner (empty if unknown)
    pub owner: String,
    /// Container ID, empty for host processes
    pub context: String,
    /// Seconds since the process was first observed on the device
    pub duration: i64,
    /// First observation time
    #[serde(skip)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// One device together with its claim and processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub info: Device,
    pub claim: ClaimInfo,
    pub processes: Vec<ProcessInfo>,
}

impl DeviceStatus {
    /// Fresh status with no claim and no processes
    pub fn new(info: Device) -> Self {
        Self {
            info,
            claim: ClaimInfo::default(),
            processes: Vec::new(),
        }
    }

    /// Insert a process, replacing an existing entry with the same pid
    ///
    /// A replaced entry keeps its first observation time.
    pub fn upsert_process(&mut self, mut process: ProcessInfo) {
        match self.processes.iter_mut().find(|p| p.pid == process.pid) {
            Some(existing) => {
                process.observed_at = existing.observed_at.or(process.observed_at);
                *existing = process;
            }
            None => self.processes.push(process),
        }
    }

    /// Forget every process attached to this device
    pub fn clear_processes(&mut self) {
        self.processes.clear();
    }
}

/// Full device, claim and process state of the node, keyed by device UUID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub devices: BTreeMap<String, DeviceStatus>,
}

impl NodeStatus {
    /// Build the initial state from an inventory of devices
    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| (d.uuid.clone(), DeviceStatus::new(d)))
            .collect();
        Self { devices }
    }

    /// Look up a device by its stable number
    pub fn by_number(&self, number: u32) -> Option<&DeviceStatus> {
        self.devices.values().find(|d| d.info.number == number)
    }

    /// Look up a device by its stable number for mutation
    pub fn by_number_mut(&mut self, number: u32) -> Option<&mut DeviceStatus> {
        self.devices.values_mut().find(|d| d.info.number == number)
    }

    /// Numbers of all unclaimed devices, ascending
    pub fn free_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .devices
            .values()
            .filter(|d| d.claim.is_free())
            .map(|d| d.info.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Recompute claim and process ages relative to `now`
    pub fn refresh_durations(&mut self, now: DateTime<Utc>) {
        for status in self.devices.values_mut() {
            status.claim.duration = status
                .claim
                .claimed_at
                .map(|t| (now - t).num_seconds())
                .unwrap_or(0);
            for process in &mut status.processes {
                process.duration = process
                    .observed_at
                    .map(|t| (now - t).num_seconds())
                    .unwrap_or(0);
            }
        }
    }
}
