//! Accelerator devices and telemetry observations

use serde::{Deserialize, Serialize};

/// Represents an accelerator device attached to this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Vendor UUID (e.g. "GPU-3b1c...")
    pub uuid: String,
    /// Logical group the device is assigned to
    #[serde(default)]
    pub group: String,
    /// Product name
    #[serde(default)]
    pub name: String,
    /// Product brand
    #[serde(default)]
    pub brand: String,
    /// Stable device index
    pub number: u32,
    /// Memory usage
    #[serde(default)]
    pub memory: u64,
    /// Utilization percentage (0-100)
    #[serde(default)]
    pub utilization: u32,
    /// Temperature in degrees Celsius
    #[serde(default)]
    pub temperature: u32,
}

impl Device {
    /// Create a device with identity fields set and zeroed metrics
    pub fn new(number: u32, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            number,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Copy the live metric fields from another sample of the same device
    pub fn update_metrics(&mut self, sample: &Device) {
        self.memory = sample.memory;
        self.utilization = sample.utilization;
        self.temperature = sample.temperature;
    }
}

/// A process observed on a device by the process feed
///
/// `pid == 0` means the feed reported no process at all for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub device_number: u32,
    pub pid: u32,
}

impl Claim {
    /// Whether this observation reports an idle device
    pub fn is_vacant(&self) -> bool {
        self.pid == 0
    }
}

/// Devices granted to a wait request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimStatus {
    pub devices: Vec<Device>,
}

impl ClaimStatus {
    /// Granted device numbers, in response order
    pub fn numbers(&self) -> Vec<u32> {
        self.devices.iter().map(|d| d.number).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_metrics_keeps_identity() {
        let mut device = Device::new(0, "GPU-a", "Tesla V100");
        let mut sample = Device::new(0, "GPU-other", "other");
        sample.memory = 2048;
        sample.utilization = 80;
        sample.temperature = 45;

        device.update_metrics(&sample);

        assert_eq!(device.uuid, "GPU-a");
        assert_eq!(device.name, "Tesla V100");
        assert_eq!(device.memory, 2048);
        assert_eq!(device.utilization, 80);
        assert_eq!(device.temperature, 45);
    }

    #[test]
    fn test_claim_status_from_client_payload() {
        let json = r#"{"devices":[{"uuid":"GPU-a","number":0},{"uuid":"GPU-b","number":3}]}"#;
        let status: ClaimStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.numbers(), vec![0, 3]);
    }

    #[test]
    fn test_vacant_claim() {
        assert!(Claim { device_number: 1, pid: 0 }.is_vacant());
        assert!(!Claim { device_number: 1, pid: 77 }.is_vacant());
    }
}
