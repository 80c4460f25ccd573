//! Scan result bookkeeping.
//!
//! The radio stack reports every advertisement; we keep one entry per
//! connectable device until the scan window closes, then the gateway
//! reports the list through the uplink.

use heapless::{String, Vec};

use crate::ble::adv_parser::extract_device_name;
use crate::ble::address::Address;
use crate::config::{MAX_NAME_LEN, MAX_SCAN_RESULTS};

/// Advertising PDU type as reported by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvKind {
    ConnectableUndirected,
    ConnectableDirected,
    ScannableUndirected,
    NonConnectable,
    ScanResponse,
}

impl AdvKind {
    pub fn is_connectable(self) -> bool {
        matches!(self, AdvKind::ConnectableUndirected | AdvKind::ConnectableDirected)
    }
}

/// Information about a discovered peripheral.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScannedDevice {
    pub address: Address,
    /// Empty when the device did not advertise a name.
    pub name: String<MAX_NAME_LEN>,
    /// Received Signal Strength Indicator (dBm).
    pub rssi: i8,
}

/// Result of a single scan pass.
#[derive(Clone, Debug, Default)]
pub struct ScanResults {
    pub devices: Vec<ScannedDevice, MAX_SCAN_RESULTS>,
    names_found: usize,
}

impl ScanResults {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
            names_found: 0,
        }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.names_found = 0;
    }

    pub fn names_found(&self) -> usize {
        self.names_found
    }

    /// Record one advertisement. Returns `true` if a new device was added.
    pub fn on_advertisement(&mut self, address: Address, rssi: i8, kind: AdvKind, data: &[u8]) -> bool {
        if self.devices.is_full() || !kind.is_connectable() {
            return false;
        }
        // Avoid duplicates (same address).
        if self.devices.iter().any(|d| d.address == address) {
            return false;
        }

        let name = extract_device_name(data).unwrap_or_default();
        if !name.is_empty() {
            self.names_found += 1;
        }
        info!(
            "{}. {} {} {}",
            self.devices.len() + 1,
            address,
            rssi,
            name.as_str()
        );
        self.devices
            .push(ScannedDevice { address, name, rssi })
            .is_ok()
    }
}
