//! Inventory blob model.
//!
//! Agents report hardware as a JSON document; the state layer stores it
//! opaquely and only this crate parses it.

use serde::{Deserialize, Serialize};

use crate::HardwareError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub physical_bytes: u64,
    #[serde(default)]
    pub usable_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Disk {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub drive_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub name: String,
    /// Addresses in CIDR notation, e.g. `1.2.3.4/24`.
    #[serde(default)]
    pub ipv4_addresses: Vec<String>,
}

/// Parse a raw inventory blob.
pub fn parse_inventory(raw: &str) -> Result<Inventory, HardwareError> {
    serde_json::from_str(raw).map_err(|e| HardwareError::InvalidInventory(e.to_string()))
}
