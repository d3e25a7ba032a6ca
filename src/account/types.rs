//! Stored account records

use serde::{Deserialize, Serialize};

/// Marker for accounts whose key lives on an external signing device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    pub index: u32,
    pub driver: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub address: String,
    pub public_key: String,
    #[serde(default)]
    pub ledger: Option<HardwareInfo>,
}

impl AccountRecord {
    /// Check if signing requires an external device
    pub fn is_hardware(&self) -> bool {
        self.ledger.is_some()
    }
}
