//! Backend configuration.

use bluer::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// LE address kind of the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeAddressType {
    #[default]
    Public,
    Random,
}

impl LeAddressType {
    /// The other address kind, tried once when the first is refused.
    pub fn alternate(self) -> Self {
        match self {
            LeAddressType::Public => LeAddressType::Random,
            LeAddressType::Random => LeAddressType::Public,
        }
    }
}

impl From<LeAddressType> for bluer::AddressType {
    fn from(kind: LeAddressType) -> Self {
        match kind {
            LeAddressType::Public => bluer::AddressType::LePublic,
            LeAddressType::Random => bluer::AddressType::LeRandom,
        }
    }
}

/// Which asynchronous push the peer is asked to send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// Fire-and-forget pushes.
    #[default]
    Notification,
    /// Pushes the link must confirm.
    Indication,
}

impl DeliveryKind {
    /// Client characteristic configuration value enabling this kind.
    pub fn cccd_value(self) -> u16 {
        match self {
            DeliveryKind::Notification => 0x0001,
            DeliveryKind::Indication => 0x0002,
        }
    }
}

/// Configuration of the exclusive ATT socket backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttConfig {
    /// Peer address.
    #[serde(with = "address_serde")]
    pub address: Address,
    /// Address kind tried first.
    pub address_type: LeAddressType,
    /// Value handle of the data characteristic.
    pub data_handle: u16,
    /// Offset from `data_handle` to its configuration descriptor.
    ///
    /// The handle layout is not discovered unless `discover_cccd` is set;
    /// this offset is an assumption about the peer's attribute table.
    pub cccd_offset: u16,
    /// Locate the configuration descriptor with Find Information instead of
    /// trusting `cccd_offset`.
    pub discover_cccd: bool,
    /// Push kind to enable.
    pub delivery: DeliveryKind,
    /// Connect timeout in milliseconds, covering both address kinds.
    pub connect_timeout_ms: u64,
    /// Wait for a response to any request, in milliseconds.
    pub response_timeout_ms: u64,
}

impl Default for AttConfig {
    fn default() -> Self {
        Self {
            address: Address::any(),
            address_type: LeAddressType::Public,
            data_handle: 0x000e,
            cccd_offset: 1,
            discover_cccd: false,
            delivery: DeliveryKind::Notification,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 5_000,
        }
    }
}

impl AttConfig {
    pub fn new(address: Address, data_handle: u16) -> Self {
        Self {
            address,
            data_handle,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Configuration of the BlueZ-mediated backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Adapter name such as `hci0`; the daemon's default adapter if unset.
    pub adapter: Option<String>,
    /// Peer address.
    #[serde(with = "address_serde")]
    pub address: Address,
    /// Restrict the characteristic search to this service.
    pub service: Option<Uuid>,
    /// Data characteristic.
    pub characteristic: Uuid,
    /// Timeout for resolving and connecting the device, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout for a single `WriteValue` call, in milliseconds.
    pub write_timeout_ms: u64,
    /// Ask the daemon to drop the device connection on disconnect.
    pub disconnect_on_close: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            address: Address::any(),
            service: None,
            characteristic: Uuid::nil(),
            connect_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            disconnect_on_close: false,
        }
    }
}

impl BusConfig {
    pub fn new(address: Address, characteristic: Uuid) -> Self {
        Self {
            address,
            characteristic,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Addresses are kept as `AA:BB:CC:DD:EE:FF` strings in config files.
mod address_serde {
    use bluer::Address;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &Address, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
