//! BLE adapter capability
//!
//! The gateway never talks to a radio directly. Everything it needs from the
//! BLE stack (scanning, connecting, GATT discovery, reads, writes,
//! subscriptions) goes through the [`BleAdapter`] trait, so the lifecycle
//! logic can run against real hardware (`btleplug` in the CLI) or against
//! [`SimulatedAdapter`].

pub mod simulated;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::normalize;

pub use simulated::SimulatedAdapter;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failure reported by an adapter implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(String),
    #[error("operation not permitted: {0}")]
    NotPermitted(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Backend(String),
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// Radio-level connection state of a peripheral
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Disconnected => write!(f, "disconnected"),
            RadioState::Connecting => write!(f, "connecting"),
            RadioState::Connected => write!(f, "connected"),
        }
    }
}

/// A peripheral observed through discovery ("node" on the HTTP side)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Device address, compared with [`normalize::equal`]
    pub address: String,
    /// `public`, `random` or `unknown`
    pub address_type: String,
    /// Whether the advertisement allows connections
    pub connectable: bool,
    /// Advertised local name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    /// Advertised service UUIDs
    #[serde(default)]
    pub service_uuids: Vec<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Raw manufacturer data, lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer_data: Option<String>,
    /// Last radio state reported by the adapter; not part of the JSON view
    #[serde(skip)]
    pub state: RadioState,
}

impl Node {
    /// Create a connectable node with only an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            address_type: "unknown".to_string(),
            connectable: true,
            local_name: None,
            service_uuids: Vec::new(),
            rssi: None,
            manufacturer_data: None,
            state: RadioState::Disconnected,
        }
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_service_uuids(mut self, uuids: Vec<String>) -> Self {
        self.service_uuids = uuids;
        self
    }

    pub fn with_manufacturer_data(mut self, data: &[u8]) -> Self {
        self.manufacturer_data = Some(hex::encode(data));
        self
    }

    /// Whether this node has the given address, ignoring case and separators.
    pub fn has_address(&self, address: &str) -> bool {
        normalize::equal(&self.address, address)
    }
}

/// Operations a characteristic supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: String,
}

impl ServiceInfo {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self { uuid: uuid.into() }
    }
}

/// A discovered characteristic, tagged with the service that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: String,
    #[serde(skip_serializing, default)]
    pub service_uuid: String,
    pub properties: Vec<Operation>,
}

impl CharacteristicInfo {
    pub fn new(
        service_uuid: impl Into<String>,
        uuid: impl Into<String>,
        properties: Vec<Operation>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            service_uuid: service_uuid.into(),
            properties,
        }
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.properties.contains(&operation)
    }

    /// Whether the characteristic can push values (notify or indicate).
    pub fn can_push(&self) -> bool {
        self.supports(Operation::Notify) || self.supports(Operation::Indicate)
    }

    /// Reference used for adapter calls on this characteristic.
    pub fn reference(&self, address: &str) -> CharacteristicRef {
        CharacteristicRef {
            address: address.to_string(),
            service_uuid: self.service_uuid.clone(),
            uuid: self.uuid.clone(),
        }
    }
}

/// Everything one combined discovery round trip returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattCatalog {
    /// Services in discovery order
    pub services: Vec<ServiceInfo>,
    /// Characteristics in discovery order, across all services
    pub characteristics: Vec<CharacteristicInfo>,
}

impl GattCatalog {
    /// First characteristic with a matching UUID, optionally restricted to
    /// one owning service.
    ///
    /// Without a service filter the first match in discovery order wins even
    /// if several services carry the same characteristic UUID.
    pub fn find_characteristic(
        &self,
        characteristic_uuid: &str,
        service_uuid: Option<&str>,
    ) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| {
            normalize::equal(&c.uuid, characteristic_uuid)
                && service_uuid.map_or(true, |s| normalize::equal(&c.service_uuid, s))
        })
    }

    /// Characteristics owned by one service.
    pub fn characteristics_of(&self, service_uuid: &str) -> Vec<CharacteristicInfo> {
        self.characteristics
            .iter()
            .filter(|c| normalize::equal(&c.service_uuid, service_uuid))
            .cloned()
            .collect()
    }
}

/// Address of one characteristic on one peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub address: String,
    pub service_uuid: String,
    pub uuid: String,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.address, self.service_uuid, self.uuid)
    }
}

/// Events pushed by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The radio became usable
    PoweredOn,
    /// The radio went away
    PoweredOff,
    /// An advertisement was received
    Discovered(Node),
    /// A connection to the address was established
    Connected(String),
    /// The address is no longer connected, for any reason
    Disconnected(String),
}

/// Notification and indication payloads of one subscription
pub type ValueStream = BoxStream<'static, Result<Vec<u8>, AdapterError>>;

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// BLE stack abstraction consumed by the gateway
///
/// Only one adapter instance exists per process. Addresses passed in are the
/// addresses the adapter itself reported in [`AdapterEvent::Discovered`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Start scanning; `service_filter` empty means every advertiser.
    async fn start_scan(
        &self,
        service_filter: &[String],
        allow_duplicates: bool,
    ) -> Result<(), AdapterError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Subscribe to adapter events. Each call returns an independent receiver.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Current radio state of a peripheral.
    async fn radio_state(&self, address: &str) -> RadioState;

    /// Establish a connection.
    async fn connect(&self, address: &str) -> Result<(), AdapterError>;

    /// Tear a connection down.
    async fn disconnect(&self, address: &str) -> Result<(), AdapterError>;

    /// Discover all services and all characteristics in one round trip.
    async fn discover_all(&self, address: &str) -> Result<GattCatalog, AdapterError>;

    /// Read a characteristic value.
    async fn read(&self, target: &CharacteristicRef) -> Result<Vec<u8>, AdapterError>;

    /// Write a characteristic value; `no_ack` selects write-without-response.
    async fn write(
        &self,
        target: &CharacteristicRef,
        data: &[u8],
        no_ack: bool,
    ) -> Result<(), AdapterError>;

    /// Subscribe to notifications or indications, whichever the adapter picks.
    async fn subscribe(&self, target: &CharacteristicRef) -> Result<ValueStream, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> GattCatalog {
        GattCatalog {
            services: vec![ServiceInfo::new("180F"), ServiceInfo::new("FFF0")],
            characteristics: vec![
                CharacteristicInfo::new("180F", "2A19", vec![Operation::Read, Operation::Notify]),
                CharacteristicInfo::new("FFF0", "2A19", vec![Operation::Write]),
                CharacteristicInfo::new("FFF0", "FFF1", vec![Operation::Indicate]),
            ],
        }
    }

    #[test]
    fn test_find_characteristic_first_match_wins() {
        let catalog = catalog();
        let found = catalog.find_characteristic("2a19", None).unwrap();
        assert_eq!(found.service_uuid, "180F");
    }

    #[test]
    fn test_find_characteristic_with_service_filter() {
        let catalog = catalog();
        let found = catalog.find_characteristic("2A19", Some("fff0")).unwrap();
        assert_eq!(found.service_uuid, "FFF0");
        assert!(found.supports(Operation::Write));
        assert!(catalog.find_characteristic("FFF1", Some("180f")).is_none());
        assert!(catalog.find_characteristic("dead", None).is_none());
    }

    #[test]
    fn test_characteristics_of_service() {
        let catalog = catalog();
        let items = catalog.characteristics_of("fff0");
        assert_eq!(items.len(), 2);
        assert!(items[1].can_push());
        assert!(catalog.characteristics_of("1800").is_empty());
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::new("C0:AB:2A:6A:1A:89")
            .with_local_name("sensor")
            .with_rssi(-60)
            .with_manufacturer_data(&[0x4c, 0x00, 0x02]);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "address": "C0:AB:2A:6A:1A:89",
                "addressType": "unknown",
                "connectable": true,
                "localName": "sensor",
                "serviceUuids": [],
                "rssi": -60,
                "manufacturerData": "4c0002",
            })
        );
        assert!(node.has_address("c0ab2a6a1a89"));
    }

    #[test]
    fn test_item_json_omits_service() {
        let item = CharacteristicInfo::new(
            "180f",
            "2a19",
            vec![Operation::Read, Operation::WriteWithoutResponse],
        );
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"uuid": "2a19", "properties": ["read", "writeWithoutResponse"]})
        );
    }
}
