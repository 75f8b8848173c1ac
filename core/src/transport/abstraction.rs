//! Transport abstraction layer
//!
//! Defines the collaborator interfaces the central core consumes: the device
//! directory and scanner (`CentralTransport`), per-device connection
//! establishment (`Device`) and the GATT operations of an established link
//! (`Connection`). Platform code (btleplug, CoreBluetooth, Android GATT)
//! implements these; the core never touches the radio directly.

use crate::config::ConnectOptions;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Infinite stream of advertisement reports.
pub type ScanStream = BoxStream<'static, Result<ScanResult, TransportError>>;

/// Infinite stream of characteristic values from a notify/indicate subscription.
pub type ValueStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// State of the local BLE adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "Unknown"),
            AdapterState::Resetting => write!(f, "Resetting"),
            AdapterState::Unsupported => write!(f, "Unsupported"),
            AdapterState::Unauthorized => write!(f, "Unauthorized"),
            AdapterState::PoweredOff => write!(f, "PoweredOff"),
            AdapterState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// A single advertisement report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Stable device address
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Whether the advertisement was connectable, if the platform reports it
    pub is_connectable: Option<bool>,
}

/// GATT characteristic property flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Whether the CCCD currently has notifications enabled
    pub is_notifying: bool,
}

/// A discovered service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Result of service discovery on a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceList {
    services: Vec<ServiceInfo>,
}

impl ServiceList {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    pub fn find_service(&self, service: Uuid) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.uuid == service)
    }

    /// Look up a characteristic by its (service, characteristic) UUID pair.
    /// Duplicate service instances are searched in discovery order.
    pub fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Device directory and scanner of the local adapter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CentralTransport: Send + Sync {
    /// Resolve an address to a known device. Must not block on the radio.
    fn lookup_device(&self, address: &str) -> Option<Arc<dyn Device>>;

    /// Start scanning; dropping the returned stream stops the scan.
    async fn scan(&self, filter: Option<Vec<Uuid>>) -> Result<ScanStream, TransportError>;

    /// Current adapter state
    fn state(&self) -> AdapterState;
}

/// A remote peripheral known to the adapter.
#[async_trait]
pub trait Device: Send + Sync {
    fn address(&self) -> String;

    fn name(&self) -> Option<String>;

    /// Establish a link. Resolves once the link is usable; dropping the
    /// future abandons the attempt.
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An established, usable link to a device.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn discover_services(&self) -> Result<ServiceList, TransportError>;

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>, TransportError>;

    /// Write a value, returning the value as acknowledged by the stack.
    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> Result<Vec<u8>, TransportError>;

    /// Enable notifications and stream values. Dropping the stream
    /// unsubscribes.
    async fn monitor(&self, characteristic: &CharacteristicInfo) -> Result<ValueStream, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt_uuid::from_short;

    fn heart_rate() -> ServiceList {
        let measurement = CharacteristicInfo {
            uuid: from_short(0x2A37),
            service_uuid: from_short(0x180D),
            properties: CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
            is_notifying: false,
        };
        ServiceList::new(vec![
            ServiceInfo {
                uuid: from_short(0x1800),
                is_primary: true,
                characteristics: vec![],
            },
            ServiceInfo {
                uuid: from_short(0x180D),
                is_primary: true,
                characteristics: vec![measurement],
            },
        ])
    }

    #[test]
    fn test_find_characteristic_by_pair() {
        let list = heart_rate();
        let found = list.find_characteristic(from_short(0x180D), from_short(0x2A37));
        assert!(found.is_some());
        assert!(found.unwrap().properties.notify);
    }

    #[test]
    fn test_characteristic_scoped_to_service() {
        let list = heart_rate();
        assert!(list.find_characteristic(from_short(0x1800), from_short(0x2A37)).is_none());
        assert!(list.find_service(from_short(0x180F)).is_none());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_adapter_state_display() {
        assert_eq!(AdapterState::PoweredOn.to_string(), "PoweredOn");
        assert_eq!(AdapterState::Unauthorized.to_string(), "Unauthorized");
    }
}
