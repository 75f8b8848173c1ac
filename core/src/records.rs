//! Wire-friendly records handed to the dispatch layer.
//!
//! Field names are camelCase to match what host applications already
//! consume; characteristic values are base64 strings.

use crate::transport::{CharacteristicInfo, Device, ScanResult, ServiceInfo};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A device as seen by the caller (also used for scan results and
/// disconnect notifications)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Device address
    pub uuid: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub is_connectable: Option<bool>,
}

impl DeviceRecord {
    /// Record carrying only the address, used when the device directory no
    /// longer knows the device.
    pub fn from_address(address: &str) -> Self {
        Self {
            uuid: address.to_string(),
            name: None,
            rssi: None,
            is_connectable: None,
        }
    }

    pub fn from_device(device: &dyn Device) -> Self {
        Self {
            uuid: device.address(),
            name: device.name(),
            rssi: None,
            is_connectable: None,
        }
    }
}

impl From<ScanResult> for DeviceRecord {
    fn from(result: ScanResult) -> Self {
        Self {
            uuid: result.address,
            name: result.name,
            rssi: result.rssi,
            is_connectable: result.is_connectable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub uuid: Uuid,
    #[serde(rename = "deviceUUID")]
    pub device_uuid: String,
    pub is_primary: bool,
}

impl ServiceRecord {
    pub fn new(address: &str, service: &ServiceInfo) -> Self {
        Self {
            uuid: service.uuid,
            device_uuid: address.to_string(),
            is_primary: service.is_primary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicRecord {
    pub uuid: Uuid,
    #[serde(rename = "serviceUUID")]
    pub service_uuid: Uuid,
    #[serde(rename = "deviceUUID")]
    pub device_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub is_readable: bool,
    pub is_writable_with_response: bool,
    pub is_writable_without_response: bool,
    pub is_notifiable: bool,
    pub is_indicatable: bool,
    pub is_notifying: bool,
    /// Base64-encoded value, when one was read, written or notified
    pub value: Option<String>,
}

impl CharacteristicRecord {
    pub fn new(address: &str, characteristic: &CharacteristicInfo) -> Self {
        let props = characteristic.properties;
        Self {
            uuid: characteristic.uuid,
            service_uuid: characteristic.service_uuid,
            device_uuid: address.to_string(),
            transaction_id: None,
            is_readable: props.read,
            is_writable_with_response: props.write,
            is_writable_without_response: props.write_without_response,
            is_notifiable: props.notify,
            is_indicatable: props.indicate,
            is_notifying: characteristic.is_notifying,
            value: None,
        }
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = Some(BASE64_STANDARD.encode(value));
        self
    }

    pub fn with_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    /// Decode `value` back into bytes.
    pub fn value_bytes(&self) -> Option<Vec<u8>> {
        self.value
            .as_deref()
            .and_then(|v| BASE64_STANDARD.decode(v).ok())
    }
}

/// Decode a caller-supplied base64 write payload.
pub fn decode_value(raw: &str) -> Option<Vec<u8>> {
    BASE64_STANDARD.decode(raw.trim()).ok()
}
