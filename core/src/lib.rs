// BLE Central Core
//
// One shared central connection, many concurrent callers. Every request is
// tracked so it can be cancelled, and every notification is delivered to
// exactly one monitor.

pub mod arbiter;
pub mod central;
pub mod config;
pub mod error;
pub mod gatt_uuid;
mod pipeline;
pub mod records;
pub mod registry;
pub mod response;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use arbiter::{CharacteristicKey, NotificationArbiter};
pub use central::BleCentral;
pub use config::{CentralConfig, ConnectOptions};
pub use error::{BleError, ErrorPayload, TransportError};
pub use records::{CharacteristicRecord, DeviceRecord, ServiceRecord};
pub use response::{response_channel, Delivery, ResponseSink, ResponseStream};
pub use transport::{
    AdapterState, CentralTransport, CharacteristicInfo, CharacteristicProperties, Connection, Device, ScanResult,
    ScanStream, ServiceInfo, ServiceList, ValueStream,
};
