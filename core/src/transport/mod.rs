// Transport module: collaborator interfaces for the BLE radio

pub mod abstraction;

pub use abstraction::{
    AdapterState, CentralTransport, CharacteristicInfo, CharacteristicProperties, Connection,
    Device, ScanResult, ScanStream, ServiceInfo, ServiceList, ValueStream,
};

#[cfg(test)]
pub use abstraction::MockCentralTransport;
