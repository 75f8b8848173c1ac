//! In-memory transport for tests.
//!
//! Devices, connections and notification sources are driven by hand: tests
//! push scan results, open connection gates, hold writes and publish
//! notifications exactly when an interleaving needs them.

use crate::config::ConnectOptions;
use crate::error::TransportError;
use crate::gatt_uuid::from_short;
use crate::transport::{
    AdapterState, CentralTransport, CharacteristicInfo, CharacteristicProperties, Connection, Device, ScanResult,
    ScanStream, ServiceInfo, ServiceList, ValueStream,
};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

type ValueSender = UnboundedSender<Result<Vec<u8>, TransportError>>;

/// Wait until `gate` is open.
async fn pass(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct MockTransport {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    state: Mutex<AdapterState>,
    scanners: Mutex<Vec<UnboundedSender<Result<ScanResult, TransportError>>>>,
    scan_filters: Mutex<Vec<Option<Vec<Uuid>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            state: Mutex::new(AdapterState::PoweredOn),
            scanners: Mutex::new(Vec::new()),
            scan_filters: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device(self, device: Arc<MockDevice>) -> Self {
        self.add_device(device);
        self
    }

    pub fn add_device(&self, device: Arc<MockDevice>) {
        self.devices.lock().insert(device.address.clone(), device);
    }

    /// Forget a device; later lookups report it as unknown.
    pub fn remove_device(&self, address: &str) -> Option<Arc<MockDevice>> {
        self.devices.lock().remove(address)
    }

    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
    }

    /// Deliver an advertisement to every open scan. Returns how many scans
    /// received it.
    pub fn advertise(&self, result: ScanResult) -> usize {
        let mut scanners = self.scanners.lock();
        scanners.retain(|tx| tx.unbounded_send(Ok(result.clone())).is_ok());
        scanners.len()
    }

    /// Scans whose stream is still held by a consumer
    pub fn open_scans(&self) -> usize {
        let mut scanners = self.scanners.lock();
        scanners.retain(|tx| !tx.is_closed());
        scanners.len()
    }

    /// Filters passed to every `scan` call so far
    pub fn scan_filters(&self) -> Vec<Option<Vec<Uuid>>> {
        self.scan_filters.lock().clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CentralTransport for MockTransport {
    fn lookup_device(&self, address: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .get(address)
            .map(|device| Arc::clone(device) as Arc<dyn Device>)
    }

    async fn scan(&self, filter: Option<Vec<Uuid>>) -> Result<ScanStream, TransportError> {
        self.scan_filters.lock().push(filter);
        let (tx, rx) = unbounded();
        self.scanners.lock().push(tx);
        Ok(Box::pin(rx))
    }

    fn state(&self) -> AdapterState {
        *self.state.lock()
    }
}

// ============================================================================
// DEVICE
// ============================================================================

pub struct MockDevice {
    address: String,
    name: Option<String>,
    connection: Arc<MockConnection>,
    connect_gate: watch::Sender<bool>,
    connect_error: Mutex<Option<TransportError>>,
    connect_calls: AtomicUsize,
}

impl MockDevice {
    /// A device that connects immediately and exposes `services`.
    pub fn new(address: &str, name: Option<&str>, services: ServiceList) -> Arc<Self> {
        let (connect_gate, _) = watch::channel(true);
        Arc::new(Self {
            address: address.to_string(),
            name: name.map(str::to_string),
            connection: Arc::new(MockConnection::new(services)),
            connect_gate,
            connect_error: Mutex::new(None),
            connect_calls: AtomicUsize::new(0),
        })
    }

    pub fn connection(&self) -> Arc<MockConnection> {
        Arc::clone(&self.connection)
    }

    /// Make subsequent connects wait until [`open_connect`](Self::open_connect).
    pub fn hold_connect(&self) {
        self.connect_gate.send_replace(false);
    }

    pub fn open_connect(&self) {
        self.connect_gate.send_replace(true);
    }

    /// Make subsequent connects fail with `error` (or succeed again with `None`).
    pub fn fail_connect(&self, error: Option<TransportError>) {
        *self.connect_error.lock() = error;
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Device for MockDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self, _options: &ConnectOptions) -> Result<Arc<dyn Connection>, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.connect_gate).await;
        let error = self.connect_error.lock().clone();
        if let Some(error) = error {
            return Err(error);
        }
        self.connection.connected.store(true, Ordering::SeqCst);
        Ok(Arc::clone(&self.connection) as Arc<dyn Connection>)
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct MockConnection {
    services: ServiceList,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>, bool)>>,
    write_gate: watch::Sender<bool>,
    subscribers: Mutex<HashMap<Uuid, Vec<ValueSender>>>,
    connected: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockConnection {
    fn new(services: ServiceList) -> Self {
        let (write_gate, _) = watch::channel(true);
        Self {
            services,
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            write_gate,
            subscribers: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Value returned by reads of `characteristic`
    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.values.lock().insert(characteristic, value.to_vec());
    }

    /// Make subsequent writes wait until [`open_writes`](Self::open_writes).
    pub fn hold_writes(&self) {
        self.write_gate.send_replace(false);
    }

    pub fn open_writes(&self) {
        self.write_gate.send_replace(true);
    }

    /// Every completed write as (characteristic, value, with_response)
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>, bool)> {
        self.writes.lock().clone()
    }

    /// Publish a notification to every live subscription on
    /// `characteristic`. Returns how many subscriptions received it.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&characteristic) else {
            return 0;
        };
        senders.retain(|tx| tx.unbounded_send(Ok(value.to_vec())).is_ok());
        senders.len()
    }

    /// Fail every subscription on `characteristic` and end their streams.
    pub fn fail_monitors(&self, characteristic: Uuid, error: TransportError) {
        let senders = self.subscribers.lock().remove(&characteristic).unwrap_or_default();
        for tx in senders {
            let _ = tx.unbounded_send(Err(error.clone()));
        }
    }

    /// Subscriptions whose stream is still held by a consumer
    pub fn subscriber_count(&self, characteristic: Uuid) -> usize {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(&characteristic) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn discover_services(&self) -> Result<ServiceList, TransportError> {
        Ok(self.services.clone())
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> Result<Vec<u8>, TransportError> {
        Ok(self
            .values
            .lock()
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> Result<Vec<u8>, TransportError> {
        pass(&self.write_gate).await;
        self.writes
            .lock()
            .push((characteristic.uuid, value.to_vec(), with_response));
        self.values.lock().insert(characteristic.uuid, value.to_vec());
        Ok(value.to_vec())
    }

    async fn monitor(&self, characteristic: &CharacteristicInfo) -> Result<ValueStream, TransportError> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .entry(characteristic.uuid)
            .or_default()
            .push(tx);
        Ok(Box::pin(rx))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub const HEART_RATE_SERVICE: u32 = 0x180D;
pub const HEART_RATE_MEASUREMENT: u32 = 0x2A37;
pub const GENERIC_ACCESS_SERVICE: u32 = 0x1800;
pub const DEVICE_NAME: u32 = 0x2A00;

/// A heart rate monitor: Generic Access with a readable Device Name, and a
/// Heart Rate service whose measurement can be read, written and notified.
pub fn heart_rate_monitor(address: &str) -> Arc<MockDevice> {
    let generic_access = ServiceInfo {
        uuid: from_short(GENERIC_ACCESS_SERVICE),
        is_primary: true,
        characteristics: vec![CharacteristicInfo {
            uuid: from_short(DEVICE_NAME),
            service_uuid: from_short(GENERIC_ACCESS_SERVICE),
            properties: CharacteristicProperties {
                read: true,
                ..Default::default()
            },
            is_notifying: false,
        }],
    };
    let heart_rate = ServiceInfo {
        uuid: from_short(HEART_RATE_SERVICE),
        is_primary: true,
        characteristics: vec![CharacteristicInfo {
            uuid: from_short(HEART_RATE_MEASUREMENT),
            service_uuid: from_short(HEART_RATE_SERVICE),
            properties: CharacteristicProperties {
                read: true,
                write: true,
                notify: true,
                ..Default::default()
            },
            is_notifying: false,
        }],
    };
    MockDevice::new(address, Some("HRM"), ServiceList::new(vec![generic_access, heart_rate]))
}
