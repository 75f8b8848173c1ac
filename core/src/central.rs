//! Central coordinator
//!
//! `BleCentral` owns every shared table (connection registry, transaction
//! registry, notification arbiter, active scans) and is the single entry
//! point the request-dispatch layer talks to. Each request is validated on
//! the caller's thread and then executed on a tokio task; results, errors and
//! stream items go back through the caller's [`ResponseSink`].
//!
//! Characteristic read/write/monitor live in `pipeline.rs`.

use crate::arbiter::NotificationArbiter;
use crate::config::CentralConfig;
use crate::error::BleError;
use crate::gatt_uuid;
use crate::records::{CharacteristicRecord, DeviceRecord, ServiceRecord};
use crate::registry::{
    CancellableHandle, ConnectionAttempt, ConnectionRegistry, KeyedRegistry, TransactionRegistry,
};
use crate::response::ResponseSink;
use crate::transport::{AdapterState, CentralTransport, Connection, Device};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Coordinator for one adapter's connections and transactions. Cheap to
/// clone; clones share all state.
#[derive(Clone)]
pub struct BleCentral {
    pub(crate) inner: Arc<CentralInner>,
}

pub(crate) struct CentralInner {
    pub(crate) transport: Arc<dyn CentralTransport>,
    pub(crate) config: CentralConfig,
    pub(crate) runtime: Handle,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) arbiter: NotificationArbiter,
    scans: KeyedRegistry<u64>,
    next_scan_id: AtomicU64,
    state_observer: Mutex<Option<ResponseSink<AdapterState>>>,
}

impl BleCentral {
    /// Create a coordinator that dispatches onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime; use
    /// [`with_runtime`](Self::with_runtime) otherwise.
    pub fn new(transport: Arc<dyn CentralTransport>, config: CentralConfig) -> Self {
        Self::with_runtime(transport, config, Handle::current())
    }

    /// Create a coordinator that dispatches onto `runtime`.
    pub fn with_runtime(transport: Arc<dyn CentralTransport>, config: CentralConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(CentralInner {
                transport,
                config,
                runtime,
                connections: ConnectionRegistry::new(),
                transactions: TransactionRegistry::new(),
                arbiter: NotificationArbiter::new(),
                scans: KeyedRegistry::new("scans"),
                next_scan_id: AtomicU64::new(1),
                state_observer: Mutex::new(None),
            }),
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    pub fn transactions(&self) -> &TransactionRegistry {
        &self.inner.transactions
    }

    pub fn arbiter(&self) -> &NotificationArbiter {
        &self.inner.arbiter
    }

    pub fn config(&self) -> &CentralConfig {
        &self.inner.config
    }

    /// Number of scans currently running
    pub fn active_scans(&self) -> usize {
        self.inner.scans.len()
    }

    // ========================================================================
    // ADAPTER STATE
    // ========================================================================

    pub fn state(&self, sink: ResponseSink<AdapterState>) {
        sink.resolve(self.inner.transport.state());
    }

    /// Stream adapter state changes to `sink` until replaced or shut down.
    pub fn monitor_state(&self, sink: ResponseSink<AdapterState>) {
        *self.inner.state_observer.lock() = Some(sink);
    }

    /// Entry point for the transport glue when the adapter changes state.
    pub fn handle_state_change(&self, state: AdapterState) {
        info!("Adapter state changed: {}", state);
        let observer = self.inner.state_observer.lock().clone();
        if let Some(observer) = observer {
            observer.emit(state);
        }
    }

    // ========================================================================
    // SCANNING
    // ========================================================================

    /// Start scanning. Scans run until `stop_scan` or `shutdown`; starting a
    /// second scan does not stop the first.
    pub fn start_device_scan(&self, filter: Option<Vec<String>>, sink: ResponseSink<DeviceRecord>) {
        let filter = match filter.as_deref().map(gatt_uuid::parse_all).transpose() {
            Ok(filter) => filter,
            Err(err) => {
                sink.reject(err);
                return;
            }
        };

        let scan_id = self.inner.next_scan_id.fetch_add(1, Ordering::Relaxed);
        let release_sink = sink.clone();
        let handle = CancellableHandle::new(move || {
            release_sink.complete();
        });
        self.inner.scans.install(scan_id, Arc::clone(&handle));
        info!("Scan {} started (filter: {:?})", scan_id, filter);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let token = handle.token();
            let started = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                started = inner.transport.scan(filter) => started,
            };

            let mut results = match started {
                Ok(results) => results,
                Err(err) => {
                    if handle.disarm() {
                        inner.scans.remove_if_owner(&scan_id, &handle);
                        sink.reject(err.into());
                    }
                    return;
                }
            };

            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = results.next() => item,
                };
                match item {
                    Some(Ok(result)) => {
                        sink.emit(DeviceRecord::from(result));
                    }
                    Some(Err(err)) => {
                        warn!("Scan {} failed: {}", scan_id, err);
                        if handle.disarm() {
                            inner.scans.remove_if_owner(&scan_id, &handle);
                            sink.reject(err.into());
                        }
                        break;
                    }
                    None => {
                        if handle.disarm() {
                            inner.scans.remove_if_owner(&scan_id, &handle);
                            sink.complete();
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Stop every running scan.
    pub fn stop_scan(&self, sink: ResponseSink<()>) {
        let stopped = self.inner.scans.cancel_all();
        debug!("Stopped {} scan(s)", stopped);
        sink.resolve(());
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    /// Connect to `address`. A pending attempt for the same address is
    /// superseded and its caller receives `Cancelled`.
    pub fn connect_to_device(&self, address: &str, sink: ResponseSink<DeviceRecord>) {
        let Some(device) = self.inner.transport.lookup_device(address) else {
            sink.reject(BleError::DeviceNotFound(address.to_string()));
            return;
        };

        let release = {
            let sink = sink.clone();
            let inner = Arc::downgrade(&self.inner);
            let address = address.to_string();
            move || {
                sink.reject(BleError::Cancelled);
                release_device(&inner, &address);
            }
        };
        let attempt = ConnectionAttempt::new(DeviceRecord::from_device(device.as_ref()), sink, release);
        self.inner.connections.begin_connect(&attempt);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let token = attempt.token();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = device.connect(&inner.config.connect) => result,
            };

            match result {
                Ok(connection) => {
                    if !inner.connections.complete_connect(&attempt, Arc::clone(&connection)) {
                        inner.close_link(attempt.address(), connection);
                    }
                }
                Err(err) => {
                    if inner.connections.fail_connect(&attempt, err.into()) {
                        release_device(&Arc::downgrade(&inner), attempt.address());
                    }
                }
            }
        });
    }

    /// Register `sink` to receive a device record on every disconnect.
    /// Replaces any previous observer.
    pub fn monitor_device_disconnect(&self, sink: ResponseSink<DeviceRecord>) {
        let transport = Arc::clone(&self.inner.transport);
        self.inner
            .connections
            .set_disconnect_observer(Some(Arc::new(move |address: &str| {
                let record = transport
                    .lookup_device(address)
                    .map(|device| DeviceRecord::from_device(device.as_ref()))
                    .unwrap_or_else(|| DeviceRecord::from_address(address));
                sink.emit(record);
            })));
    }

    /// Tear down the connection (or pending attempt) to `address`.
    pub fn disconnect_device(&self, address: &str, sink: ResponseSink<DeviceRecord>) {
        let Some(device) = self.inner.transport.lookup_device(address) else {
            sink.reject(BleError::DeviceNotFound(address.to_string()));
            return;
        };
        let record = DeviceRecord::from_device(device.as_ref());

        let cancelled = self.inner.transactions.cancel_device(address);
        if !cancelled.is_empty() {
            debug!("Cancelled {} transaction(s) on {}", cancelled.len(), address);
        }

        let outcome = self.inner.connections.disconnect(address);
        if !outcome.any() {
            sink.reject(BleError::DeviceNotConnected(address.to_string()));
            return;
        }

        match outcome.connection {
            Some(connection) => {
                self.inner.runtime.spawn(async move {
                    match connection.disconnect().await {
                        Ok(()) => sink.resolve(record),
                        Err(err) => sink.reject(err.into()),
                    };
                });
            }
            None => {
                sink.resolve(record);
            }
        }
    }

    /// Entry point for the transport glue when a link drops on its own.
    pub fn handle_device_disconnected(&self, address: &str) {
        info!("Device {} reported disconnected", address);
        self.inner.transactions.cancel_device(address);
        self.inner.connections.disconnect(address);
    }

    pub fn is_device_connected(&self, address: &str, sink: ResponseSink<bool>) {
        if self.inner.transport.lookup_device(address).is_none() {
            sink.reject(BleError::DeviceNotFound(address.to_string()));
            return;
        }
        let connected = self
            .inner
            .connections
            .get_connection(address)
            .map(|connection| connection.is_connected())
            .unwrap_or(false);
        sink.resolve(connected);
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    pub fn discover_services(&self, address: &str, sink: ResponseSink<Vec<ServiceRecord>>) {
        let connection = match self.inner.connected(address) {
            Ok(connection) => connection,
            Err(err) => {
                sink.reject(err);
                return;
            }
        };

        let address = address.to_string();
        self.inner.runtime.spawn(async move {
            match connection.discover_services().await {
                Ok(services) => {
                    let records = services
                        .services()
                        .iter()
                        .map(|service| ServiceRecord::new(&address, service))
                        .collect();
                    sink.resolve(records);
                }
                Err(err) => {
                    sink.reject(err.into());
                }
            }
        });
    }

    pub fn discover_characteristics(
        &self,
        address: &str,
        service_uuid: &str,
        sink: ResponseSink<Vec<CharacteristicRecord>>,
    ) {
        let validated = self
            .inner
            .connected(address)
            .and_then(|connection| Ok((connection, gatt_uuid::parse(service_uuid)?)));
        let (connection, service) = match validated {
            Ok(validated) => validated,
            Err(err) => {
                sink.reject(err);
                return;
            }
        };

        let address = address.to_string();
        self.inner.runtime.spawn(async move {
            let services = match connection.discover_services().await {
                Ok(services) => services,
                Err(err) => {
                    sink.reject(err.into());
                    return;
                }
            };
            match services.find_service(service) {
                Some(found) => {
                    let records = found
                        .characteristics
                        .iter()
                        .map(|characteristic| CharacteristicRecord::new(&address, characteristic))
                        .collect();
                    sink.resolve(records);
                }
                None => {
                    sink.reject(BleError::ServiceNotFound(service.to_string()));
                }
            }
        });
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Stop scans, cancel every attempt and transaction, drop every
    /// connection and detach all observers.
    pub fn shutdown(&self) {
        for connection in self.tear_down() {
            self.inner.close_link("(shutdown)", connection);
        }
    }

    /// Like [`shutdown`](Self::shutdown), but waits for every dropped link
    /// to finish disconnecting before returning.
    pub async fn shutdown_and_wait(&self) {
        let closes = self.tear_down().into_iter().map(|connection| async move {
            if let Err(err) = connection.disconnect().await {
                warn!("Failed to close link on shutdown: {}", err);
            }
        });
        futures::future::join_all(closes).await;
    }

    fn tear_down(&self) -> Vec<Arc<dyn Connection>> {
        let scans = self.inner.scans.cancel_all();
        let transactions = self.inner.transactions.cancel_all();
        self.inner.arbiter.clear();
        let connections = self.inner.connections.clear();
        self.inner.connections.set_disconnect_observer(None);
        if let Some(observer) = self.inner.state_observer.lock().take() {
            observer.complete();
        }

        info!(
            "Central shut down ({} scans, {} transactions, {} connections)",
            scans,
            transactions,
            connections.len()
        );
        connections
    }
}

impl CentralInner {
    /// Resolve `address` to its live connection, distinguishing an unknown
    /// device from a known but unconnected one.
    pub(crate) fn connected(&self, address: &str) -> Result<Arc<dyn Connection>, BleError> {
        self.device(address)?;
        self.connections
            .get_connection(address)
            .ok_or_else(|| BleError::DeviceNotConnected(address.to_string()))
    }

    pub(crate) fn device(&self, address: &str) -> Result<Arc<dyn Device>, BleError> {
        self.transport
            .lookup_device(address)
            .ok_or_else(|| BleError::DeviceNotFound(address.to_string()))
    }

    /// Close a link the registries no longer track.
    pub(crate) fn close_link(&self, address: &str, connection: Arc<dyn Connection>) {
        let address = address.to_string();
        self.runtime.spawn(async move {
            if let Err(err) = connection.disconnect().await {
                warn!("Failed to close link to {}: {}", address, err);
            }
        });
    }
}

/// Cleanup after a connection attempt is cancelled or fails: drop any
/// connection left for the address together with its transactions.
fn release_device(inner: &Weak<CentralInner>, address: &str) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(connection) = inner.connections.drop_connection(address) {
        inner.transactions.cancel_device(address);
        inner.close_link(address, connection);
    }
}
