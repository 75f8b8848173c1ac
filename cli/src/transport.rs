// btleplug-backed transport for the desktop CLI
//
// Peripherals are cached by address as the adapter reports them, so the
// core's synchronous device lookup never touches the radio.

use async_trait::async_trait;
use blecentral_core::{
    AdapterState, BleCentral, CentralTransport, CharacteristicInfo, CharacteristicProperties, ConnectOptions,
    Connection, Device, ScanResult, ScanStream, ServiceInfo, ServiceList, TransportError, ValueStream,
};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(300);

type DeviceCache = Arc<Mutex<HashMap<String, Arc<BtleDevice>>>>;

fn transport_error(address: &str, err: btleplug::Error) -> TransportError {
    match err {
        btleplug::Error::NotConnected => TransportError::DeviceNotConnected(address.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

/// Cache `peripheral` and describe it as an advertisement report.
async fn remember(devices: &DeviceCache, peripheral: Peripheral) -> ScanResult {
    let properties = peripheral.properties().await.ok().flatten();
    let address = peripheral.address().to_string();
    let name = properties.as_ref().and_then(|p| p.local_name.clone());
    let rssi = properties.as_ref().and_then(|p| p.rssi);

    let mut devices = devices.lock();
    match devices.get(&address) {
        Some(device) => device.update_name(name.clone()),
        None => {
            devices.insert(
                address.clone(),
                Arc::new(BtleDevice {
                    peripheral,
                    address: address.clone(),
                    name: Mutex::new(name.clone()),
                }),
            );
        }
    }

    ScanResult {
        address,
        name,
        rssi,
        is_connectable: None,
    }
}

fn characteristic_info(characteristic: &Characteristic) -> CharacteristicInfo {
    let flags = characteristic.properties;
    CharacteristicInfo {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        properties: CharacteristicProperties {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        },
        is_notifying: false,
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct BtleTransport {
    adapter: Adapter,
    devices: DeviceCache,
    active_scans: Arc<AtomicUsize>,
}

impl BtleTransport {
    pub async fn open(adapter_index: usize) -> anyhow::Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter at index {}", adapter_index))?;
        info!(
            "Using adapter {}",
            adapter.adapter_info().await.unwrap_or_else(|_| "(unknown)".to_string())
        );

        Ok(Arc::new(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            active_scans: Arc::new(AtomicUsize::new(0)),
        }))
    }

    /// Make sure `address` is in the device cache, scanning for up to
    /// `timeout` if the adapter does not know it yet.
    pub async fn discover(&self, address: &str, timeout: Duration) -> anyhow::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut scanning = false;
        let found = loop {
            for peripheral in self.adapter.peripherals().await? {
                remember(&self.devices, peripheral).await;
            }
            if self.devices.lock().contains_key(address) {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            if !scanning {
                debug!("{} not cached, scanning", address);
                self.adapter.start_scan(ScanFilter::default()).await?;
                scanning = true;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };
        if scanning && self.active_scans.load(Ordering::SeqCst) == 0 {
            self.adapter.stop_scan().await.ok();
        }
        Ok(found)
    }

    /// Forward adapter events into `central` until the event stream ends.
    pub fn watch_events(&self, central: BleCentral) {
        let adapter = self.adapter.clone();
        let devices = Arc::clone(&self.devices);
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!("Failed to subscribe to adapter events: {}", err);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDisconnected(id) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            central.handle_device_disconnected(&peripheral.address().to_string());
                        }
                    }
                    CentralEvent::DeviceDiscovered(id) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            remember(&devices, peripheral).await;
                        }
                    }
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        });
    }
}

/// Stops the adapter scan once the last scan stream is dropped.
struct ScanGuard {
    adapter: Adapter,
    active: Arc<AtomicUsize>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let adapter = self.adapter.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", err);
                }
            });
        }
    }
}

#[async_trait]
impl CentralTransport for BtleTransport {
    fn lookup_device(&self, address: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .get(address)
            .map(|device| Arc::clone(device) as Arc<dyn Device>)
    }

    async fn scan(&self, filter: Option<Vec<Uuid>>) -> Result<ScanStream, TransportError> {
        let scan_error = |err: btleplug::Error| TransportError::Other(err.to_string());
        let events = self.adapter.events().await.map_err(scan_error)?;
        self.adapter
            .start_scan(ScanFilter {
                services: filter.unwrap_or_default(),
            })
            .await
            .map_err(scan_error)?;
        self.active_scans.fetch_add(1, Ordering::SeqCst);

        let guard = ScanGuard {
            adapter: self.adapter.clone(),
            active: Arc::clone(&self.active_scans),
        };
        let adapter = self.adapter.clone();
        let devices = Arc::clone(&self.devices);
        let reports = events.filter_map(move |event| {
            let _guard = &guard;
            let adapter = adapter.clone();
            let devices = Arc::clone(&devices);
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                Some(Ok(remember(&devices, peripheral).await))
            }
        });
        Ok(Box::pin(reports))
    }

    // btleplug exposes no power state; an opened adapter is treated as on.
    fn state(&self) -> AdapterState {
        AdapterState::PoweredOn
    }
}

// ============================================================================
// DEVICE
// ============================================================================

pub struct BtleDevice {
    peripheral: Peripheral,
    address: String,
    name: Mutex<Option<String>>,
}

impl BtleDevice {
    fn update_name(&self, name: Option<String>) {
        if name.is_some() {
            *self.name.lock() = name;
        }
    }
}

#[async_trait]
impl Device for BtleDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Connection>, TransportError> {
        if options.auto_connect {
            debug!("auto_connect requested for {}; btleplug connects directly", self.address);
        }
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral
                .connect()
                .await
                .map_err(|err| transport_error(&self.address, err))?;
        }
        Ok(Arc::new(BtleConnection {
            peripheral: self.peripheral.clone(),
            address: self.address.clone(),
            connected: AtomicBool::new(true),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct BtleConnection {
    peripheral: Peripheral,
    address: String,
    connected: AtomicBool,
    subscriptions: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl BtleConnection {
    fn characteristic(&self, info: &CharacteristicInfo) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == info.uuid && c.service_uuid == info.service_uuid)
            .ok_or_else(|| TransportError::CharacteristicNotFound(info.uuid.to_string()))
    }

    fn error(&self, err: btleplug::Error) -> TransportError {
        transport_error(&self.address, err)
    }
}

/// Unsubscribes once the last value stream for a characteristic is dropped.
struct SubscriptionGuard {
    peripheral: Peripheral,
    characteristic: Characteristic,
    subscriptions: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        {
            let mut subscriptions = self.subscriptions.lock();
            let Some(count) = subscriptions.get_mut(&self.characteristic.uuid) else {
                return;
            };
            *count -= 1;
            if *count > 0 {
                return;
            }
            subscriptions.remove(&self.characteristic.uuid);
        }

        let peripheral = self.peripheral.clone();
        let characteristic = self.characteristic.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = peripheral.unsubscribe(&characteristic).await {
                    debug!("Unsubscribe from {} failed: {}", characteristic.uuid, err);
                }
            });
        }
    }
}

#[async_trait]
impl Connection for BtleConnection {
    async fn discover_services(&self) -> Result<ServiceList, TransportError> {
        if self.peripheral.services().is_empty() {
            self.peripheral
                .discover_services()
                .await
                .map_err(|err| self.error(err))?;
        }
        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                is_primary: service.primary,
                characteristics: service.characteristics.iter().map(characteristic_info).collect(),
            })
            .collect();
        Ok(ServiceList::new(services))
    }

    async fn read(&self, info: &CharacteristicInfo) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(info)?;
        self.peripheral
            .read(&characteristic)
            .await
            .map_err(|err| self.error(err))
    }

    async fn write(&self, info: &CharacteristicInfo, value: &[u8], with_response: bool) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(info)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(|err| self.error(err))?;
        Ok(value.to_vec())
    }

    async fn monitor(&self, info: &CharacteristicInfo) -> Result<ValueStream, TransportError> {
        let characteristic = self.characteristic(info)?;
        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|err| self.error(err))?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|err| self.error(err))?;
        *self.subscriptions.lock().entry(info.uuid).or_insert(0) += 1;

        let guard = SubscriptionGuard {
            peripheral: self.peripheral.clone(),
            characteristic,
            subscriptions: Arc::clone(&self.subscriptions),
        };
        let uuid = info.uuid;
        let values = notifications.filter_map(move |notification| {
            let _guard = &guard;
            futures::future::ready((notification.uuid == uuid).then_some(Ok(notification.value)))
        });
        Ok(Box::pin(values))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.peripheral.disconnect().await.map_err(|err| self.error(err))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blecentral_core::gatt_uuid::from_short;
    use std::collections::BTreeSet;

    #[test]
    fn test_characteristic_flags_map_to_properties() {
        let characteristic = Characteristic {
            uuid: from_short(0x2A37),
            service_uuid: from_short(0x180D),
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        };
        let info = characteristic_info(&characteristic);
        assert!(info.properties.read);
        assert!(info.properties.notify);
        assert!(!info.properties.write);
        assert!(!info.properties.indicate);
        assert_eq!(info.service_uuid, from_short(0x180D));
    }

    #[test]
    fn test_not_connected_maps_to_device_error() {
        assert_eq!(
            transport_error("AA:BB", btleplug::Error::NotConnected),
            TransportError::DeviceNotConnected("AA:BB".into())
        );
        assert!(matches!(
            transport_error("AA:BB", btleplug::Error::TimedOut(Duration::from_secs(1))),
            TransportError::Other(_)
        ));
    }
}
