//! Connection attempts and established connections per device address.

use super::{CancellableHandle, KeyedRegistry};
use crate::error::BleError;
use crate::records::DeviceRecord;
use crate::response::ResponseSink;
use crate::transport::Connection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Called with the device address whenever a device is disconnected
pub type DisconnectObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// An in-progress connection establishment for one device
pub struct ConnectionAttempt {
    address: String,
    device: DeviceRecord,
    handle: Arc<CancellableHandle>,
    sink: ResponseSink<DeviceRecord>,
}

impl ConnectionAttempt {
    /// `release` runs if the attempt is cancelled or superseded before it
    /// settles. It is responsible for telling the caller.
    pub fn new<F>(device: DeviceRecord, sink: ResponseSink<DeviceRecord>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let address = device.uuid.clone();
        Self {
            handle: CancellableHandle::scoped(address.clone(), release),
            address,
            device,
            sink,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn handle(&self) -> &Arc<CancellableHandle> {
        &self.handle
    }

    pub fn token(&self) -> CancellationToken {
        self.handle.token()
    }
}

/// What `ConnectionRegistry::disconnect` tore down
#[derive(Default)]
pub struct Disconnected {
    pub connection: Option<Arc<dyn Connection>>,
    pub cancelled_attempt: bool,
}

impl Disconnected {
    pub fn any(&self) -> bool {
        self.connection.is_some() || self.cancelled_attempt
    }
}

/// Tracks at most one attempt and at most one connection per address.
pub struct ConnectionRegistry {
    attempts: KeyedRegistry<String>,
    connections: Mutex<HashMap<String, Arc<dyn Connection>>>,
    observer: Mutex<Option<DisconnectObserver>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            attempts: KeyedRegistry::new("connection-attempts"),
            connections: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
        }
    }

    /// Install an attempt, cancelling any previous attempt for the address.
    pub fn begin_connect(&self, attempt: &ConnectionAttempt) {
        debug!("Connecting to {}", attempt.address);
        self.attempts
            .install(attempt.address.clone(), Arc::clone(&attempt.handle));
    }

    /// Promote a successful attempt to a connection and resolve its caller.
    ///
    /// Returns false if the attempt was already cancelled or superseded; the
    /// caller then owns `connection` and must close it.
    pub fn complete_connect(&self, attempt: &ConnectionAttempt, connection: Arc<dyn Connection>) -> bool {
        if !attempt.handle.disarm() {
            debug!("Connection to {} established after cancellation", attempt.address);
            return false;
        }

        {
            let mut connections = self.connections.lock();
            if !self.attempts.remove_if_owner(&attempt.address, &attempt.handle) {
                drop(connections);
                debug!("Connection attempt for {} lost its slot", attempt.address);
                attempt.sink.reject(BleError::Cancelled);
                return false;
            }
            connections.insert(attempt.address.clone(), connection);
        }

        info!("Connected to {}", attempt.address);
        attempt.sink.resolve(attempt.device.clone());
        true
    }

    /// Drop a failed attempt and report `error` to its caller.
    pub fn fail_connect(&self, attempt: &ConnectionAttempt, error: BleError) -> bool {
        if !attempt.handle.disarm() {
            return false;
        }
        self.attempts.remove_if_owner(&attempt.address, &attempt.handle);
        debug!("Connection to {} failed: {}", attempt.address, error);
        attempt.sink.reject(error);
        true
    }

    pub fn get_connection(&self, address: &str) -> Option<Arc<dyn Connection>> {
        self.connections.lock().get(address).cloned()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connections.lock().contains_key(address)
    }

    pub fn is_connecting(&self, address: &str) -> bool {
        self.attempts.contains(&address.to_string())
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Cancel any attempt and remove any connection for `address`. The
    /// disconnect observer is notified once if anything was torn down.
    pub fn disconnect(&self, address: &str) -> Disconnected {
        let connection = self.connections.lock().remove(address);
        let cancelled_attempt = self.attempts.cancel(&address.to_string());
        let outcome = Disconnected {
            connection,
            cancelled_attempt,
        };
        if outcome.any() {
            info!("Disconnected {}", address);
            self.notify(address);
        }
        outcome
    }

    /// Remove only the connection for `address`, notifying the observer if
    /// one existed. Pending attempts are left alone.
    pub fn drop_connection(&self, address: &str) -> Option<Arc<dyn Connection>> {
        let connection = self.connections.lock().remove(address);
        if connection.is_some() {
            info!("Connection to {} dropped", address);
            self.notify(address);
        }
        connection
    }

    pub fn set_disconnect_observer(&self, observer: Option<DisconnectObserver>) {
        *self.observer.lock() = observer;
    }

    /// Cancel every attempt and hand back every connection without
    /// notifying the observer.
    pub fn clear(&self) -> Vec<Arc<dyn Connection>> {
        self.attempts.cancel_all();
        self.connections
            .lock()
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }

    fn notify(&self, address: &str) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(address);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::response::{response_channel, Delivery, ResponseStream};
    use crate::transport::{CharacteristicInfo, ServiceList, ValueStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct IdleConnection;

    #[async_trait]
    impl Connection for IdleConnection {
        async fn discover_services(&self) -> Result<ServiceList, TransportError> {
            Ok(ServiceList::default())
        }

        async fn read(&self, _: &CharacteristicInfo) -> Result<Vec<u8>, TransportError> {
            Ok(vec![])
        }

        async fn write(&self, _: &CharacteristicInfo, value: &[u8], _: bool) -> Result<Vec<u8>, TransportError> {
            Ok(value.to_vec())
        }

        async fn monitor(&self, _: &CharacteristicInfo) -> Result<ValueStream, TransportError> {
            Ok(Box::pin(futures::stream::pending()))
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn attempt(address: &str) -> (ConnectionAttempt, ResponseStream<DeviceRecord>) {
        let (sink, stream) = response_channel();
        let cancel_sink = sink.clone();
        let attempt = ConnectionAttempt::new(DeviceRecord::from_address(address), sink, move || {
            cancel_sink.reject(BleError::Cancelled);
        });
        (attempt, stream)
    }

    fn counting_observer(registry: &ConnectionRegistry) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        registry.set_disconnect_observer(Some(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        count
    }

    #[tokio::test]
    async fn test_complete_connect_promotes_attempt() {
        let registry = ConnectionRegistry::new();
        let (attempt, mut stream) = attempt("AA:BB");

        registry.begin_connect(&attempt);
        assert!(registry.is_connecting("AA:BB"));
        assert!(registry.complete_connect(&attempt, Arc::new(IdleConnection)));

        assert!(!registry.is_connecting("AA:BB"));
        assert!(registry.is_connected("AA:BB"));
        assert_eq!(stream.result().await.unwrap().uuid, "AA:BB");
    }

    #[tokio::test]
    async fn test_superseded_attempt_is_cancelled_and_cannot_complete() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_stream) = attempt("AA:BB");
        let (second, _second_stream) = attempt("AA:BB");

        registry.begin_connect(&first);
        registry.begin_connect(&second);

        assert_eq!(first_stream.result().await, Err(BleError::Cancelled));
        assert!(!registry.complete_connect(&first, Arc::new(IdleConnection)));
        assert!(!registry.is_connected("AA:BB"));
        assert!(registry.is_connecting("AA:BB"));
    }

    #[tokio::test]
    async fn test_fail_connect_reports_error() {
        let registry = ConnectionRegistry::new();
        let (attempt, mut stream) = attempt("AA:BB");
        registry.begin_connect(&attempt);

        assert!(registry.fail_connect(&attempt, BleError::Transport("timeout".into())));
        assert!(!registry.is_connecting("AA:BB"));
        assert!(!registry.is_connected("AA:BB"));
        assert_eq!(stream.result().await, Err(BleError::Transport("timeout".into())));
    }

    #[test]
    fn test_disconnect_notifies_once() {
        let registry = ConnectionRegistry::new();
        let notified = counting_observer(&registry);
        let (attempt, _stream) = attempt("AA:BB");
        registry.begin_connect(&attempt);
        registry.complete_connect(&attempt, Arc::new(IdleConnection));

        let outcome = registry.disconnect("AA:BB");
        assert!(outcome.connection.is_some());
        assert!(!outcome.cancelled_attempt);
        assert!(!registry.disconnect("AA:BB").any());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_attempt() {
        let registry = ConnectionRegistry::new();
        let notified = counting_observer(&registry);
        let (attempt, mut stream) = attempt("AA:BB");
        registry.begin_connect(&attempt);

        assert!(registry.disconnect("AA:BB").cancelled_attempt);
        assert_eq!(stream.next().await, Some(Delivery::Error(BleError::Cancelled)));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_connection_leaves_attempt() {
        let registry = ConnectionRegistry::new();
        let notified = counting_observer(&registry);
        let (attempt, _stream) = attempt("AA:BB");
        registry.begin_connect(&attempt);

        assert!(registry.drop_connection("AA:BB").is_none());
        assert!(registry.is_connecting("AA:BB"));
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_is_silent() {
        let registry = ConnectionRegistry::new();
        let notified = counting_observer(&registry);
        let (attempt, _stream) = attempt("AA:BB");
        registry.begin_connect(&attempt);
        registry.complete_connect(&attempt, Arc::new(IdleConnection));

        assert_eq!(registry.clear().len(), 1);
        assert!(registry.connected_addresses().is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }
}
