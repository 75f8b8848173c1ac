//! Characteristic operation pipeline
//!
//! Every read, write and monitor request goes through the same stages:
//!
//! 1. **Validating** (caller's thread): device exists, connection exists,
//!    UUIDs parse, write payload decodes. Failures are reported immediately
//!    and nothing is registered.
//! 2. **Executing** (tokio task): the transaction is registered under its id,
//!    then service discovery, characteristic lookup and the transport action
//!    run as one future raced against the transaction's cancellation token.
//! 3. **Terminal**: the first of success, error or cancellation settles the
//!    handle, reports to the caller and releases the registry slot. Monitors
//!    stay in Executing until cancelled, failed or disconnected.

use crate::arbiter::CharacteristicKey;
use crate::central::{BleCentral, CentralInner};
use crate::error::BleError;
use crate::gatt_uuid;
use crate::records::{decode_value, CharacteristicRecord};
use crate::registry::CancellableHandle;
use crate::response::ResponseSink;
use crate::transport::{CharacteristicInfo, Connection};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// A validated characteristic request, ready to execute
struct CharacteristicRequest {
    address: String,
    service: Uuid,
    characteristic: Uuid,
    connection: Arc<dyn Connection>,
}

impl CharacteristicRequest {
    fn key(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.address.clone(), self.service, self.characteristic)
    }

    /// Discover services and find the requested characteristic.
    async fn locate(&self) -> Result<CharacteristicInfo, BleError> {
        let services = self.connection.discover_services().await?;
        if services.find_service(self.service).is_none() {
            return Err(BleError::ServiceNotFound(self.service.to_string()));
        }
        services
            .find_characteristic(self.service, self.characteristic)
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound(self.characteristic.to_string()))
    }
}

impl CentralInner {
    fn validate(&self, address: &str, service_uuid: &str, characteristic_uuid: &str) -> Result<CharacteristicRequest, BleError> {
        let connection = self.connected(address)?;
        let (service, characteristic) = gatt_uuid::parse_pair(service_uuid, characteristic_uuid)?;
        Ok(CharacteristicRequest {
            address: address.to_string(),
            service,
            characteristic,
            connection,
        })
    }

    /// Register a one-shot transaction and run `operation` under it.
    fn run_transaction<F>(self: &Arc<Self>, transaction_id: &str, address: &str, sink: ResponseSink<CharacteristicRecord>, operation: F)
    where
        F: Future<Output = Result<CharacteristicRecord, BleError>> + Send + 'static,
    {
        let release_sink = sink.clone();
        let handle = CancellableHandle::scoped(address, move || {
            release_sink.reject(BleError::Cancelled);
        });
        self.transactions.start(transaction_id, Arc::clone(&handle));

        let inner = Arc::clone(self);
        let transaction_id = transaction_id.to_string();
        self.runtime.spawn(async move {
            let token = handle.token();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = operation => outcome,
            };

            if handle.disarm() {
                match outcome {
                    Ok(record) => sink.resolve(record),
                    Err(err) => {
                        debug!("Transaction {} failed: {}", transaction_id, err);
                        sink.reject(err)
                    }
                };
            }
            inner.transactions.finish(&transaction_id, &handle);
        });
    }

    /// Subscribe and forward values the arbiter admits until the stream
    /// ends or fails.
    async fn pump_notifications(
        &self,
        request: &CharacteristicRequest,
        transaction_id: &str,
        handle: &CancellableHandle,
        sink: &ResponseSink<CharacteristicRecord>,
    ) -> Result<(), BleError> {
        let info = request.locate().await?;
        let mut values = request.connection.monitor(&info).await?;

        let mut template = CharacteristicRecord::new(&request.address, &info).with_transaction(transaction_id);
        template.is_notifying = true;
        let key = request.key();

        while let Some(value) = values.next().await {
            let value = value?;
            if !self.arbiter.admit(&key, transaction_id, handle.id()) {
                continue;
            }
            // A cancel may have released ownership between admission and now.
            if handle.is_cancelled() {
                self.arbiter.release(&key, handle.id());
                break;
            }
            trace!("{}: delivering {} byte(s) to {}", key, value.len(), transaction_id);
            sink.emit(template.clone().with_value(&value));
        }
        Ok(())
    }
}

impl BleCentral {
    pub fn read_characteristic(
        &self,
        address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        transaction_id: &str,
        sink: ResponseSink<CharacteristicRecord>,
    ) {
        let request = match self.inner.validate(address, service_uuid, characteristic_uuid) {
            Ok(request) => request,
            Err(err) => {
                sink.reject(err);
                return;
            }
        };

        let transaction = transaction_id.to_string();
        self.inner.run_transaction(transaction_id, address, sink, async move {
            let info = request.locate().await?;
            let value = request.connection.read(&info).await?;
            Ok::<_, BleError>(
                CharacteristicRecord::new(&request.address, &info)
                    .with_transaction(&transaction)
                    .with_value(&value),
            )
        });
    }

    /// Write a base64-encoded value.
    #[allow(clippy::too_many_arguments)]
    pub fn write_characteristic(
        &self,
        address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        value_base64: &str,
        with_response: bool,
        transaction_id: &str,
        sink: ResponseSink<CharacteristicRecord>,
    ) {
        let validated = self
            .inner
            .validate(address, service_uuid, characteristic_uuid)
            .and_then(|request| {
                let value = decode_value(value_base64).ok_or_else(|| BleError::InvalidWritePayload {
                    raw: value_base64.to_string(),
                    characteristic: characteristic_uuid.to_string(),
                })?;
                Ok((request, value))
            });
        let (request, value) = match validated {
            Ok(validated) => validated,
            Err(err) => {
                sink.reject(err);
                return;
            }
        };

        let transaction = transaction_id.to_string();
        self.inner.run_transaction(transaction_id, address, sink, async move {
            let info = request.locate().await?;
            let written = request.connection.write(&info, &value, with_response).await?;
            Ok::<_, BleError>(
                CharacteristicRecord::new(&request.address, &info)
                    .with_transaction(&transaction)
                    .with_value(&written),
            )
        });
    }

    /// Stream notified values. Only the transaction that owns the
    /// characteristic in the arbiter receives them.
    pub fn monitor_characteristic(
        &self,
        address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        transaction_id: &str,
        sink: ResponseSink<CharacteristicRecord>,
    ) {
        let request = match self.inner.validate(address, service_uuid, characteristic_uuid) {
            Ok(request) => request,
            Err(err) => {
                sink.reject(err);
                return;
            }
        };

        let key = request.key();
        let release = {
            let sink = sink.clone();
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            move |handle_id: u64| {
                if let Some(inner) = inner.upgrade() {
                    inner.arbiter.release(&key, handle_id);
                }
                sink.reject(BleError::Cancelled);
            }
        };
        let handle = CancellableHandle::scoped_with_id(address, release);
        self.inner.transactions.start(transaction_id, Arc::clone(&handle));

        let inner = Arc::clone(&self.inner);
        let transaction_id = transaction_id.to_string();
        self.inner.runtime.spawn(async move {
            let token = handle.token();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = inner.pump_notifications(&request, &transaction_id, &handle, &sink) => outcome,
            };

            if handle.disarm() {
                inner.arbiter.release(&key, handle.id());
                match outcome {
                    Ok(()) => sink.complete(),
                    Err(err) => {
                        debug!("Monitor {} failed: {}", transaction_id, err);
                        sink.reject(err)
                    }
                };
            }
            inner.transactions.finish(&transaction_id, &handle);
        });
    }

    /// Cancel a transaction by id. Always acknowledges, whether or not the
    /// id was in use.
    pub fn cancel_transaction(&self, transaction_id: &str, sink: ResponseSink<()>) {
        if !self.inner.transactions.cancel(transaction_id) {
            debug!("Cancel for unknown transaction {}", transaction_id);
        }
        sink.resolve(());
    }
}
