//! In-flight reads, writes and monitors per caller-supplied transaction id.

use super::{CancellableHandle, KeyedRegistry};
use std::sync::Arc;
use tracing::debug;

pub struct TransactionRegistry {
    entries: KeyedRegistry<String>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            entries: KeyedRegistry::new("transactions"),
        }
    }

    /// Register `handle` under `id`. A transaction already using the id is
    /// cancelled first, so its own caller sees `Cancelled`.
    pub fn start(&self, id: &str, handle: Arc<CancellableHandle>) -> Arc<CancellableHandle> {
        debug!("Transaction {} started (handle {})", id, handle.id());
        self.entries.install(id.to_string(), handle)
    }

    /// Release the slot held by `handle`. Safe to call repeatedly or after
    /// the id has been reused by a newer transaction.
    pub fn finish(&self, id: &str, handle: &CancellableHandle) -> bool {
        let removed = self.entries.remove_if_owner(&id.to_string(), handle);
        if removed {
            debug!("Transaction {} finished", id);
        }
        removed
    }

    /// Explicit cancel. Unknown ids are not an error; the return value only
    /// says whether something was running.
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.cancel(&id.to_string())
    }

    /// Cancel every transaction operating on `address`; returns their ids.
    pub fn cancel_device(&self, address: &str) -> Vec<String> {
        self.entries
            .cancel_where(|_, handle| handle.scope() == Some(address))
    }

    pub fn cancel_all(&self) -> usize {
        self.entries.cancel_all()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(&id.to_string())
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
