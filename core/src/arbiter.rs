//! Notification ownership per characteristic.
//!
//! Several monitor transactions may be subscribed to the same characteristic
//! at the transport level, but only one of them delivers values. The first
//! transaction to receive a value becomes the owner and keeps the
//! characteristic until it terminates; values arriving for any other
//! transaction are dropped. Ownership is cleared only by the owner's own
//! termination.
//!
//! Owners are identified by their cancellable handle id, not only by the
//! caller's transaction id, since a restarted monitor reuses the id of the
//! one it superseded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};
use uuid::Uuid;

/// Identity of a monitored characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub device: String,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(device: impl Into<String>, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            device: device.into(),
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.service, self.characteristic)
    }
}

struct Owner {
    transaction: String,
    handle: u64,
}

pub struct NotificationArbiter {
    owners: Mutex<HashMap<CharacteristicKey, Owner>>,
}

impl NotificationArbiter {
    pub fn new() -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a value for `key` arriving under `transaction` (run
    /// by the handle numbered `handle`) may be delivered. Claims ownership if
    /// the characteristic has no owner.
    pub fn admit(&self, key: &CharacteristicKey, transaction: &str, handle: u64) -> bool {
        let mut owners = self.owners.lock();
        match owners.get(key) {
            Some(owner) if owner.handle == handle => true,
            Some(owner) => {
                trace!(
                    "{}: value for {} dropped, owned by {} (#{})",
                    key,
                    transaction,
                    owner.transaction,
                    owner.handle
                );
                false
            }
            None => {
                debug!("{}: ownership claimed by {} (#{})", key, transaction, handle);
                owners.insert(
                    key.clone(),
                    Owner {
                        transaction: transaction.to_string(),
                        handle,
                    },
                );
                true
            }
        }
    }

    /// Clear ownership of `key` if, and only if, `handle` holds it.
    pub fn release(&self, key: &CharacteristicKey, handle: u64) -> bool {
        let mut owners = self.owners.lock();
        match owners.get(key) {
            Some(owner) if owner.handle == handle => {
                debug!("{}: ownership released by {} (#{})", key, owner.transaction, handle);
                owners.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Transaction id of the current owner of `key`.
    pub fn owner(&self, key: &CharacteristicKey) -> Option<String> {
        self.owners.lock().get(key).map(|owner| owner.transaction.clone())
    }

    pub fn clear(&self) {
        self.owners.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.lock().is_empty()
    }
}

impl Default for NotificationArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt_uuid::from_short;
    use std::sync::Arc;

    fn hr(device: &str) -> CharacteristicKey {
        CharacteristicKey::new(device, from_short(0x180D), from_short(0x2A37))
    }

    #[test]
    fn test_first_delivery_claims_ownership() {
        let arbiter = NotificationArbiter::new();
        assert!(arbiter.admit(&hr("AA"), "t1", 1));
        assert!(arbiter.admit(&hr("AA"), "t1", 1));
        assert_eq!(arbiter.owner(&hr("AA")), Some("t1".to_string()));
    }

    #[test]
    fn test_second_monitor_is_starved_until_owner_terminates() {
        let arbiter = NotificationArbiter::new();
        assert!(arbiter.admit(&hr("AA"), "t1", 1));
        assert!(!arbiter.admit(&hr("AA"), "t2", 2));
        assert!(!arbiter.admit(&hr("AA"), "t2", 2));

        assert!(arbiter.release(&hr("AA"), 1));
        assert!(arbiter.admit(&hr("AA"), "t2", 2));
    }

    #[test]
    fn test_non_owner_release_is_ignored() {
        let arbiter = NotificationArbiter::new();
        arbiter.admit(&hr("AA"), "t1", 1);
        assert!(!arbiter.release(&hr("AA"), 2));
        assert_eq!(arbiter.owner(&hr("AA")), Some("t1".to_string()));
    }

    #[test]
    fn test_stale_release_under_reused_id_keeps_new_owner() {
        let arbiter = NotificationArbiter::new();
        // m1 (#1) claims, is superseded and releases on cancel.
        assert!(arbiter.admit(&hr("AA"), "m1", 1));
        assert!(arbiter.release(&hr("AA"), 1));
        // The replacement m1 (#2) claims.
        assert!(arbiter.admit(&hr("AA"), "m1", 2));

        // The old task's post-admission recheck releases again.
        assert!(!arbiter.release(&hr("AA"), 1));
        assert_eq!(arbiter.owner(&hr("AA")), Some("m1".to_string()));
        assert!(!arbiter.admit(&hr("AA"), "m1", 1));
        assert!(!arbiter.admit(&hr("AA"), "t3", 3));
        assert!(arbiter.admit(&hr("AA"), "m1", 2));
    }

    #[test]
    fn test_ownership_is_per_device() {
        let arbiter = NotificationArbiter::new();
        assert!(arbiter.admit(&hr("AA"), "t1", 1));
        assert!(arbiter.admit(&hr("BB"), "t2", 2));
        assert_eq!(arbiter.len(), 2);
        arbiter.clear();
        assert!(arbiter.is_empty());
    }

    #[test]
    fn test_concurrent_admission_has_single_winner() {
        let arbiter = Arc::new(NotificationArbiter::new());
        let winners: Vec<bool> = (0..8u64)
            .map(|i| {
                let arbiter = Arc::clone(&arbiter);
                std::thread::spawn(move || arbiter.admit(&hr("AA"), &format!("t{}", i), i))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
    }
}
