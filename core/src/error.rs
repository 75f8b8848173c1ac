//! Error kinds reported to callers and raised by transport collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the transport collaborator (radio, GATT stack).
///
/// These never reach a caller directly; the pipeline maps them into
/// [`BleError`] via `From`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device {0} is not connected")]
    DeviceNotConnected(String),
    #[error("Service {0} not found")]
    ServiceNotFound(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(String),
    #[error("Operation cancelled by transport")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

/// Errors delivered to a caller's response sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Device {0} is not connected")]
    DeviceNotConnected(String),
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(String),
    #[error("Service {0} not found")]
    ServiceNotFound(String),
    #[error("Invalid write payload {raw:?} for characteristic {characteristic}")]
    InvalidWritePayload { raw: String, characteristic: String },
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BleError {
    /// Stable numeric code exposed to callers alongside the message.
    pub fn code(&self) -> u16 {
        match self {
            BleError::Transport(_) => 0,
            BleError::Cancelled => 1,
            BleError::InvalidUuid(_) => 2,
            BleError::DeviceNotFound(_) => 3,
            BleError::DeviceNotConnected(_) => 4,
            BleError::ServiceNotFound(_) => 5,
            BleError::CharacteristicNotFound(_) => 6,
            BleError::InvalidWritePayload { .. } => 7,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BleError::Cancelled)
    }

    /// Boundary-friendly form of this error.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::from(self)
    }
}

impl From<TransportError> for BleError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::DeviceNotConnected(address) => BleError::DeviceNotConnected(address),
            TransportError::ServiceNotFound(uuid) => BleError::ServiceNotFound(uuid),
            TransportError::CharacteristicNotFound(uuid) => BleError::CharacteristicNotFound(uuid),
            TransportError::Cancelled => BleError::Cancelled,
            TransportError::Other(detail) => BleError::Transport(detail),
        }
    }
}

/// `{ code, message, isCancelled? }` error object handed to the dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_cancelled: bool,
}

impl From<&BleError> for ErrorPayload {
    fn from(err: &BleError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            is_cancelled: err.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_one_to_one() {
        assert_eq!(
            BleError::from(TransportError::DeviceNotConnected("AA:BB".into())),
            BleError::DeviceNotConnected("AA:BB".into())
        );
        assert_eq!(
            BleError::from(TransportError::ServiceNotFound("180d".into())),
            BleError::ServiceNotFound("180d".into())
        );
        assert_eq!(BleError::from(TransportError::Cancelled), BleError::Cancelled);
    }

    #[test]
    fn test_unknown_transport_error_falls_back() {
        let err = BleError::from(TransportError::Other("GATT 133".into()));
        assert_eq!(err, BleError::Transport("GATT 133".into()));
        assert_eq!(err.code(), 0);
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            BleError::Transport(String::new()),
            BleError::Cancelled,
            BleError::InvalidUuid(String::new()),
            BleError::DeviceNotFound(String::new()),
            BleError::DeviceNotConnected(String::new()),
            BleError::ServiceNotFound(String::new()),
            BleError::CharacteristicNotFound(String::new()),
            BleError::InvalidWritePayload {
                raw: String::new(),
                characteristic: String::new(),
            },
        ];
        let mut codes: Vec<u16> = errors.iter().map(BleError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_payload_flags_cancellation_only() {
        let cancelled = BleError::Cancelled.to_payload();
        assert!(cancelled.is_cancelled);
        assert_eq!(cancelled.code, 1);

        let json = serde_json::to_value(BleError::DeviceNotFound("AA".into()).to_payload())
            .unwrap();
        assert!(json.get("isCancelled").is_none());
        assert_eq!(json["code"], 3);
        assert_eq!(json["message"], "Device AA not found");
    }
}
