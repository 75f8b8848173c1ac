//! Parsing of textual GATT UUIDs.
//!
//! Accepts the full 128-bit form as well as the 16-bit ("180D") and 32-bit
//! short forms, which are expanded onto the Bluetooth base UUID.

use crate::error::BleError;
use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16- or 32-bit assigned number onto the base UUID.
pub fn from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a UUID string, returning `None` if it is malformed.
pub fn try_parse(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim();
    match trimmed.len() {
        4 | 8 if trimmed.chars().all(|c| c.is_ascii_hexdigit()) => {
            u32::from_str_radix(trimmed, 16).ok().map(from_short)
        }
        _ => Uuid::parse_str(trimmed).ok(),
    }
}

/// Parse a UUID string, reporting `InvalidUuid` with the raw input.
pub fn parse(raw: &str) -> Result<Uuid, BleError> {
    try_parse(raw).ok_or_else(|| BleError::InvalidUuid(raw.to_string()))
}

/// Parse a service/characteristic pair. Both strings are named in the
/// error when either fails.
pub fn parse_pair(service: &str, characteristic: &str) -> Result<(Uuid, Uuid), BleError> {
    match (try_parse(service), try_parse(characteristic)) {
        (Some(s), Some(c)) => Ok((s, c)),
        _ => Err(BleError::InvalidUuid(format!("{}, {}", service, characteristic))),
    }
}

/// Parse an optional scan filter list; any malformed entry rejects the list.
pub fn parse_all(raw: &[String]) -> Result<Vec<Uuid>, BleError> {
    raw.iter().map(|s| parse(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form_expands_onto_base() {
        let uuid = parse("180D").unwrap();
        assert_eq!(
            uuid.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(parse("2a37").unwrap(), from_short(0x2A37));
    }

    #[test]
    fn test_32_bit_short_form() {
        let uuid = parse("0000FE9F").unwrap();
        assert_eq!(uuid, from_short(0xFE9F));
    }

    #[test]
    fn test_full_form_round_trips() {
        let raw = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
        assert_eq!(parse(raw).unwrap().to_string(), raw);
        assert_eq!(parse(&raw.to_uppercase()).unwrap().to_string(), raw);
    }

    #[test]
    fn test_malformed_is_rejected() {
        assert_eq!(parse("18"), Err(BleError::InvalidUuid("18".into())));
        assert!(parse("zzzz").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_pair_names_both_inputs() {
        let err = parse_pair("180D", "nope").unwrap_err();
        assert_eq!(err, BleError::InvalidUuid("180D, nope".into()));
        assert!(parse_pair("180D", "2A37").is_ok());
    }

    #[test]
    fn test_filter_list() {
        let list = vec!["180D".to_string(), "180F".to_string()];
        assert_eq!(parse_all(&list).unwrap().len(), 2);
        let bad = vec!["180D".to_string(), "xyz".to_string()];
        assert!(parse_all(&bad).is_err());
    }
}
