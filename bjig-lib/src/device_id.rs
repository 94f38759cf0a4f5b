use crate::error::BjigError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// 64-bit module identifier.
///
/// Parsed from `0x`-prefixed hex, the canonical 16-digit hex form printed on
/// modules (`2468800203400004`), plain decimal, or hex containing letters.
/// Displayed as 16 upper-case hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct DeviceId(pub u64);

const CANONICAL_HEX_DIGITS: usize = 16;

impl DeviceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl FromStr for DeviceId {
    type Err = BjigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || BjigError::InvalidDeviceId(s.to_string());

        if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16).map(DeviceId).map_err(|_| invalid());
        }
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let all_decimal = trimmed.chars().all(|c| c.is_ascii_digit());
        if all_decimal && trimmed.len() < CANONICAL_HEX_DIGITS {
            return trimmed.parse::<u64>().map(DeviceId).map_err(|_| invalid());
        }
        u64::from_str_radix(trimmed, 16).map(DeviceId).map_err(|_| invalid())
    }
}

impl From<u64> for DeviceId {
    fn from(value: u64) -> Self {
        DeviceId(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_hex_is_hex() {
        let id: DeviceId = "2468800203400004".parse().unwrap();
        assert_eq!(id.get(), 0x2468800203400004);
        assert_eq!(id.to_string(), "2468800203400004");
    }

    #[test]
    fn prefixed_hex_and_letters() {
        assert_eq!("0x246880020440000F".parse::<DeviceId>().unwrap().get(), 0x246880020440000F);
        assert_eq!("246880020440000f".parse::<DeviceId>().unwrap().get(), 0x246880020440000F);
        assert_eq!("ff".parse::<DeviceId>().unwrap().get(), 0xFF);
    }

    #[test]
    fn short_decimal() {
        assert_eq!("1234".parse::<DeviceId>().unwrap().get(), 1234);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "module-1", "0x", "0xZZ", "12345678901234567890ABC"] {
            assert!(
                matches!(bad.parse::<DeviceId>(), Err(BjigError::InvalidDeviceId(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
