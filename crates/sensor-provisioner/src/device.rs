use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

// Device ids end up in file names (`sdkconfig.<id>`), section names and the tool environment.
static DEVICE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("valid device id regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !DEVICE_ID_RE.is_match(raw) {
            return Err(Error::InvalidDeviceId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conventional_ids() {
        for id in ["sensor_1", "sensor_temp", "lab-02", "v1.2", "  padded  "] {
            assert!(DeviceId::parse(id).is_ok(), "{id} should be valid");
        }
        assert_eq!(DeviceId::parse(" padded ").unwrap().as_str(), "padded");
    }

    #[test]
    fn rejects_ids_unsafe_for_paths_or_sections() {
        for id in ["", "../etc", ".hidden", "a/b", "env:x", "a b", "x]"] {
            let err = DeviceId::parse(id).unwrap_err();
            assert!(matches!(err, Error::InvalidDeviceId(_)), "{id} should be rejected");
        }
    }
}
