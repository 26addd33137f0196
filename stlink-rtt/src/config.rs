//! Settings for the probe session and RTT discovery.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::probe::stlink::STLINK_MAX_TRANSFER_SIZE;

/// Settings of a probe session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Largest 32-bit transfer issued by the memory engine, in bytes.
    ///
    /// Must be a multiple of 4, at most 6144.
    pub max_transfer_size: usize,

    /// Timeout of every USB bulk transfer.
    #[serde(with = "duration_ms")]
    pub usb_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_transfer_size: 256,
            usb_timeout: Duration::from_millis(1000),
        }
    }
}

impl ProbeConfig {
    pub fn max_transfer_size_is_valid(&self) -> bool {
        (4..=STLINK_MAX_TRANSFER_SIZE).contains(&self.max_transfer_size)
            && self.max_transfer_size % 4 == 0
    }
}

/// A window of target RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RamRegion {
    pub address: u32,
    pub size: u32,
}

impl Default for RamRegion {
    fn default() -> Self {
        Self {
            address: 0x2000_0000,
            size: 0x1000,
        }
    }
}

/// Settings of the RTT channel manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RttConfig {
    /// The RAM window scanned for the control block.
    pub ram: RamRegion,

    /// Pause between two polls of the terminal channels.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            ram: RamRegion::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::{ProbeConfig, RamRegion, RttConfig};
    use std::time::Duration;

    #[test]
    fn missing_fields_use_defaults() {
        let config: RttConfig = serde_json::from_str(r#"{ "poll_interval": 50 }"#).unwrap();

        assert_eq!(config.ram, RamRegion::default());
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<ProbeConfig>(r#"{ "speed": 4000 }"#).is_err());
    }

    #[test]
    fn max_transfer_size_limits() {
        let valid = |max_transfer_size| {
            ProbeConfig {
                max_transfer_size,
                ..ProbeConfig::default()
            }
            .max_transfer_size_is_valid()
        };

        assert!(valid(4));
        assert!(valid(256));
        assert!(valid(6144));
        assert!(!valid(0));
        assert!(!valid(258));
        assert!(!valid(6148));
    }
}
