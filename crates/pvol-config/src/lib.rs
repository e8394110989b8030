//! Pooled-volume configuration.
//!
//! A configuration file declares the logging setup and one or more pooled
//! volumes, each with a strip size and an ordered list of base device names:
//!
//! ```toml
//! [log]
//! level = "info"
//! rotation = "daily"
//!
//! [[volume]]
//! name = "pvol1"
//! strip_size_kb = 32
//! raid_level = 0
//! base_devices = ["nvme0n1", "nvme1n1"]
//! ```
//!
//! Validation is synchronous and happens before any volume state is created:
//! a rejected record leaves no partial state behind.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use pvol_types::{ConfigCode, Status};

pub use pvol_logging::LogConfig;

/// Maximum number of base devices in one pooled volume.
pub const MAX_BASE_DEVICES: usize = 255;

/// A single pooled-volume definition as parsed from the config file or
/// handed in by an administrative caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Unique volume name.
    pub name: String,

    /// Strip size in KB. Must be a power of two.
    pub strip_size_kb: u32,

    /// RAID level. Only level 0 (striping) is supported.
    #[serde(default)]
    pub raid_level: u8,

    /// Ordered list of base device names. The position in this list is the
    /// striping slot index.
    pub base_devices: Vec<String>,
}

impl VolumeConfig {
    /// Validate this record in isolation (no cross-volume checks).
    pub fn validate(&self) -> Result<(), Status> {
        if self.name.is_empty() {
            return Err(Status::new(ConfigCode::EMPTY_NAME));
        }
        if self.strip_size_kb == 0 || !self.strip_size_kb.is_power_of_two() {
            return Err(Status::with_message(
                ConfigCode::INVALID_STRIP_SIZE,
                format!("strip size {} KB is not a power of two", self.strip_size_kb),
            ));
        }
        if self.raid_level != 0 {
            return Err(Status::with_message(
                ConfigCode::INVALID_RAID_LEVEL,
                format!("raid level {} not supported, only 0", self.raid_level),
            ));
        }
        if self.base_devices.is_empty() || self.base_devices.len() > MAX_BASE_DEVICES {
            return Err(Status::with_message(
                ConfigCode::INVALID_DEVICE_COUNT,
                format!("invalid base device count {}", self.base_devices.len()),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration: logging setup plus the full set of pooled-volume
/// definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PvolConfig {
    /// `[log]` section, applied by the host at startup via
    /// `pvol_logging::init_logging`.
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default, rename = "volume")]
    pub volumes: Vec<VolumeConfig>,
}

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read the file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed records failed validation.
    #[error("invalid config: {0}")]
    Invalid(#[from] Status),
}

impl PvolConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), volumes = config.volumes.len(), "loaded pvol config");
        Ok(config)
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PvolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every record plus the cross-volume uniqueness rules: volume
    /// names must be unique, and a base device may be claimed by at most one
    /// volume.
    pub fn validate(&self) -> Result<(), Status> {
        for volume in &self.volumes {
            volume.validate()?;
        }
        for (i, volume) in self.volumes.iter().enumerate() {
            if self.volumes[..i].iter().any(|v| v.name == volume.name) {
                return Err(Status::with_message(
                    ConfigCode::DUPLICATE_VOLUME_NAME,
                    format!("duplicate volume name {}", volume.name),
                ));
            }
        }
        let mut seen: Vec<&str> = Vec::new();
        for volume in &self.volumes {
            for device in &volume.base_devices {
                if seen.contains(&device.as_str()) {
                    return Err(Status::with_message(
                        ConfigCode::DUPLICATE_DEVICE_NAME,
                        format!("base device {} claimed twice", device),
                    ));
                }
                seen.push(device);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(name: &str, strip_kb: u32, devices: &[&str]) -> VolumeConfig {
        VolumeConfig {
            name: name.into(),
            strip_size_kb: strip_kb,
            raid_level: 0,
            base_devices: devices.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_toml() {
        let config = PvolConfig::from_toml_str(
            r#"
            [[volume]]
            name = "pvol1"
            strip_size_kb = 32
            raid_level = 0
            base_devices = ["nvme0n1", "nvme1n1"]

            [[volume]]
            name = "pvol2"
            strip_size_kb = 64
            base_devices = ["nvme2n1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].name, "pvol1");
        assert_eq!(config.volumes[0].base_devices.len(), 2);
        // raid_level defaults to 0 when omitted.
        assert_eq!(config.volumes[1].raid_level, 0);
    }

    #[test]
    fn test_parse_log_section() {
        let config = PvolConfig::from_toml_str(
            r#"
            [log]
            level = "debug"
            rotation = "hourly"
            json_format = true

            [[volume]]
            name = "pvol1"
            strip_size_kb = 32
            base_devices = ["nvme0n1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.rotation, pvol_logging::Rotation::Hourly);
        assert!(config.log.json_format);

        // The section is optional.
        let config = PvolConfig::from_toml_str("").unwrap();
        assert_eq!(config.log.level, "info");
        assert!(config.log.console_output);
    }

    #[test]
    fn test_strip_size_must_be_pow2() {
        let v = volume("pvol1", 48, &["a"]);
        let err = v.validate().unwrap_err();
        assert_eq!(err.code(), ConfigCode::INVALID_STRIP_SIZE);

        let v = volume("pvol1", 0, &["a"]);
        assert!(v.validate().is_err());
    }

    #[test]
    fn test_raid_level_must_be_zero() {
        let mut v = volume("pvol1", 32, &["a"]);
        v.raid_level = 5;
        let err = v.validate().unwrap_err();
        assert_eq!(err.code(), ConfigCode::INVALID_RAID_LEVEL);
    }

    #[test]
    fn test_empty_name_rejected() {
        let v = volume("", 32, &["a"]);
        assert_eq!(v.validate().unwrap_err().code(), ConfigCode::EMPTY_NAME);
    }

    #[test]
    fn test_empty_device_list_rejected() {
        let v = volume("pvol1", 32, &[]);
        assert_eq!(
            v.validate().unwrap_err().code(),
            ConfigCode::INVALID_DEVICE_COUNT
        );
    }

    #[test]
    fn test_duplicate_volume_name_rejected() {
        let config = PvolConfig {
            volumes: vec![volume("pvol1", 32, &["a"]), volume("pvol1", 64, &["b"])],
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().code(),
            ConfigCode::DUPLICATE_VOLUME_NAME
        );
    }

    #[test]
    fn test_duplicate_device_across_volumes_rejected() {
        let config = PvolConfig {
            volumes: vec![volume("pvol1", 32, &["a", "b"]), volume("pvol2", 32, &["b"])],
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().code(),
            ConfigCode::DUPLICATE_DEVICE_NAME
        );
    }

    #[test]
    fn test_duplicate_device_within_volume_rejected() {
        let config = PvolConfig {
            volumes: vec![volume("pvol1", 32, &["a", "a"])],
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().code(),
            ConfigCode::DUPLICATE_DEVICE_NAME
        );
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(PvolConfig::from_toml_str("volume = 3").is_err());
    }
}
