//! Device configuration
//!
//! Each device type carries its serial parameters in an INI store:
//!
//! ```ini
//! [serial]
//! COMPORTSPEED = 115200
//! WRITETIMEOUT = 0.2
//! READTIMEOUT = 1
//! LONGREADTIMEOUT = 5
//! SHORTESTTIMEBETWEENREADS = 0.46
//! ```
//!
//! Timeouts are given in seconds. A missing store or key is fatal to
//! building a [`DeviceLink`](crate::protocol::DeviceLink).

mod error;
mod parser;

pub use error::ConfigError;
pub use parser::{parse_ini, read_ini_file, IniSections};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// INI key holding the baud rate
pub const KEY_BAUD_RATE: &str = "COMPORTSPEED";
/// INI key holding the write timeout in seconds
pub const KEY_WRITE_TIMEOUT: &str = "WRITETIMEOUT";
/// INI key holding the short read timeout in seconds
pub const KEY_READ_TIMEOUT: &str = "READTIMEOUT";
/// INI key holding the long read timeout in seconds
pub const KEY_LONG_READ_TIMEOUT: &str = "LONGREADTIMEOUT";
/// INI key holding the minimum interval between commands in seconds
pub const KEY_MIN_COMMAND_INTERVAL: &str = "SHORTESTTIMEBETWEENREADS";

/// Section used by per-device INI files
pub const SERIAL_SECTION: &str = "serial";

/// Serial parameters for one device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Baud rate
    pub baud_rate: u32,

    /// Longest time allowed to push a command to the device
    #[serde(with = "seconds")]
    pub write_timeout: Duration,

    /// Shortest time the device may need to answer
    #[serde(with = "seconds")]
    pub short_read_timeout: Duration,

    /// Longest time the device may need to answer
    #[serde(with = "seconds")]
    pub long_read_timeout: Duration,

    /// Minimum spacing between two consecutive commands
    #[serde(with = "seconds")]
    pub min_command_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            write_timeout: Duration::from_millis(200),
            short_read_timeout: Duration::from_secs(1),
            long_read_timeout: Duration::from_secs(5),
            min_command_interval: Duration::from_millis(460),
        }
    }
}

impl DeviceConfig {
    /// Build a configuration from one parsed INI section
    pub fn from_section(
        section_name: &str,
        section: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            baud_rate: required(section_name, section, KEY_BAUD_RATE, |raw| {
                raw.parse::<u32>().map_err(|e| e.to_string())
            })?,
            write_timeout: required(section_name, section, KEY_WRITE_TIMEOUT, parse_seconds)?,
            short_read_timeout: required(section_name, section, KEY_READ_TIMEOUT, parse_seconds)?,
            long_read_timeout: required(section_name, section, KEY_LONG_READ_TIMEOUT, parse_seconds)?,
            min_command_interval: required(
                section_name,
                section,
                KEY_MIN_COMMAND_INTERVAL,
                parse_seconds,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot drive a serial port.
    ///
    /// A long read timeout below the short one is allowed, with a warning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidValue {
                key: KEY_BAUD_RATE.to_string(),
                message: "baud rate must be non-zero".to_string(),
            });
        }
        if self.long_read_timeout < self.short_read_timeout {
            tracing::warn!(
                "{} ({:?}) is shorter than {} ({:?})",
                KEY_LONG_READ_TIMEOUT,
                self.long_read_timeout,
                KEY_READ_TIMEOUT,
                self.short_read_timeout
            );
        }
        Ok(())
    }
}

fn required<T>(
    section_name: &str,
    section: &HashMap<String, String>,
    key: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError> {
    let raw = section
        .get(&key.to_ascii_lowercase())
        .ok_or_else(|| ConfigError::MissingKey {
            section: section_name.to_string(),
            key: key.to_string(),
        })?;
    parse(raw).map_err(|message| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}': {}", raw, message),
    })
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs = raw.parse::<f64>().map_err(|e| e.to_string())?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

/// Serde helpers storing a `Duration` as fractional seconds
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Source of per-device-type configuration
pub trait ConfigProvider {
    /// Load the configuration for `device_type`
    fn load(&self, device_type: &str) -> Result<DeviceConfig, ConfigError>;
}

/// Where an [`IniConfigProvider`] looks for device sections
#[derive(Debug, Clone)]
enum IniLayout {
    /// `<dir>/<device_type>.INI`, section `[serial]`
    PerDevice(PathBuf),
    /// One file, one `[<device_type>]` section per device
    SingleFile(PathBuf),
}

/// Configuration provider backed by INI files
#[derive(Debug, Clone)]
pub struct IniConfigProvider {
    layout: IniLayout,
}

impl IniConfigProvider {
    /// One `<device_type>.INI` file per device inside `dir`
    pub fn per_device_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            layout: IniLayout::PerDevice(dir.as_ref().to_path_buf()),
        }
    }

    /// A single file with one section per device type
    pub fn single_file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            layout: IniLayout::SingleFile(path.as_ref().to_path_buf()),
        }
    }

    /// Per-device files under the user's config directory (`<config>/mculink`),
    /// falling back to the working directory
    pub fn default_location() -> Self {
        let dir = dirs::config_dir()
            .map(|d| d.join("mculink"))
            .filter(|d| d.is_dir())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::per_device_dir(dir)
    }

    /// Path of the file consulted for `device_type`
    pub fn path_for(&self, device_type: &str) -> PathBuf {
        match &self.layout {
            IniLayout::PerDevice(dir) => dir.join(format!("{}.INI", device_type)),
            IniLayout::SingleFile(path) => path.clone(),
        }
    }
}

impl ConfigProvider for IniConfigProvider {
    fn load(&self, device_type: &str) -> Result<DeviceConfig, ConfigError> {
        let path = self.path_for(device_type);
        let sections = read_ini_file(&path)?;
        let section_name = match &self.layout {
            IniLayout::PerDevice(_) => SERIAL_SECTION,
            IniLayout::SingleFile(_) => device_type,
        };
        let section = sections
            .get(section_name)
            .ok_or_else(|| ConfigError::MissingSection(section_name.to_string()))?;
        let config = DeviceConfig::from_section(section_name, section)?;
        tracing::debug!(
            "Loaded configuration for '{}' from {}: {:?}",
            device_type,
            path.display(),
            config
        );
        Ok(config)
    }
}

/// In-memory provider, mostly for tests and embedded defaults
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    configs: HashMap<String, DeviceConfig>,
}

impl StaticConfigProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configuration for a device type
    pub fn with(mut self, device_type: impl Into<String>, config: DeviceConfig) -> Self {
        self.configs.insert(device_type.into(), config);
        self
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn load(&self, device_type: &str) -> Result<DeviceConfig, ConfigError> {
        self.configs
            .get(device_type)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDevice(device_type.to_string()))
    }
}
