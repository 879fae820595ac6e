//! # mculink Core Library
//!
//! Finds microcontroller boards on serial ports and talks to them.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Port enumeration and device identification (`?` handshake)
//! - A verified, exclusively-owned link per device with bounded waits
//! - Per-device-type serial configuration from INI files
//! - Simulated devices for testing without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use mculink_core::prelude::*;
//!
//! // Which devices are plugged in?
//! let registry = DeviceEnumerator::new().scan();
//! let port = registry.port_of("Shutter").expect("Shutter not found");
//!
//! // Connect using Shutter.INI from the config directory
//! let provider = IniConfigProvider::default_location();
//! let mut link = DeviceLink::open(port, NamedProfile::new("Shutter"), &provider)?;
//! println!("{}", link.send_command(b"o"));
//! ```

pub mod config;
pub mod protocol;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigProvider, DeviceConfig, IniConfigProvider, StaticConfigProvider};
    pub use crate::protocol::{
        identify, DebouncePolicy, DeviceEnumerator, DeviceLink, DeviceProfile, DeviceRegistry,
        LinkError, LinkState, NamedProfile, PortFilter, ProbeSettings,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
