//! Loading device configuration from INI files and building links from it

use mculink_core::config::{ConfigError, ConfigProvider, DeviceConfig, IniConfigProvider, StaticConfigProvider};
use mculink_core::protocol::{DeviceLink, FailureReason, LinkError, LinkState, NamedProfile};
use mculink_core::sim::{SimOpener, SimulatedDevice};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SHUTTER_INI: &str = r#"
; Shutter controller
[serial]
COMPORTSPEED = 115200
WRITETIMEOUT = 0.2
READTIMEOUT = 1
LONGREADTIMEOUT = 7.5
SHORTESTTIMEBETWEENREADS = 0.46

[Shutter]
; device-specific settings live in their own section
steps = 200
"#;

#[test]
fn test_per_device_dir() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("Shutter.INI"), SHUTTER_INI).unwrap();

    let provider = IniConfigProvider::per_device_dir(dir.path());
    let config = provider.load("Shutter").unwrap();
    assert_eq!(
        config,
        DeviceConfig {
            baud_rate: 115200,
            write_timeout: Duration::from_millis(200),
            short_read_timeout: Duration::from_secs(1),
            long_read_timeout: Duration::from_millis(7500),
            min_command_interval: Duration::from_millis(460),
        }
    );
}

#[test]
fn test_per_device_dir_missing_file() {
    let dir = TempDir::new().unwrap();
    let provider = IniConfigProvider::per_device_dir(dir.path());
    assert!(matches!(provider.load("Shutter"), Err(ConfigError::NotFound(_))));
}

#[test]
fn test_per_device_dir_missing_section() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("Shutter.INI"), "[Shutter]\nsteps = 200\n").unwrap();
    let provider = IniConfigProvider::per_device_dir(dir.path());
    assert!(matches!(
        provider.load("Shutter"),
        Err(ConfigError::MissingSection(ref s)) if s == "serial"
    ));
}

#[test]
fn test_single_file_sections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("devices.ini");
    std::fs::write(
        &path,
        "[Shutter]\nCOMPORTSPEED = 115200\nWRITETIMEOUT = 0.2\nREADTIMEOUT = 1\n\
         LONGREADTIMEOUT = 5\nSHORTESTTIMEBETWEENREADS = 0.46\n\n\
         [Thermo]\ncomportspeed = 9600\nwritetimeout = 0.5\nreadtimeout = 2\n\
         longreadtimeout = 10\nshortesttimebetweenreads = 1\n",
    )
    .unwrap();

    let provider = IniConfigProvider::single_file(&path);
    assert_eq!(provider.load("Shutter").unwrap().baud_rate, 115200);
    let thermo = provider.load("Thermo").unwrap();
    assert_eq!(thermo.baud_rate, 9600);
    assert_eq!(thermo.long_read_timeout, Duration::from_secs(10));
    assert!(matches!(
        provider.load("Stage"),
        Err(ConfigError::MissingSection(_))
    ));
}

#[test]
fn test_open_fails_without_config() {
    let dir = TempDir::new().unwrap();
    let provider = IniConfigProvider::per_device_dir(dir.path());
    let opener = SimOpener::new().with_device("/dev/ttyACM0", SimulatedDevice::new("Shutter"));

    let err = DeviceLink::open_with(
        "/dev/ttyACM0",
        NamedProfile::new("Shutter"),
        &provider,
        Arc::new(opener.clone()),
    )
    .unwrap_err();
    assert!(matches!(err, LinkError::Config(ConfigError::NotFound(_))));
    // the port is never touched without a configuration
    assert_eq!(opener.device("/dev/ttyACM0").unwrap().open_count(), 0);
}

#[test]
fn test_open_fails_on_unopenable_port() {
    let provider = StaticConfigProvider::new().with("Shutter", DeviceConfig::default());
    let err = DeviceLink::open_with(
        "/dev/ttyACM0",
        NamedProfile::new("Shutter"),
        &provider,
        Arc::new(SimOpener::new()),
    )
    .unwrap_err();
    assert!(matches!(err, LinkError::ConnectionFailed { .. }));
}

#[test]
fn test_open_with_wrong_device_returns_failed_link() {
    let provider = StaticConfigProvider::new().with("Shutter", DeviceConfig::default());
    let opener = SimOpener::new().with_device("/dev/ttyACM0", SimulatedDevice::new("Thermo"));

    let link = DeviceLink::open_with(
        "/dev/ttyACM0",
        NamedProfile::new("Shutter"),
        &provider,
        Arc::new(opener.clone()),
    )
    .unwrap();
    assert!(matches!(
        link.state(),
        LinkState::Failed(FailureReason::IdentityMismatch { .. })
    ));
    assert!(opener.device("/dev/ttyACM0").unwrap().is_open());
}

#[test]
fn test_open_uses_loaded_config() {
    let config = DeviceConfig {
        baud_rate: 57600,
        ..DeviceConfig::default()
    };
    let provider = StaticConfigProvider::new().with("Shutter", config.clone());
    let opener = SimOpener::new().with_device("/dev/ttyACM0", SimulatedDevice::new("Shutter"));

    let link = DeviceLink::open_with(
        "/dev/ttyACM0",
        NamedProfile::new("Shutter"),
        &provider,
        Arc::new(opener.clone()),
    )
    .unwrap();
    assert_eq!(link.state(), &LinkState::Connected);
    assert_eq!(link.config(), &config);
    assert_eq!(
        opener.device("/dev/ttyACM0").unwrap().open_settings()[0].baud_rate,
        57600
    );
}
