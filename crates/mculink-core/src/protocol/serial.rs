//! Serial port handling
//!
//! Host port listing, candidate filtering and presence checks.

use regex::RegexSet;
use serde::Serialize;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;

use super::{LinkError, PortIdentifier};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: PortIdentifier,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port with a name and no USB details
    pub fn bare(name: impl Into<PortIdentifier>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Key/value listing of the known fields
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = vec![("port", self.name.clone())];
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            entries.push(("usb_id", format!("{:04x}:{:04x}", vid, pid)));
        }
        if let Some(manufacturer) = &self.manufacturer {
            entries.push(("manufacturer", manufacturer.clone()));
        }
        if let Some(product) = &self.product {
            entries.push(("product", product.clone()));
        }
        if let Some(serial) = &self.serial_number {
            entries.push(("serial_number", serial.clone()));
        }
        entries
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Sort key putting ttyACM* first, then ttyUSB* (both numerically), then
/// everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("COM") {
        if let Ok(num) = rest.parse::<usize>() {
            return (2, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => tracing::warn!("Listing serial ports failed: {}", e),
    }

    // Linux-only: pick up ttyACM*/ttyUSB* nodes the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Look up the host's details for one port
pub fn port_info(name: &str) -> Option<PortInfo> {
    list_ports().into_iter().find(|p| p.name == name)
}

/// Whether the device behind `name` is still present on the host.
///
/// Path-like names are checked against the filesystem; other names (e.g.
/// `COM3`) against the host port list. This says nothing about whether the
/// device still answers.
pub fn port_present(name: &str) -> bool {
    let path = Path::new(name);
    if path.is_absolute() {
        return path.exists();
    }
    serialport::available_ports()
        .map(|ports| ports.iter().any(|p| p.port_name == name))
        .unwrap_or(false)
}

/// Default candidate patterns: Linux CDC-ACM and USB-serial nodes, macOS
/// USB modem/serial nodes, Windows COM ports
pub const DEFAULT_PORT_PATTERNS: &[&str] = &[
    r"^/dev/tty(ACM|USB)\d+$",
    r"^/dev/(cu|tty)\.(usbmodem|usbserial|wchusbserial)[\w.-]*$",
    r"^COM\d+$",
];

/// Selects which host ports are plausible microcontroller devices
#[derive(Debug, Clone)]
pub struct PortFilter {
    patterns: RegexSet,
}

impl PortFilter {
    /// Build a filter from regular expressions
    pub fn new<I, S>(patterns: I) -> Result<Self, LinkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSet::new(patterns)
            .map_err(|e| LinkError::Serial(format!("invalid port pattern: {}", e)))?;
        Ok(Self { patterns })
    }

    /// Accept every port
    pub fn any() -> Self {
        Self {
            patterns: RegexSet::new([r".*"]).expect("static pattern"),
        }
    }

    /// Whether `name` looks like a device port
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.is_match(name)
    }
}

impl Default for PortFilter {
    fn default() -> Self {
        Self {
            patterns: RegexSet::new(DEFAULT_PORT_PATTERNS).expect("default port patterns are valid"),
        }
    }
}

/// Configure a serial port for 8N1 device communication
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| LinkError::Serial(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| LinkError::Serial(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| LinkError::Serial(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| LinkError::Serial(e.to_string()))?;

    // Boards with native USB only start talking once DTR is asserted
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }

    Ok(())
}

/// Discard pending input on a serial port
pub fn clear_input(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.clear(serialport::ClearBuffer::Input)
        .map_err(|e| LinkError::Serial(e.to_string()))
}
