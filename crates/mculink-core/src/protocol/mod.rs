//! Device link protocol
//!
//! Identification handshake, port enumeration and the line-based
//! command/response exchange with microcontroller devices.
//!
//! The host sends the single query byte `?` and the device answers with one
//! newline-terminated line holding its device-type name. Every other command
//! is an opaque byte string answered by one text line.

mod enumerate;
mod error;
mod identify;
mod link;
mod profile;
pub mod serial;
mod transport;

pub use enumerate::{DeviceEnumerator, DeviceRegistry};
pub use error::LinkError;
pub use identify::{identify, identify_with, ProbeSettings};
pub use link::{CommandExchange, DebouncePolicy, DeviceLink, FailureReason, LinkInfo, LinkState};
pub use profile::{DeviceProfile, NamedProfile};
pub use serial::{list_ports, port_present, PortFilter, PortInfo};
pub use transport::{PortOpener, SerialOpener, SerialSettings, SerialTransport, Transport};

/// Host-specific port name such as `/dev/ttyACM0` or `COM3`
pub type PortIdentifier = String;

/// Byte sent to ask a device for its name
pub const QUERY_BYTE: u8 = b'?';

/// Terminator of every device response line
pub const LINE_DELIMITER: u8 = b'\n';

/// Longest response line accepted before giving up on it
pub const MAX_LINE_LEN: usize = 4096;

/// Default baud rate for device communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Strip leading and trailing ASCII whitespace (including `\r`)
pub(crate) fn trim_line(raw: &[u8]) -> &[u8] {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &raw[start..end]
}

/// Decode a trimmed response line as UTF-8 text
pub(crate) fn decode_line(raw: &[u8]) -> Result<String, LinkError> {
    std::str::from_utf8(trim_line(raw))
        .map(|s| s.to_string())
        .map_err(|e| LinkError::Decode(format!("{} in {:02x?}", e, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_line() {
        assert_eq!(trim_line(b"  Shutter\r"), b"Shutter");
        assert_eq!(trim_line(b"\r\n"), b"");
        assert_eq!(trim_line(b""), b"");
        assert_eq!(trim_line(b"a b"), b"a b");
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"Shutter\r").unwrap(), "Shutter");
        assert!(matches!(
            decode_line(&[0xff, 0xfe, b'x']),
            Err(LinkError::Decode(_))
        ));
    }
}
