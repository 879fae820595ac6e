//! Identification handshake
//!
//! Asks whatever sits on a port for its name without knowing its type in
//! advance, so probing uses fixed, generous timings rather than a device
//! configuration.

use std::time::Duration;

use super::{
    decode_line, trim_line, LinkError, PortOpener, SerialOpener, SerialSettings, Transport,
    DEFAULT_BAUD_RATE, QUERY_BYTE,
};

/// Timing used while probing an unknown device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Baud rate used for every probe
    pub baud_rate: u32,
    /// Write timeout for the query byte
    pub write_timeout: Duration,
    /// Timeout of the first read
    pub read_timeout: Duration,
    /// Timeout of the second read after an empty first answer. Boards with
    /// non-native USB may still be booting after the port opened.
    pub escalated_read_timeout: Duration,
    /// Answers this short (but non-empty) are treated as garbled and asked again
    pub short_answer_len: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            write_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(1),
            escalated_read_timeout: Duration::from_secs(5),
            short_answer_len: 2,
        }
    }
}

impl ProbeSettings {
    fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
        }
    }
}

/// Ask the device on `port` for its name.
///
/// Returns an empty string if the port cannot be opened, nothing answers,
/// or the answer is not valid text.
pub fn identify(port: &str, settings: &ProbeSettings) -> String {
    identify_with(&SerialOpener, port, settings)
}

/// [`identify`] through a caller-supplied opener
pub fn identify_with(opener: &dyn PortOpener, port: &str, settings: &ProbeSettings) -> String {
    let transport = match opener.open(port, &settings.serial_settings()) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!("identify: {} unavailable: {}", port, e);
            return String::new();
        }
    };

    let raw = {
        let mut guard = ProbeGuard(transport);
        match probe(guard.0.as_mut(), settings) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("identify: probing {} failed: {}", port, e);
                return String::new();
            }
        }
    };

    match decode_line(&raw) {
        Ok(identity) => {
            tracing::debug!("identify: {} answered {:?}", port, identity);
            identity
        }
        Err(e) => {
            tracing::warn!("identify: {} sent an unreadable answer: {}", port, e);
            String::new()
        }
    }
}

/// Closes the probe transport on every exit path
struct ProbeGuard(Box<dyn Transport>);

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn probe(transport: &mut dyn Transport, settings: &ProbeSettings) -> Result<Vec<u8>, LinkError> {
    transport.clear_input()?;
    transport.write(&[QUERY_BYTE])?;
    let first = read_with_escalation(transport, settings.escalated_read_timeout)?;

    if !first.escalated && !first.line.is_empty() && first.line.len() <= settings.short_answer_len {
        tracing::debug!(
            "identify: short answer {:02x?} from {}, asking again",
            first.line,
            transport.port_name()
        );
        transport.clear_input()?;
        transport.write(&[QUERY_BYTE])?;
        return Ok(trim_line(&transport.read_line()?).to_vec());
    }

    Ok(first.line)
}

/// Outcome of [`read_with_escalation`]
pub(crate) struct EscalatedRead {
    /// Trimmed line
    pub line: Vec<u8>,
    /// Whether the first read came back empty and a second one was made
    pub escalated: bool,
}

/// Read one line; if it is empty, read once more with `escalated_timeout`
/// without rewriting anything, then restore the previous timeout.
pub(crate) fn read_with_escalation(
    transport: &mut dyn Transport,
    escalated_timeout: Duration,
) -> Result<EscalatedRead, LinkError> {
    let first = trim_line(&transport.read_line()?).to_vec();
    if !first.is_empty() {
        return Ok(EscalatedRead {
            line: first,
            escalated: false,
        });
    }

    let default_timeout = transport.read_timeout();
    tracing::debug!(
        "No answer from {} within {:?}, waiting up to {:?}",
        transport.port_name(),
        default_timeout,
        escalated_timeout
    );
    transport.set_read_timeout(escalated_timeout)?;
    let second = transport.read_line();
    transport.set_read_timeout(default_timeout)?;

    Ok(EscalatedRead {
        line: trim_line(&second?).to_vec(),
        escalated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Reply, SimOpener, SimulatedDevice};

    const PORT: &str = "/dev/ttyACM0";

    fn opener_with(device: &SimulatedDevice) -> SimOpener {
        SimOpener::new().with_device(PORT, device.clone())
    }

    #[test]
    fn test_identify_plain_answer() {
        let device = SimulatedDevice::new("Shutter");
        let id = identify_with(&opener_with(&device), PORT, &ProbeSettings::default());
        assert_eq!(id, "Shutter");
        assert_eq!(device.writes(), vec![vec![QUERY_BYTE]]);
        assert!(!device.is_open());
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn test_identify_uses_probe_settings() {
        let device = SimulatedDevice::new("Shutter");
        let settings = ProbeSettings::default();
        identify_with(&opener_with(&device), PORT, &settings);
        assert_eq!(device.open_settings(), vec![settings.serial_settings()]);
    }

    #[test]
    fn test_identify_escalates_on_empty_first_read() {
        let device = SimulatedDevice::silent().with_query_reply(Reply::Delayed(b"Shutter".to_vec()));
        let settings = ProbeSettings::default();
        let id = identify_with(&opener_with(&device), PORT, &settings);
        assert_eq!(id, "Shutter");
        // no second query byte on escalation
        assert_eq!(device.writes().len(), 1);
        assert_eq!(
            device.read_timeouts(),
            vec![settings.read_timeout, settings.escalated_read_timeout]
        );
    }

    #[test]
    fn test_identify_retries_short_answer() {
        let device = SimulatedDevice::new("Shutter").with_query_reply(Reply::Line(b"Sh".to_vec()));
        let id = identify_with(&opener_with(&device), PORT, &ProbeSettings::default());
        assert_eq!(id, "Shutter");
        assert_eq!(device.writes().len(), 2);
    }

    #[test]
    fn test_identify_keeps_second_answer_even_if_short() {
        let device = SimulatedDevice::silent()
            .with_query_reply(Reply::Line(b"x".to_vec()))
            .with_query_reply(Reply::Line(b"y".to_vec()));
        let id = identify_with(&opener_with(&device), PORT, &ProbeSettings::default());
        assert_eq!(id, "y");
    }

    #[test]
    fn test_identify_silent_device() {
        let device = SimulatedDevice::silent();
        let id = identify_with(&opener_with(&device), PORT, &ProbeSettings::default());
        assert_eq!(id, "");
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn test_identify_invalid_utf8_is_empty() {
        let device = SimulatedDevice::silent().with_query_reply(Reply::Line(vec![0xff, 0xfe, 0xfd]));
        let id = identify_with(&opener_with(&device), PORT, &ProbeSettings::default());
        assert_eq!(id, "");
        assert!(!device.is_open());
    }

    #[test]
    fn test_identify_closes_on_write_failure() {
        let device = SimulatedDevice::new("Shutter").failing_writes();
        let id = identify_with(&opener_with(&device), PORT, &ProbeSettings::default());
        assert_eq!(id, "");
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn test_identify_unknown_port() {
        let id = identify_with(&SimOpener::new(), "/dev/ttyACM9", &ProbeSettings::default());
        assert_eq!(id, "");
    }
}
