//! Byte-stream transport
//!
//! A [`Transport`] is a half-duplex, exclusively-owned line channel to one
//! port. [`SerialTransport`] is the real implementation over the
//! `serialport` crate; [`PortOpener`] lets callers substitute their own.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use super::{
    serial::{clear_input, configure_port},
    LinkError, LINE_DELIMITER, MAX_LINE_LEN,
};
use crate::config::DeviceConfig;

/// Parameters used to open a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Write timeout
    pub write_timeout: Duration,
    /// Default read timeout for one line
    pub read_timeout: Duration,
}

impl From<&DeviceConfig> for SerialSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            write_timeout: config.write_timeout,
            read_timeout: config.short_read_timeout,
        }
    }
}

/// Line-oriented byte channel to a single device
pub trait Transport: Send {
    /// Port this transport is bound to
    fn port_name(&self) -> &str;

    /// Write all bytes within the write timeout
    fn write(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Read until [`LINE_DELIMITER`] or the read timeout expires.
    ///
    /// Returns the bytes received before the delimiter. A timeout is not an
    /// error: whatever arrived (possibly nothing) is returned.
    fn read_line(&mut self) -> Result<Vec<u8>, LinkError>;

    /// Current read timeout
    fn read_timeout(&self) -> Duration;

    /// Change the read timeout for subsequent reads
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), LinkError>;

    /// Discard any buffered input
    fn clear_input(&mut self) -> Result<(), LinkError>;

    /// Release the port. Calling it again is a no-op.
    fn close(&mut self);

    /// Whether [`close`](Transport::close) has not been called yet
    fn is_open(&self) -> bool;
}

/// Opens transports by port name
pub trait PortOpener: Send + Sync {
    /// Open `port` with the given parameters
    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn Transport>, LinkError>;
}

/// Opens real serial ports (8N1, no flow control)
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn Transport>, LinkError> {
        Ok(Box::new(SerialTransport::open(port, settings)?))
    }
}

/// Reassembles delimited lines from a chunked byte source.
///
/// Bytes that arrive after a delimiter are kept for the next call.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Drop everything buffered so far
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    /// Split a complete line off the front, if one is there
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == LINE_DELIMITER)?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        Some(line)
    }

    /// Read one line, calling `read_chunk` with the time left until the
    /// deadline.
    ///
    /// When the deadline passes, or the source reports a timeout or end of
    /// input, the partial line is returned. More than [`MAX_LINE_LEN`] bytes
    /// without a delimiter is an error and empties the buffer.
    pub(crate) fn read_line<F>(
        &mut self,
        timeout: Duration,
        mut read_chunk: F,
    ) -> Result<Vec<u8>, LinkError>
    where
        F: FnMut(&mut [u8], Duration) -> std::io::Result<usize>,
    {
        if let Some(line) = self.take_line() {
            return Ok(line);
        }

        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; 256];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match read_chunk(&mut buffer, remaining) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.extend_from_slice(&buffer[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(line);
                    }
                    if self.pending.len() > MAX_LINE_LEN {
                        self.pending.clear();
                        return Err(LinkError::LineTooLong(MAX_LINE_LEN));
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(e) => return Err(LinkError::Io(e)),
            }
        }

        tracing::trace!(
            "Read timed out after {:?} with {} bytes",
            timeout,
            self.pending.len()
        );
        Ok(std::mem::take(&mut self.pending))
    }
}

/// [`Transport`] over a host serial port
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    write_timeout: Duration,
    read_timeout: Duration,
    lines: LineBuffer,
}

impl SerialTransport {
    /// Open and configure `name`
    pub fn open(name: &str, settings: &SerialSettings) -> Result<Self, LinkError> {
        let mut port = serialport::new(name, settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| LinkError::ConnectionFailed {
                port: name.to_string(),
                reason: e.to_string(),
            })?;
        configure_port(port.as_mut())?;

        tracing::debug!(
            "Opened {} at {} baud (write timeout {:?}, read timeout {:?})",
            name,
            settings.baud_rate,
            settings.write_timeout,
            settings.read_timeout
        );

        Ok(Self {
            name: name.to_string(),
            port: Some(port),
            write_timeout: settings.write_timeout,
            read_timeout: settings.read_timeout,
            lines: LineBuffer::default(),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        self.port.as_mut().ok_or(LinkError::NotConnected)
    }
}

impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let write_timeout = self.write_timeout;
        let port = self.port_mut()?;
        port.set_timeout(write_timeout)
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        port.write_all(data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                LinkError::Serial(format!("write timed out after {:?}", write_timeout))
            } else {
                LinkError::Io(e)
            }
        })?;
        tracing::trace!("{}: wrote {} bytes: {:02x?}", self.name, data.len(), data);
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        let timeout = self.read_timeout;
        let port = self.port.as_mut().ok_or(LinkError::NotConnected)?;
        let line = self.lines.read_line(timeout, |buffer, remaining| {
            port.set_timeout(remaining)?;
            port.read(buffer)
        })?;
        tracing::trace!("{}: read {} bytes: {:02x?}", self.name, line.len(), line);
        Ok(line)
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.lines.clear();
        let port = self.port_mut()?;
        clear_input(&mut **port)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!("Closed {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_line;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::io;

    /// Chunks handed out one per read; `Err` entries stand for a timed-out read
    fn chunks(items: Vec<Result<&str, io::ErrorKind>>) -> VecDeque<Result<Vec<u8>, io::ErrorKind>> {
        items.into_iter().map(|c| c.map(|s| s.as_bytes().to_vec())).collect()
    }

    fn read_from(
        lines: &mut LineBuffer,
        source: &mut VecDeque<Result<Vec<u8>, io::ErrorKind>>,
    ) -> Result<Vec<u8>, LinkError> {
        lines.read_line(Duration::from_secs(1), |buffer, _| match source.pop_front() {
            Some(Ok(chunk)) => {
                buffer[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            Some(Err(kind)) => Err(io::Error::from(kind)),
            None => Err(io::Error::from(io::ErrorKind::TimedOut)),
        })
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Ok("Shut"), Ok("ter"), Ok("\n")]);
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"Shutter".to_vec());
        assert!(source.is_empty());
    }

    #[test]
    fn test_several_lines_in_one_chunk() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Ok("one\ntwo\nthr"), Ok("ee\n")]);

        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"one".to_vec());
        // served from the leftover bytes without touching the source
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"two".to_vec());
        assert_eq!(source.len(), 1);
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"three".to_vec());
    }

    #[test]
    fn test_crlf_line_decodes_without_delimiter() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Ok("  Thermo\r\n")]);

        let raw = read_from(&mut lines, &mut source).unwrap();
        assert_eq!(raw, b"  Thermo\r".to_vec());
        assert_eq!(decode_line(&raw).unwrap(), "Thermo");
    }

    #[test]
    fn test_timeout_returns_partial_line() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Ok("Sta"), Err(io::ErrorKind::TimedOut), Ok("ge\n")]);

        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"Sta".to_vec());
        // the partial line is handed out once, not repeated
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"ge".to_vec());
    }

    #[test]
    fn test_would_block_counts_as_timeout() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Err(io::ErrorKind::WouldBlock)]);
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_other_io_errors_propagate() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Err(io::ErrorKind::BrokenPipe)]);
        assert!(matches!(read_from(&mut lines, &mut source), Err(LinkError::Io(_))));
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let mut lines = LineBuffer::default();
        let block = vec![b'x'; 256];
        let mut source: VecDeque<Result<Vec<u8>, io::ErrorKind>> =
            (0..=MAX_LINE_LEN / 256).map(|_| Ok(block.clone())).collect();
        source.push_back(Ok(b"ok\n".to_vec()));

        assert!(matches!(
            read_from(&mut lines, &mut source),
            Err(LinkError::LineTooLong(MAX_LINE_LEN))
        ));
        // the overflow is discarded and the next line reads cleanly
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"ok".to_vec());
    }

    #[test]
    fn test_clear_drops_leftover_bytes() {
        let mut lines = LineBuffer::default();
        let mut source = chunks(vec![Ok("old\nstale")]);
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"old".to_vec());

        lines.clear();
        let mut source = chunks(vec![Ok("fresh\n")]);
        assert_eq!(read_from(&mut lines, &mut source).unwrap(), b"fresh".to_vec());
    }

    #[test]
    fn test_settings_from_config() {
        let config = DeviceConfig {
            baud_rate: 9600,
            ..DeviceConfig::default()
        };
        let settings = SerialSettings::from(&config);
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.write_timeout, config.write_timeout);
        assert_eq!(settings.read_timeout, config.short_read_timeout);
    }
}
