//! Simulated devices for testing without hardware
//!
//! A [`SimulatedDevice`] answers the identification query with a scripted
//! sequence of replies, can echo or map commands to responses, and records
//! everything the host did to it. [`SimOpener`] hands out transports bound
//! to simulated devices by port name, refusing unknown and busy ports the
//! way a real host does.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::{
    LinkError, PortIdentifier, PortOpener, SerialSettings, Transport, LINE_DELIMITER, QUERY_BYTE,
};

/// How the device answers one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A line available to the next read
    Line(Vec<u8>),
    /// A line that misses the next read and arrives on the one after
    Delayed(Vec<u8>),
    /// Nothing at all
    Silence,
}

#[derive(Debug, Default)]
struct SimState {
    identity: Option<Vec<u8>>,
    query_script: VecDeque<Reply>,
    responses: HashMap<Vec<u8>, Reply>,
    echo: bool,
    fail_writes: bool,

    /// Host-visible input; `None` is a read that times out
    rx: VecDeque<Option<Vec<u8>>>,

    open: bool,
    open_count: usize,
    close_count: usize,
    open_settings: Vec<SerialSettings>,
    writes: Vec<Vec<u8>>,
    read_timeouts: Vec<Duration>,
}

impl SimState {
    fn queue(&mut self, reply: Reply) {
        match reply {
            Reply::Line(line) => self.rx.push_back(Some(line)),
            Reply::Delayed(line) => {
                self.rx.push_back(None);
                self.rx.push_back(Some(line));
            }
            Reply::Silence => {}
        }
    }

    fn answer(&mut self, data: &[u8]) {
        if data == [QUERY_BYTE] {
            let reply = self
                .query_script
                .pop_front()
                .or_else(|| self.identity.clone().map(Reply::Line))
                .unwrap_or(Reply::Silence);
            self.queue(reply);
            return;
        }

        if let Some(reply) = self.responses.get(data).cloned() {
            self.queue(reply);
        } else if self.echo {
            let line = data.strip_suffix(&[LINE_DELIMITER]).unwrap_or(data).to_vec();
            self.queue(Reply::Line(line));
        }
    }
}

/// Shared handle to a simulated device
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// Device answering the query byte with `identity`
    pub fn new(identity: &str) -> Self {
        let device = Self::default();
        device.lock().identity = Some(identity.as_bytes().to_vec());
        device
    }

    /// Device that never answers the query byte unless scripted
    pub fn silent() -> Self {
        Self::default()
    }

    /// Answer the next query with `reply` before falling back to the identity
    pub fn with_query_reply(self, reply: Reply) -> Self {
        self.lock().query_script.push_back(reply);
        self
    }

    /// Echo every non-query command back as a line
    pub fn with_echo(self) -> Self {
        self.lock().echo = true;
        self
    }

    /// Answer `command` with `reply`
    pub fn with_response(self, command: &[u8], reply: Reply) -> Self {
        self.lock().responses.insert(command.to_vec(), reply);
        self
    }

    /// Make every write fail
    pub fn failing_writes(self) -> Self {
        self.lock().fail_writes = true;
        self
    }

    /// Bytes written by the host, one entry per write
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Read timeout in effect at each host read
    pub fn read_timeouts(&self) -> Vec<Duration> {
        self.lock().read_timeouts.clone()
    }

    /// Settings of every open, in order
    pub fn open_settings(&self) -> Vec<SerialSettings> {
        self.lock().open_settings.clone()
    }

    /// Number of times the device was opened
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Number of times an open transport was closed
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// Whether a transport currently holds the device
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Transport bound to a [`SimulatedDevice`]
#[derive(Debug)]
pub struct SimTransport {
    name: PortIdentifier,
    device: SimulatedDevice,
    read_timeout: Duration,
    open: bool,
}

impl Transport for SimTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        let mut state = self.device.lock();
        if state.fail_writes {
            return Err(LinkError::Serial("simulated write failure".to_string()));
        }
        state.writes.push(data.to_vec());
        state.answer(data);
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        let mut state = self.device.lock();
        state.read_timeouts.push(self.read_timeout);
        Ok(state.rx.pop_front().flatten().unwrap_or_default())
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        // Only lines that already arrived are discarded; delayed ones are still in flight
        let mut state = self.device.lock();
        while matches!(state.rx.front(), Some(Some(_))) {
            state.rx.pop_front();
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut state = self.device.lock();
            state.open = false;
            state.close_count += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens [`SimTransport`]s by port name
#[derive(Debug, Clone, Default)]
pub struct SimOpener {
    devices: HashMap<PortIdentifier, SimulatedDevice>,
}

impl SimOpener {
    /// Opener with no devices attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `device` at `port`
    pub fn with_device(mut self, port: impl Into<PortIdentifier>, device: SimulatedDevice) -> Self {
        self.devices.insert(port.into(), device);
        self
    }

    /// Device attached at `port`
    pub fn device(&self, port: &str) -> Option<&SimulatedDevice> {
        self.devices.get(port)
    }
}

impl PortOpener for SimOpener {
    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn Transport>, LinkError> {
        let device = self
            .devices
            .get(port)
            .ok_or_else(|| LinkError::ConnectionFailed {
                port: port.to_string(),
                reason: "no such device".to_string(),
            })?;

        {
            let mut state = device.lock();
            if state.open {
                return Err(LinkError::ConnectionFailed {
                    port: port.to_string(),
                    reason: "device or resource busy".to_string(),
                });
            }
            state.open = true;
            state.open_count += 1;
            state.open_settings.push(*settings);
            state.rx.clear();
        }

        Ok(Box::new(SimTransport {
            name: port.to_string(),
            device: device.clone(),
            read_timeout: settings.read_timeout,
            open: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SerialSettings {
        SerialSettings {
            baud_rate: 115200,
            write_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_busy_port_refused() {
        let opener = SimOpener::new().with_device("/dev/ttyACM0", SimulatedDevice::new("A"));
        let first = opener.open("/dev/ttyACM0", &settings()).unwrap();
        assert!(matches!(
            opener.open("/dev/ttyACM0", &settings()),
            Err(LinkError::ConnectionFailed { .. })
        ));
        drop(first);
        assert!(opener.open("/dev/ttyACM0", &settings()).is_ok());
    }

    #[test]
    fn test_delayed_reply_skips_one_read() {
        let device = SimulatedDevice::silent().with_query_reply(Reply::Delayed(b"A".to_vec()));
        let opener = SimOpener::new().with_device("p", device);
        let mut t = opener.open("p", &settings()).unwrap();
        t.write(b"?").unwrap();
        assert_eq!(t.read_line().unwrap(), b"");
        assert_eq!(t.read_line().unwrap(), b"A");
        assert_eq!(t.read_line().unwrap(), b"");
    }

    #[test]
    fn test_mapped_response_wins_over_echo() {
        let device = SimulatedDevice::silent()
            .with_echo()
            .with_response(b"T\n", Reply::Line(b"21.5".to_vec()));
        let opener = SimOpener::new().with_device("p", device);
        let mut t = opener.open("p", &settings()).unwrap();
        t.write(b"T\n").unwrap();
        assert_eq!(t.read_line().unwrap(), b"21.5");
        t.write(b"hello\n").unwrap();
        assert_eq!(t.read_line().unwrap(), b"hello");
    }
}
