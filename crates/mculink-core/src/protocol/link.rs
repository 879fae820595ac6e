//! Device link
//!
//! Owns the transport to one identified device and runs the
//! command/response exchange with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    decode_line,
    identify::read_with_escalation,
    serial::{port_info, port_present},
    DeviceProfile, LinkError, PortIdentifier, PortInfo, PortOpener, SerialOpener, SerialSettings,
    Transport, QUERY_BYTE,
};
use crate::config::{ConfigProvider, DeviceConfig};

/// Why a link ended up failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The port could not be opened
    OpenFailed(String),
    /// The device answered with another name
    IdentityMismatch { expected: String, actual: String },
    /// I/O failed during the handshake
    Handshake(String),
    /// The profile's post-connect hook failed
    ProfileHook(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::OpenFailed(reason) => write!(f, "open failed: {}", reason),
            FailureReason::IdentityMismatch { expected, actual } => {
                write!(f, "got '{}', but expected '{}'", actual, expected)
            }
            FailureReason::Handshake(reason) => write!(f, "handshake failed: {}", reason),
            FailureReason::ProfileHook(reason) => write!(f, "initialization failed: {}", reason),
        }
    }
}

/// Lifecycle of a [`DeviceLink`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Transport not opened yet
    Unopened,
    /// Handshake in progress
    Probing,
    /// The device answered the query with this name
    Identified(String),
    /// Connection could not be established
    Failed(FailureReason),
    /// Identified as the expected device and ready for commands
    Connected,
    /// The device went away or the link was released
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Unopened => write!(f, "unopened"),
            LinkState::Probing => write!(f, "probing"),
            LinkState::Identified(identity) => write!(f, "identified as '{}'", identity),
            LinkState::Failed(reason) => write!(f, "failed ({})", reason),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One command and the answer it got
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExchange {
    /// Bytes written to the device
    pub request: Vec<u8>,
    /// Decoded, trimmed answer
    pub response: String,
    /// When the answer was read
    pub timestamp: Instant,
}

/// What to do with a command repeated too soon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebouncePolicy {
    /// Every command goes to the device
    #[default]
    Disabled,
    /// A command identical to the previous one and issued within
    /// `min_command_interval` of it gets the previous answer without
    /// touching the device
    ReturnPrevious,
}

/// Link to one identified device on one port
pub struct DeviceLink {
    port: PortIdentifier,
    config: DeviceConfig,
    profile: Arc<dyn DeviceProfile>,
    opener: Arc<dyn PortOpener>,
    transport: Option<Box<dyn Transport>>,
    state: LinkState,
    debounce: DebouncePolicy,
    last_exchange: Option<CommandExchange>,
    connected_at: Option<DateTime<Utc>>,
}

impl DeviceLink {
    /// Create a link (not yet connected)
    pub fn new<P>(port: impl Into<PortIdentifier>, config: DeviceConfig, profile: P) -> Self
    where
        P: DeviceProfile + 'static,
    {
        Self::with_shared_profile(port, config, Arc::new(profile))
    }

    /// Create a link from an already shared profile
    pub fn with_shared_profile(
        port: impl Into<PortIdentifier>,
        config: DeviceConfig,
        profile: Arc<dyn DeviceProfile>,
    ) -> Self {
        Self {
            port: port.into(),
            config,
            profile,
            opener: Arc::new(SerialOpener),
            transport: None,
            state: LinkState::Unopened,
            debounce: DebouncePolicy::default(),
            last_exchange: None,
            connected_at: None,
        }
    }

    /// Load the profile's configuration, then connect.
    ///
    /// Fails if the configuration cannot be loaded or the port cannot be
    /// opened. Any later failure (wrong device, handshake I/O, profile hook)
    /// is logged and leaves the returned link in [`LinkState::Failed`].
    pub fn open<P>(
        port: impl Into<PortIdentifier>,
        profile: P,
        provider: &dyn ConfigProvider,
    ) -> Result<Self, LinkError>
    where
        P: DeviceProfile + 'static,
    {
        Self::open_with(port, profile, provider, Arc::new(SerialOpener))
    }

    /// [`open`](DeviceLink::open) through a caller-supplied opener
    pub fn open_with<P>(
        port: impl Into<PortIdentifier>,
        profile: P,
        provider: &dyn ConfigProvider,
        opener: Arc<dyn PortOpener>,
    ) -> Result<Self, LinkError>
    where
        P: DeviceProfile + 'static,
    {
        let config = provider.load(profile.name())?;
        let mut link = Self::new(port, config, profile).with_opener(opener);
        if let Err(e) = link.connect() {
            if link.transport.is_none() {
                return Err(e);
            }
        }
        Ok(link)
    }

    /// Use `opener` instead of the host serial ports
    pub fn with_opener(mut self, opener: Arc<dyn PortOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Set the policy for commands repeated within `min_command_interval`
    pub fn with_debounce(mut self, policy: DebouncePolicy) -> Self {
        self.debounce = policy;
        self
    }

    /// Port this link is bound to
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Name the device is expected to answer with
    pub fn device_name(&self) -> &str {
        self.profile.name()
    }

    /// Serial parameters of this link
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Debounce policy in effect
    pub fn debounce(&self) -> DebouncePolicy {
        self.debounce
    }

    /// Most recent exchange with the device
    pub fn last_exchange(&self) -> Option<&CommandExchange> {
        self.last_exchange.as_ref()
    }

    /// When the device last answered a command
    pub fn last_communication(&self) -> Option<Instant> {
        self.last_exchange.as_ref().map(|e| e.timestamp)
    }

    /// Open the port with this link's configuration and verify the device
    /// identity.
    ///
    /// On a mismatch the transport stays open and the link is marked
    /// failed. Calling this again reconnects from scratch, dropping the
    /// cached exchange and connection time.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.close_transport();
        // nothing from an earlier session carries over
        self.last_exchange = None;
        self.connected_at = None;
        self.state = LinkState::Probing;

        let settings = SerialSettings::from(&self.config);
        let transport = match self.opener.open(&self.port, &settings) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(
                    "Error establishing communication with {} device at {}: {}",
                    self.profile.name(),
                    self.port,
                    e
                );
                self.state = LinkState::Failed(FailureReason::OpenFailed(e.to_string()));
                return Err(e);
            }
        };
        self.transport = Some(transport);

        let identity = match self.handshake() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!("Handshake with {} failed: {}", self.port, e);
                self.state = LinkState::Failed(FailureReason::Handshake(e.to_string()));
                return Err(e);
            }
        };
        self.state = LinkState::Identified(identity.clone());

        let expected = self.profile.name().to_string();
        if identity != expected {
            tracing::error!(
                "Got '{}', but expected '{}' while establishing communication on {}",
                identity,
                expected,
                self.port
            );
            self.state = LinkState::Failed(FailureReason::IdentityMismatch {
                expected: expected.clone(),
                actual: identity.clone(),
            });
            return Err(LinkError::IdentityMismatch {
                expected,
                actual: identity,
            });
        }

        self.state = LinkState::Connected;
        self.connected_at = Some(Utc::now());
        tracing::info!("Connected to {}", self);

        let profile = Arc::clone(&self.profile);
        if let Err(e) = profile.after_connect(self) {
            tracing::error!("Initializing {} failed: {}", self, e);
            self.state = LinkState::Failed(FailureReason::ProfileHook(e.to_string()));
            return Err(e);
        }

        Ok(())
    }

    /// Send the query byte and read the device name, escalating to the
    /// long read timeout when the first read is empty
    fn handshake(&mut self) -> Result<String, LinkError> {
        let long_timeout = self.config.long_read_timeout;
        let transport = self.transport.as_deref_mut().ok_or(LinkError::NotConnected)?;

        transport.clear_input()?;
        transport.write(&[QUERY_BYTE])?;
        let read = read_with_escalation(transport, long_timeout)?;

        Ok(decode_line(&read.line).unwrap_or_else(|e| {
            tracing::warn!("Unreadable identity from {}: {}", self.port, e);
            String::new()
        }))
    }

    /// Whether the device is still present on the host.
    ///
    /// Checks that the transport is held and the port still exists; no
    /// bytes are exchanged, so a hung device still reports `true`.
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open()) && port_present(&self.port)
    }

    /// Send `cmd` and wait up to the short read timeout for one line.
    ///
    /// Returns an empty string if the link is not connected, the device
    /// is gone, or nothing (readable) came back.
    pub fn send_command(&mut self, cmd: &[u8]) -> String {
        self.exchange(cmd, None)
    }

    /// Like [`send_command`](DeviceLink::send_command) but waits up to the
    /// long read timeout
    pub fn send_command_long(&mut self, cmd: &[u8]) -> String {
        let long_timeout = self.config.long_read_timeout;
        self.exchange(cmd, Some(long_timeout))
    }

    fn exchange(&mut self, cmd: &[u8], long_timeout: Option<Duration>) -> String {
        if self.state != LinkState::Connected {
            tracing::warn!(
                "{}: link is {}, command {:02x?} not sent",
                self.port,
                self.state,
                cmd
            );
            return String::new();
        }

        if !self.is_connected() {
            tracing::warn!("{} is no longer present, command not sent", self);
            self.state = LinkState::Disconnected;
            return String::new();
        }

        if let Some(previous) = self.debounced(cmd) {
            tracing::debug!("{}: repeated command within interval, reusing answer", self.port);
            return previous;
        }

        let default_timeout = self.config.short_read_timeout;
        let Some(transport) = self.transport.as_deref_mut() else {
            return String::new();
        };

        let raw = match transact(transport, cmd, long_timeout, default_timeout) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("{}: command {:02x?} failed: {}", self.port, cmd, e);
                return String::new();
            }
        };

        let response = decode_line(&raw).unwrap_or_else(|e| {
            tracing::warn!("{}: unreadable answer to {:02x?}: {}", self.port, cmd, e);
            String::new()
        });

        self.last_exchange = Some(CommandExchange {
            request: cmd.to_vec(),
            response: response.clone(),
            timestamp: Instant::now(),
        });
        response
    }

    fn debounced(&self, cmd: &[u8]) -> Option<String> {
        if self.debounce != DebouncePolicy::ReturnPrevious {
            return None;
        }
        let last = self.last_exchange.as_ref()?;
        (last.request == cmd && last.timestamp.elapsed() < self.config.min_command_interval)
            .then(|| last.response.clone())
    }

    /// Close the transport. Safe to call more than once.
    pub fn release(&mut self) {
        if self.close_transport() {
            self.state = LinkState::Disconnected;
        }
    }

    fn close_transport(&mut self) -> bool {
        match self.transport.take() {
            Some(mut transport) => {
                transport.close();
                tracing::debug!("Released {}", self.port);
                true
            }
            None => false,
        }
    }

    /// Snapshot of everything known about this link
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            device: self.profile.name().to_string(),
            port: self.port.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            debounce: self.debounce,
            connected_at: self.connected_at,
            last_command_age: self.last_communication().map(|t| t.elapsed().as_secs_f64()),
            port_details: port_info(&self.port),
            profile: self.profile.info(),
        }
    }
}

/// Write `cmd` and read one line, optionally under a longer timeout that is
/// reset to `default_timeout` afterwards
fn transact(
    transport: &mut dyn Transport,
    cmd: &[u8],
    long_timeout: Option<Duration>,
    default_timeout: Duration,
) -> Result<Vec<u8>, LinkError> {
    if let Some(timeout) = long_timeout {
        transport.set_read_timeout(timeout)?;
    }
    let result = transport.write(cmd).and_then(|_| transport.read_line());
    if long_timeout.is_some() {
        transport.set_read_timeout(default_timeout)?;
    }
    result
}

impl fmt::Display for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.profile.name(), self.port)
    }
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("device", &self.profile.name())
            .field("port", &self.port)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("debounce", &self.debounce)
            .finish()
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Info dump of a [`DeviceLink`]
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    /// Expected device name
    pub device: String,
    /// Port name
    pub port: PortIdentifier,
    /// Link state at snapshot time
    pub state: LinkState,
    /// Serial parameters
    pub config: DeviceConfig,
    /// Debounce policy
    pub debounce: DebouncePolicy,
    /// When the handshake last succeeded
    pub connected_at: Option<DateTime<Utc>>,
    /// Seconds since the device last answered
    pub last_command_age: Option<f64>,
    /// Host details of the port, if the host lists it
    pub port_details: Option<PortInfo>,
    /// Profile-specific fields
    pub profile: Vec<(String, String)>,
}

impl LinkInfo {
    /// Flat key/value listing
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = vec![
            ("device".into(), self.device.clone()),
            ("port".into(), self.port.clone()),
            ("state".into(), self.state.to_string()),
            ("baud_rate".into(), self.config.baud_rate.to_string()),
            ("write_timeout".into(), format!("{:?}", self.config.write_timeout)),
            ("read_timeout".into(), format!("{:?}", self.config.short_read_timeout)),
            ("long_read_timeout".into(), format!("{:?}", self.config.long_read_timeout)),
            (
                "min_command_interval".into(),
                format!("{:?}", self.config.min_command_interval),
            ),
            ("debounce".into(), format!("{:?}", self.debounce)),
        ];
        if let Some(at) = self.connected_at {
            entries.push(("connected_at".into(), at.to_rfc3339()));
        }
        if let Some(age) = self.last_command_age {
            entries.push(("last_command_age".into(), format!("{:.3}s", age)));
        }
        if let Some(details) = &self.port_details {
            entries.extend(
                details
                    .entries()
                    .into_iter()
                    .filter(|(k, _)| *k != "port")
                    .map(|(k, v)| (k.to_string(), v)),
            );
        }
        entries.extend(self.profile.iter().cloned());
        entries
    }

    /// One `key: value` line per entry
    pub fn to_text(&self) -> String {
        self.entries()
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// JSON rendering
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
