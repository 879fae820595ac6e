//! Device discovery
//!
//! Probes every plausible serial port with the identification handshake
//! and records which device answered where.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    identify_with, list_ports, PortFilter, PortIdentifier, PortOpener, ProbeSettings, SerialOpener,
};

/// Device names mapped to the port each one answered on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: HashMap<String, PortIdentifier>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `identity` answered on `port`.
    ///
    /// Returns the port previously recorded for the same identity, which
    /// this one replaces.
    pub fn insert(
        &mut self,
        identity: impl Into<String>,
        port: impl Into<PortIdentifier>,
    ) -> Option<PortIdentifier> {
        self.devices.insert(identity.into(), port.into())
    }

    /// Port of the device named `identity`
    pub fn port_of(&self, identity: &str) -> Option<&str> {
        self.devices.get(identity).map(String::as_str)
    }

    /// Number of identified devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device was identified
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// (identity, port) pairs sorted by identity
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .devices
            .iter()
            .map(|(id, port)| (id.as_str(), port.as_str()))
            .collect();
        entries.sort();
        entries
    }

    /// Underlying map
    pub fn into_map(self) -> HashMap<String, PortIdentifier> {
        self.devices
    }
}

/// Scans host ports for identifiable devices
pub struct DeviceEnumerator {
    opener: Arc<dyn PortOpener>,
    probe: ProbeSettings,
    filter: PortFilter,
}

impl Default for DeviceEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator {
    /// Enumerator over host serial ports with default probing and filtering
    pub fn new() -> Self {
        Self {
            opener: Arc::new(SerialOpener),
            probe: ProbeSettings::default(),
            filter: PortFilter::default(),
        }
    }

    /// Use `opener` instead of the host serial ports
    pub fn with_opener(mut self, opener: Arc<dyn PortOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Override probe timing
    pub fn with_probe_settings(mut self, probe: ProbeSettings) -> Self {
        self.probe = probe;
        self
    }

    /// Override which host ports count as candidates
    pub fn with_filter(mut self, filter: PortFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Host ports passing the filter, in listing order
    pub fn candidates(&self) -> Vec<PortIdentifier> {
        list_ports()
            .into_iter()
            .map(|p| p.name)
            .filter(|name| self.filter.matches(name))
            .collect()
    }

    /// Probe every candidate host port.
    ///
    /// Each silent port can cost up to the escalated read timeout, so the
    /// total time grows with the number of candidates.
    pub fn scan(&self) -> DeviceRegistry {
        self.scan_candidates(self.candidates())
    }

    /// Probe the given ports. Ports that do not identify are skipped.
    pub fn scan_candidates<I, S>(&self, candidates: I) -> DeviceRegistry
    where
        I: IntoIterator<Item = S>,
        S: Into<PortIdentifier>,
    {
        let mut registry = DeviceRegistry::new();

        for port in candidates {
            let port: PortIdentifier = port.into();
            let identity = identify_with(self.opener.as_ref(), &port, &self.probe);
            if identity.is_empty() {
                tracing::debug!("scan: nothing identified on {}", port);
                continue;
            }

            tracing::info!("scan: found '{}' on {}", identity, port);
            if let Some(previous) = registry.insert(identity.clone(), port.clone()) {
                tracing::warn!(
                    "scan: '{}' answered on both {} and {}, keeping {}",
                    identity,
                    previous,
                    port,
                    port
                );
            }
        }

        registry
    }

    /// Scan the host and return the port of the device named `name`
    pub fn find(&self, name: &str) -> Option<PortIdentifier> {
        self.scan().port_of(name).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_registry_last_write_wins() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.insert("Shutter", "/dev/ttyACM0"), None);
        assert_eq!(
            registry.insert("Shutter", "/dev/ttyACM1"),
            Some("/dev/ttyACM0".to_string())
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.port_of("Shutter"), Some("/dev/ttyACM1"));
    }

    #[test]
    fn test_registry_entries_sorted() {
        let mut registry = DeviceRegistry::new();
        registry.insert("Zeta", "COM4");
        registry.insert("Alpha", "COM3");
        assert_eq!(registry.entries(), vec![("Alpha", "COM3"), ("Zeta", "COM4")]);
    }
}
