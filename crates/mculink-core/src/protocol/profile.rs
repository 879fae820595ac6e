//! Device profiles
//!
//! A profile tells a [`DeviceLink`] which name the device must answer the
//! query byte with, and lets device types add their own info fields and
//! run initialization commands once the link is up.

use super::{DeviceLink, LinkError};

/// Behaviour specific to one device type
pub trait DeviceProfile: Send + Sync {
    /// Name the device answers the query byte with; also the
    /// configuration key for its serial parameters
    fn name(&self) -> &str;

    /// Extra key/value pairs for the link info dump
    fn info(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Runs once after a successful handshake. An error marks the link failed.
    fn after_connect(&self, _link: &mut DeviceLink) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Profile carrying only a name and static info fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedProfile {
    name: String,
    info: Vec<(String, String)>,
}

impl NamedProfile {
    /// Profile for devices answering with `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: Vec::new(),
        }
    }

    /// Add a static info field
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.push((key.into(), value.into()));
        self
    }
}

impl DeviceProfile for NamedProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Vec<(String, String)> {
        self.info.clone()
    }
}
