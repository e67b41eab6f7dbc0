//! Remote device attribute reads.
//!
//! The transport to the control system is a black box: anything implementing
//! [`DeviceClient`] can serve reads. [`StaticDeviceClient`] serves attribute
//! values from memory (filled from the `[devices]` settings table or by tests).

use super::{DataSource, ReadContext};
use crate::data::DataHolder;
use crate::error::{WriterError, WriterResult};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Address of a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceEndpoint {
    /// Device name, e.g. `sys/tg_test/1`
    pub device: String,
    /// Explicit host override
    pub host: Option<String>,
    /// Explicit port override
    pub port: Option<u16>,
}

impl DeviceEndpoint {
    /// Endpoint reached through the default naming service.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            host: None,
            port: None,
        }
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{host}:{port}/{}", self.device),
            (Some(host), None) => write!(f, "{host}/{}", self.device),
            _ => f.write_str(&self.device),
        }
    }
}

/// Which device member is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceMember {
    /// Attribute value
    #[default]
    Attribute,
    /// Device property
    Property,
    /// Result of a command without arguments
    Command,
}

impl FromStr for DeviceMember {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attribute" => Ok(DeviceMember::Attribute),
            "property" => Ok(DeviceMember::Property),
            "command" => Ok(DeviceMember::Command),
            other => Err(WriterError::ConfigSyntax(format!(
                "unknown device member '{other}'"
            ))),
        }
    }
}

/// Black-box access to remote devices.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Read one member of a device. Any failure is reported as unavailable.
    async fn read(
        &self,
        endpoint: &DeviceEndpoint,
        member: DeviceMember,
        name: &str,
    ) -> anyhow::Result<serde_json::Value>;
}

/// In-memory device client.
#[derive(Debug, Default)]
pub struct StaticDeviceClient {
    values: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl StaticDeviceClient {
    /// Empty client: every read fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client serving `devices[device][name]`.
    pub fn from_table(devices: &HashMap<String, HashMap<String, serde_json::Value>>) -> Self {
        let client = Self::new();
        for (device, members) in devices {
            for (name, value) in members {
                client.set(device, name, value.clone());
            }
        }
        client
    }

    /// Set (or replace) the value served for `device/name`.
    pub fn set(&self, device: &str, name: &str, value: serde_json::Value) {
        if let Ok(mut values) = self.values.write() {
            values.insert((device.to_string(), name.to_string()), value);
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(self, device: &str, name: &str, value: serde_json::Value) -> Self {
        self.set(device, name, value);
        self
    }
}

#[async_trait]
impl DeviceClient for StaticDeviceClient {
    async fn read(
        &self,
        endpoint: &DeviceEndpoint,
        _member: DeviceMember,
        name: &str,
    ) -> anyhow::Result<serde_json::Value> {
        let values = self
            .values
            .read()
            .map_err(|_| anyhow!("device table lock poisoned"))?;
        values
            .get(&(endpoint.device.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("device {endpoint} does not expose '{name}'"))
    }
}

/// Reads one member of a remote device.
#[derive(Clone)]
pub struct DeviceSource {
    endpoint: DeviceEndpoint,
    member: DeviceMember,
    name: String,
    client: Arc<dyn DeviceClient>,
}

impl fmt::Debug for DeviceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSource")
            .field("endpoint", &self.endpoint)
            .field("member", &self.member)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DeviceSource {
    /// Source reading `endpoint/name` through `client`.
    pub fn new(
        endpoint: DeviceEndpoint,
        member: DeviceMember,
        name: impl Into<String>,
        client: Arc<dyn DeviceClient>,
    ) -> Self {
        Self {
            endpoint,
            member,
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl DataSource for DeviceSource {
    fn describe(&self) -> String {
        format!("TANGO:{}/{}", self.endpoint, self.name)
    }

    async fn read(&self, _ctx: &ReadContext) -> WriterResult<Option<DataHolder>> {
        let value = self
            .client
            .read(&self.endpoint, self.member, &self.name)
            .await
            .map_err(|e| WriterError::unavailable(self.describe(), format!("{e:#}")))?;
        DataHolder::from_json(&value)
            .map(Some)
            .map_err(|e| WriterError::format(self.describe(), e))
    }
}
