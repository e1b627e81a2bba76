//! Device binding seam.
//!
//! The core never talks to a smart plug directly. Stations hold a [`Device`]
//! (identity and display name) and express the power state they want as a
//! [`PowerIntent`] handed to a [`PowerSink`]. Delivering the intent is the
//! sink's job and must not block the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identity of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A discovered device as seen by the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Requested relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to put a device into a power state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerIntent {
    pub device: Device,
    pub state: PowerState,
}

/// Receives power intents from stations.
///
/// Implementations must return immediately. Intents are re-asserted on every
/// refresh tick, so a dropped or late intent corrects itself one tick later.
pub trait PowerSink: Send + Sync {
    fn submit(&self, intent: PowerIntent);
}

/// A sink that drops every intent. Used when no device backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPowerSink;

impl PowerSink for NullPowerSink {
    fn submit(&self, _intent: PowerIntent) {}
}

/// Category of a device communication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorKind {
    /// The cloud account rejected the configured credentials.
    InvalidCredentials,
    /// Any other transport or API failure.
    Connection,
}

impl DeviceErrorKind {
    /// Title shown to the operator.
    #[must_use]
    pub const fn title(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid Login Data",
            Self::Connection => "Untracked Connection Error",
        }
    }
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Failure reported by a device discovery or power-control backend.
///
/// Such errors are caught at the backend boundary and never alter station or
/// tracker state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::InvalidCredentials,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Connection,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_display_includes_kind_title() {
        let err = DeviceError::invalid_credentials("bad password");
        assert_eq!(err.to_string(), "Invalid Login Data: bad password");
        let err = DeviceError::connection("timeout");
        assert_eq!(err.to_string(), "Untracked Connection Error: timeout");
    }

    #[test]
    fn device_id_serializes_as_plain_string() {
        let device = Device::new("8006ABC", "Bay 1");
        let json = serde_json::to_string(&device).unwrap();
        assert_eq!(json, r#"{"id":"8006ABC","name":"Bay 1"}"#);
    }
}
