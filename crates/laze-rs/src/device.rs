//! Device identity for placement and per-device executor state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hardware class a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }
}

/// A concrete device slot, e.g. `cpu:0` or `gpu:1`.
///
/// Devices key every per-device map in the executor (live registry, seed
/// store, step locks), so the type is small, copyable, and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    kind: DeviceKind,
    ordinal: u8,
}

impl Device {
    pub fn new(kind: DeviceKind, ordinal: u8) -> Self {
        Self { kind, ordinal }
    }

    pub fn cpu(ordinal: u8) -> Self {
        Self::new(DeviceKind::Cpu, ordinal)
    }

    pub fn gpu(ordinal: u8) -> Self {
        Self::new(DeviceKind::Gpu, ordinal)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu(0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.ordinal)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceParseError {
    #[error("device string '{0}' must look like '<kind>:<ordinal>'")]
    MissingSeparator(String),
    #[error("unknown device kind '{0}'")]
    UnknownKind(String),
    #[error("invalid device ordinal '{0}'")]
    InvalidOrdinal(String),
}

impl FromStr for Device {
    type Err = DeviceParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, ordinal) = value
            .split_once(':')
            .ok_or_else(|| DeviceParseError::MissingSeparator(value.to_string()))?;
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "cpu" => DeviceKind::Cpu,
            "gpu" => DeviceKind::Gpu,
            other => return Err(DeviceParseError::UnknownKind(other.to_string())),
        };
        let ordinal = ordinal
            .trim()
            .parse::<u8>()
            .map_err(|_| DeviceParseError::InvalidOrdinal(ordinal.trim().to_string()))?;
        Ok(Device::new(kind, ordinal))
    }
}
