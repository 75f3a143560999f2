//! Version tags and identifiers shared by the account model, codec and gateway.

use core::{fmt, str::FromStr};

use alloy_primitives::{Address, FixedBytes};
use serde::{Deserialize, Serialize};

use crate::kernel::constants::ENTRY_POINT_V07;

/// Kernel v3 permission identifier.
pub type PermissionId = FixedBytes<4>;

/// Kernel v3 validation identifier: `validationType (1) || identifier (20)`.
pub type ValidationId = FixedBytes<21>;

/// ERC-4337 EntryPoint versions this build can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryPointVersion {
    #[serde(rename = "0.7")]
    V07 = 0x07,
}

impl EntryPointVersion {
    pub fn address(self) -> Address {
        match self {
            EntryPointVersion::V07 => ENTRY_POINT_V07,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryPointVersion::V07 => "0.7",
        }
    }
}

impl TryFrom<u8> for EntryPointVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x07 => Ok(EntryPointVersion::V07),
            other => Err(other),
        }
    }
}

impl FromStr for EntryPointVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0.7" | "v0.7" => Ok(EntryPointVersion::V07),
            other => Err(format!("unsupported entry point version `{other}`")),
        }
    }
}

impl fmt::Display for EntryPointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel account implementation versions this build can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KernelVersion {
    #[serde(rename = "0.3.1")]
    V3_1 = 0x31,
    #[serde(rename = "0.3.3")]
    V3_3 = 0x33,
}

impl KernelVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelVersion::V3_1 => "0.3.1",
            KernelVersion::V3_3 => "0.3.3",
        }
    }
}

impl TryFrom<u8> for KernelVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x31 => Ok(KernelVersion::V3_1),
            0x33 => Ok(KernelVersion::V3_3),
            other => Err(other),
        }
    }
}

impl FromStr for KernelVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('v') {
            "0.3.1" | "3.1" => Ok(KernelVersion::V3_1),
            "0.3.3" | "3.3" => Ok(KernelVersion::V3_3),
            other => Err(format!("unsupported kernel version `{other}`")),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
