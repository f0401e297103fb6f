//! Target architectures and their boot profiles.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CPU architecture of a base or produced image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::Amd64, Architecture::Arm64];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Boot profile used when the configuration does not override it.
    pub fn default_boot_profile(&self) -> BootProfile {
        match self {
            Architecture::Amd64 => BootProfile::LegacyPlusUefi,
            Architecture::Arm64 => BootProfile::HybridGptApm,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => bail!(
                "unsupported architecture '{}'; expected one of: amd64, arm64",
                other
            ),
        }
    }
}

/// How the produced image boots.
///
/// Selected per architecture by the orchestrator and passed as data to the
/// customizer (which boot menus to write) and the composer (which boot
/// catalog and hybrid flags to emit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootProfile {
    /// El Torito BIOS boot only.
    LegacyOnly,
    /// BIOS boot plus one alternate UEFI El Torito entry, GPT hybrid.
    LegacyPlusUefi,
    /// Legacy + UEFI with Joliet long names and GPT+APM hybrid tables.
    HybridGptApm,
}

impl BootProfile {
    pub fn needs_uefi(&self) -> bool {
        !matches!(self, BootProfile::LegacyOnly)
    }

    pub fn uses_joliet(&self) -> bool {
        matches!(self, BootProfile::HybridGptApm)
    }
}

impl fmt::Display for BootProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootProfile::LegacyOnly => write!(f, "legacy-only"),
            BootProfile::LegacyPlusUefi => write!(f, "legacy+uefi"),
            BootProfile::HybridGptApm => write!(f, "hybrid-gpt-apm"),
        }
    }
}
