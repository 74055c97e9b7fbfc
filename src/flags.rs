//! Build flags shared by every workflow
//!
//! `BuildFlags` carries the user-selected build parameters. The
//! `config`/`sdk`/`arch` triple names the store group a binary lands in;
//! `xcargs` feeds the fingerprint; `result_bundle_path` does not.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Target SDK family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sdk {
    /// Simulator SDK
    #[default]
    Sim,
    /// Device SDK
    Device,
}

impl std::fmt::Display for Sdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sdk::Sim => write!(f, "sim"),
            Sdk::Device => write!(f, "device"),
        }
    }
}

impl std::str::FromStr for Sdk {
    type Err = FlagsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sim" => Ok(Sdk::Sim),
            "device" => Ok(Sdk::Device),
            _ => Err(FlagsError::InvalidSdk(s.to_string())),
        }
    }
}

/// Target CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    /// Resolve from the host at build time
    #[default]
    Auto,
    /// Intel 64-bit
    X86_64,
    /// Apple silicon
    Arm64,
}

impl Arch {
    /// The architecture name used in store paths and build settings.
    ///
    /// `Auto` resolves against the host architecture.
    pub fn resolved(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::Auto => {
                if cfg!(target_arch = "x86_64") {
                    "x86_64"
                } else {
                    "arm64"
                }
            }
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resolved())
    }
}

impl std::str::FromStr for Arch {
    type Err = FlagsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Arch::Auto),
            "x86_64" => Ok(Arch::X86_64),
            "arm64" => Ok(Arch::Arm64),
            _ => Err(FlagsError::InvalidArch(s.to_string())),
        }
    }
}

/// Errors from flag parsing
#[derive(Debug, thiserror::Error)]
pub enum FlagsError {
    #[error("invalid sdk: {0} (must be 'sim' or 'device')")]
    InvalidSdk(String),

    #[error("invalid arch: {0} (must be 'auto', 'x86_64' or 'arm64')")]
    InvalidArch(String),
}

/// User-selected build parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFlags {
    /// SDK family
    pub sdk: Sdk,

    /// CPU architecture
    pub arch: Arch,

    /// Build configuration name
    pub config: String,

    /// Free-form KEY=VALUE build arguments, passed through verbatim
    pub xcargs: Vec<String>,

    /// Optional result bundle output path (not part of the fingerprint)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_bundle_path: Option<PathBuf>,

    /// Skip cache lookups and rebuild everything
    #[serde(default)]
    pub ignore_cache: bool,
}

impl Default for BuildFlags {
    fn default() -> Self {
        Self {
            sdk: Sdk::Sim,
            arch: Arch::Auto,
            config: "Debug".to_string(),
            xcargs: Vec::new(),
            result_bundle_path: None,
            ignore_cache: false,
        }
    }
}

impl BuildFlags {
    /// The `<config>-<sdk>-<arch>` group segment used in store paths.
    pub fn group_dir(&self) -> String {
        format!("{}-{}-{}", self.config, self.sdk, self.arch)
    }
}
