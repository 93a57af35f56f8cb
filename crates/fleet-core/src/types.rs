//! Shared types used across fleet crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operating system a plugin package is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginOs {
    Linux,
    Windows,
    Aix,
}

impl PluginOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginOs::Linux => "linux",
            PluginOs::Windows => "windows",
            PluginOs::Aix => "aix",
        }
    }
}

impl fmt::Display for PluginOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginOs {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(PluginOs::Linux),
            "windows" => Ok(PluginOs::Windows),
            "aix" => Ok(PluginOs::Aix),
            _ => Err(UnknownVariant::new("os", s)),
        }
    }
}

/// CPU architecture a plugin package is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
    Powerpc,
    Aarch64,
}

impl CpuArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuArch::X86 => "x86",
            CpuArch::X86_64 => "x86_64",
            CpuArch::Powerpc => "powerpc",
            CpuArch::Aarch64 => "aarch64",
        }
    }

    /// Default architecture for hosts of the given OS: AIX runs on POWER,
    /// everything else is assumed x86_64.
    pub fn default_for(os: PluginOs) -> Self {
        match os {
            PluginOs::Aix => CpuArch::Powerpc,
            PluginOs::Linux | PluginOs::Windows => CpuArch::X86_64,
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuArch {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86" => Ok(CpuArch::X86),
            "x86_64" => Ok(CpuArch::X86_64),
            "powerpc" => Ok(CpuArch::Powerpc),
            "aarch64" => Ok(CpuArch::Aarch64),
            _ => Err(UnknownVariant::new("cpu_arch", s)),
        }
    }
}

/// Plugin category as declared in `project.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Official,
    External,
    Scripts,
}

impl PluginCategory {
    pub const ALL: [PluginCategory; 3] = [
        PluginCategory::Official,
        PluginCategory::External,
        PluginCategory::Scripts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::Official => "official",
            PluginCategory::External => "external",
            PluginCategory::Scripts => "scripts",
        }
    }
}

impl FromStr for PluginCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("category", s))
    }
}

/// Where a plugin's files live inside its archive.
///
/// First-party packages are rooted at `plugins/`, third-party packages at
/// `external_plugins/<project>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageLayout {
    Official,
    ThirdParty,
}

impl PackageLayout {
    pub fn from_external_flag(is_external: bool) -> Self {
        if is_external {
            PackageLayout::ThirdParty
        } else {
            PackageLayout::Official
        }
    }

    /// First path segment inside the archive.
    pub fn type_root(&self) -> &'static str {
        match self {
            PackageLayout::Official => "plugins",
            PackageLayout::ThirdParty => "external_plugins",
        }
    }

    /// Directory prefix every member of `project`'s archive starts with
    /// (without the trailing slash).
    pub fn archive_root(&self, project: &str) -> String {
        match self {
            PackageLayout::Official => "plugins".to_string(),
            PackageLayout::ThirdParty => format!("external_plugins/{project}"),
        }
    }

    /// Name of the per-platform directory used when unpacking artifacts
    /// side by side, e.g. `external_plugins_linux_x86_64`.
    pub fn platform_dir(&self, os: PluginOs, cpu_arch: CpuArch) -> String {
        format!("{}_{}_{}", self.type_root(), os, cpu_arch)
    }
}

/// Host node types a plugin may be launched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchNode {
    Agent,
    Proxy,
    #[default]
    All,
}

/// Identity of one published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub project: String,
    pub version: String,
    pub os: PluginOs,
    pub cpu_arch: CpuArch,
}

impl ArtifactKey {
    pub fn new(project: &str, version: &str, os: PluginOs, cpu_arch: CpuArch) -> Self {
        Self {
            project: project.to_string(),
            version: version.to_string(),
            os,
            cpu_arch,
        }
    }

    /// Composite key for the artifact index table.
    pub fn table_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.project, self.version, self.os, self.cpu_arch
        )
    }

    /// File name of the built archive, `<project>-<version>.tgz`.
    pub fn file_name(&self) -> String {
        format!("{}-{}.tgz", self.project, self.version)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} ({}/{})",
            self.project, self.version, self.os, self.cpu_arch
        )
    }
}

/// A string did not name any known variant of an enumerated field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {field}: {value}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}
