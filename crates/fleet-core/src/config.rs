//! fleet.toml settings parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::PluginOs;

/// Process-wide settings for the fleet services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the state database.
    pub data_dir: PathBuf,
    /// Root of the OS/arch partitioned download tree.
    pub dist_root: PathBuf,
    /// Where exported bundles are published.
    pub export_root: PathBuf,
    /// Where uploaded bundles are kept.
    pub upload_root: PathBuf,
    /// Scratch space for builds, exports and extractions.
    pub temp_dir: PathBuf,
    /// Public URL prefix of `dist_root`.
    pub download_base_url: String,
    pub probe: ProbeSettings,
    /// Install-path convention per OS. AIX uses the linux entry.
    pub install_paths: HashMap<String, InstallPathTemplate>,
}

/// Limits for access point probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Maximum number of probes in flight.
    pub concurrency: usize,
    pub connect_timeout_ms: u64,
    pub download_timeout_ms: u64,
    /// Port probed on a server when the access point has no `io_port`.
    pub default_server_port: u16,
}

/// Install-path convention; `{name}` is replaced with the plugin name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPathTemplate {
    pub install_path: String,
    pub log_path: String,
    pub data_path: String,
    pub pid_path: String,
}

/// Install paths resolved for one plugin on one OS.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallPaths {
    pub install_path: String,
    pub log_path: String,
    pub data_path: String,
    pub pid_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        let mut install_paths = HashMap::new();
        install_paths.insert(
            "linux".to_string(),
            InstallPathTemplate {
                install_path: "/usr/local/gse/plugins".to_string(),
                log_path: "/var/log/gse".to_string(),
                data_path: "/var/lib/gse".to_string(),
                pid_path: "/var/run/gse/{name}.pid".to_string(),
            },
        );
        install_paths.insert(
            "windows".to_string(),
            InstallPathTemplate {
                install_path: "C:\\gse\\plugins".to_string(),
                log_path: "C:\\gse\\logs".to_string(),
                data_path: "C:\\gse\\data".to_string(),
                pid_path: "C:\\gse\\logs\\{name}.pid".to_string(),
            },
        );

        Self {
            data_dir: PathBuf::from("/var/lib/fleet"),
            dist_root: PathBuf::from("/data/fleet/download"),
            export_root: PathBuf::from("/data/fleet/export"),
            upload_root: PathBuf::from("/data/fleet/upload"),
            temp_dir: std::env::temp_dir(),
            download_base_url: "http://127.0.0.1/download".to_string(),
            probe: ProbeSettings::default(),
            install_paths,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            concurrency: 50,
            connect_timeout_ms: 2000,
            download_timeout_ms: 2000,
            default_server_port: 48668,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Settings rooted entirely under `root`, for tests and local runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            dist_root: root.join("download"),
            export_root: root.join("export"),
            upload_root: root.join("upload"),
            temp_dir: root.join("tmp"),
            ..Self::default()
        }
    }

    /// Path of the state database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleet.redb")
    }

    /// Resolve the install-path convention for `name` on `os`.
    pub fn install_paths_for(&self, name: &str, os: PluginOs) -> InstallPaths {
        let key = match os {
            PluginOs::Windows => "windows",
            PluginOs::Linux | PluginOs::Aix => "linux",
        };
        match self.install_paths.get(key) {
            Some(tpl) => InstallPaths {
                install_path: tpl.install_path.replace("{name}", name),
                log_path: tpl.log_path.replace("{name}", name),
                data_path: tpl.data_path.replace("{name}", name),
                pid_path: tpl.pid_path.replace("{name}", name),
            },
            None => InstallPaths::default(),
        }
    }
}
