//! `project.yaml` manifest parser.
//!
//! Every plugin source directory carries a manifest describing the plugin,
//! its lifecycle commands and any config templates it ships with.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{LaunchNode, PluginCategory};

/// File name of the manifest inside a plugin source directory.
pub const MANIFEST_FILE: &str = "project.yaml";

/// Errors raised while loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no {MANIFEST_FILE} found at {path}")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path} is missing required key `{key}`")]
    MissingKey { path: PathBuf, key: &'static str },

    #[error("{path} declares unknown category {category:?}")]
    UnknownCategory { path: PathBuf, category: String },

    /// `name` and `version` become path segments of the distribution tree.
    #[error("{path}: `{key}` must be a single path segment, got {value:?}")]
    InvalidSegment {
        path: PathBuf,
        key: &'static str,
        value: String,
    },

    #[error("{path}: template source {value:?} must be a relative path inside the plugin directory")]
    UnsafeTemplatePath { path: PathBuf, value: String },
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// Lifecycle commands for the plugin process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlCommands {
    pub start: String,
    pub stop: String,
    pub restart: String,
    pub reload: String,
    pub kill: String,
    pub version: String,
    pub health_check: String,
    pub debug: String,
}

/// A config template bundled in the plugin source directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Path of the template file, relative to the source directory.
    pub source_path: String,
    pub plugin_version: String,
    pub name: String,
    pub version: String,
    pub format: String,
    /// Path of the rendered file relative to the plugin install directory.
    pub file_path: String,
    #[serde(default)]
    pub is_main_config: bool,
}

/// Validated manifest contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub category: PluginCategory,
    pub description: String,
    pub description_en: String,
    pub scenario: String,
    pub scenario_en: String,
    pub launch_node: LaunchNode,
    pub config_file: String,
    pub config_format: String,
    pub use_db: bool,
    pub auto_launch: bool,
    pub is_binary: bool,
    pub control: ControlCommands,
    pub process_name: Option<String>,
    pub need_delegate: bool,
    /// Raw port range grammar; parsed when the process control is written.
    pub port_range: String,
    pub config_templates: Vec<TemplateSpec>,
}

/// On-disk shape, before required keys are checked.
#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<serde_yaml::Value>,
    version: Option<serde_yaml::Value>,
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    description_en: Option<String>,
    #[serde(default)]
    scenario: Option<String>,
    #[serde(default)]
    scenario_en: Option<String>,
    #[serde(default)]
    launch_node: LaunchNode,
    #[serde(default)]
    config_file: Option<String>,
    #[serde(default)]
    config_format: Option<String>,
    #[serde(default)]
    use_db: bool,
    #[serde(default)]
    auto_launch: bool,
    #[serde(default = "default_true")]
    is_binary: bool,
    #[serde(default)]
    control: ControlCommands,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default = "default_true")]
    need_delegate: bool,
    #[serde(default)]
    port_range: Option<String>,
    #[serde(default)]
    config_templates: Vec<TemplateSpec>,
}

fn default_true() -> bool {
    true
}

impl Manifest {
    /// Load `<dir>/project.yaml`.
    pub fn from_dir(dir: &Path) -> ManifestResult<Self> {
        Self::from_file(&dir.join(MANIFEST_FILE))
    }

    /// Load and validate a manifest file.
    pub fn from_file(path: &Path) -> ManifestResult<Self> {
        if !path.is_file() {
            return Err(ManifestError::Missing {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::from_yaml_str(&content, path)?;
        debug!(?path, name = %manifest.name, version = %manifest.version, "manifest loaded");
        Ok(manifest)
    }

    /// Parse manifest text. `path` is used only for error context.
    pub fn from_yaml_str(content: &str, path: &Path) -> ManifestResult<Self> {
        let raw: RawManifest =
            serde_yaml::from_str(content).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let missing = |key| ManifestError::MissingKey {
            path: path.to_path_buf(),
            key,
        };
        let name = raw.name.as_ref().and_then(scalar_string).ok_or_else(|| missing("name"))?;
        let version = raw
            .version
            .as_ref()
            .and_then(scalar_string)
            .ok_or_else(|| missing("version"))?;
        for (key, value) in [("name", &name), ("version", &version)] {
            if !is_single_segment(value) {
                return Err(ManifestError::InvalidSegment {
                    path: path.to_path_buf(),
                    key,
                    value: value.clone(),
                });
            }
        }
        if let Some(bad) = raw
            .config_templates
            .iter()
            .find(|t| !is_contained_relative(&t.source_path))
        {
            return Err(ManifestError::UnsafeTemplatePath {
                path: path.to_path_buf(),
                value: bad.source_path.clone(),
            });
        }
        let category_raw = raw.category.ok_or_else(|| missing("category"))?;
        let category = category_raw
            .parse::<PluginCategory>()
            .map_err(|_| ManifestError::UnknownCategory {
                path: path.to_path_buf(),
                category: category_raw.clone(),
            })?;

        Ok(Manifest {
            name,
            version,
            category,
            description: raw.description.unwrap_or_default(),
            description_en: raw.description_en.unwrap_or_default(),
            scenario: raw.scenario.unwrap_or_default(),
            scenario_en: raw.scenario_en.unwrap_or_default(),
            launch_node: raw.launch_node,
            config_file: raw.config_file.unwrap_or_default(),
            config_format: raw.config_format.unwrap_or_default(),
            use_db: raw.use_db,
            auto_launch: raw.auto_launch,
            is_binary: raw.is_binary,
            control: raw.control,
            process_name: raw.process_name,
            need_delegate: raw.need_delegate,
            port_range: raw.port_range.unwrap_or_default(),
            config_templates: raw.config_templates,
        })
    }
}

/// YAML reads `version: 2` as a number; accept numeric scalars as text.
fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Exactly one normal path component, with no separator of either kind.
pub fn is_single_segment(value: &str) -> bool {
    if value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// A non-empty relative path that never climbs above its base directory.
pub fn is_contained_relative(value: &str) -> bool {
    if value.contains('\\') {
        return false;
    }
    let path = Path::new(value);
    path.components().any(|c| matches!(c, Component::Normal(_)))
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
