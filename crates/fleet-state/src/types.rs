//! Domain types for the fleet state store.
//!
//! These types represent the persisted state of plugin packages, config
//! templates, uploads, export jobs and subscriptions. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use fleet_core::{
    ArtifactKey, ControlCommands, CpuArch, LaunchNode, PluginCategory, PluginOs, PortRange,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row id assigned from a store sequence.
pub type RowId = u64;

// ── Packages ───────────────────────────────────────────────────────

/// Shared, version-independent description of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginDesc {
    pub name: String,
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
    pub created_at: u64,
    pub updated_at: u64,
}

/// One built, OS/arch-specific package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageArtifact {
    pub id: RowId,
    pub project: String,
    pub version: String,
    pub os: PluginOs,
    pub cpu_arch: CpuArch,
    /// File name inside the distribution tree, `<project>-<version>.tgz`.
    pub pkg_name: String,
    pub module: String,
    /// Lowercase hex sha256 of the archive. Empty until ready.
    pub checksum: String,
    pub size: u64,
    /// Directory holding the archive under the distribution root.
    pub pkg_path: String,
    /// Download URL prefix for the archive.
    pub location: String,
    pub is_release: bool,
    pub is_ready: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PackageArtifact {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.project, &self.version, self.os, self.cpu_arch)
    }

    /// Full path of the archive file.
    pub fn archive_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.pkg_path).join(&self.pkg_name)
    }
}

/// Values recorded when a publish completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    pub checksum: String,
    pub size: u64,
    pub pkg_path: String,
    pub location: String,
}

/// Filter for package queries. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageQuery {
    pub project: Option<String>,
    pub version: Option<String>,
    pub os: Option<PluginOs>,
    pub cpu_arch: Option<CpuArch>,
    pub is_release: Option<bool>,
    pub is_ready: Option<bool>,
}

impl PackageQuery {
    pub fn project(project: &str) -> Self {
        Self {
            project: Some(project.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, pkg: &PackageArtifact) -> bool {
        self.project.as_ref().is_none_or(|p| *p == pkg.project)
            && self.version.as_ref().is_none_or(|v| *v == pkg.version)
            && self.os.is_none_or(|os| os == pkg.os)
            && self.cpu_arch.is_none_or(|arch| arch == pkg.cpu_arch)
            && self.is_release.is_none_or(|r| r == pkg.is_release)
            && self.is_ready.is_none_or(|r| r == pkg.is_ready)
    }
}

/// How `release` resolves its target set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseTarget {
    Ids(Vec<RowId>),
    Query(PackageQuery),
}

/// Lifecycle commands and install layout for one package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessControl {
    pub package_id: RowId,
    pub module: String,
    pub project: String,
    pub plugin_package_version: String,
    pub os: PluginOs,
    pub install_path: String,
    pub log_path: String,
    pub data_path: String,
    pub pid_path: String,
    pub control: ControlCommands,
    pub process_name: Option<String>,
    pub port_range: Vec<PortRange>,
    pub need_delegate: bool,
}

impl ProcessControl {
    /// Blank control row for a freshly claimed package.
    pub fn empty_for(pkg: &PackageArtifact) -> Self {
        Self {
            package_id: pkg.id,
            module: pkg.module.clone(),
            project: pkg.project.clone(),
            plugin_package_version: pkg.version.clone(),
            os: pkg.os,
            install_path: String::new(),
            log_path: String::new(),
            data_path: String::new(),
            pid_path: String::new(),
            control: ControlCommands::default(),
            process_name: None,
            port_range: Vec::new(),
            need_delegate: true,
        }
    }

    /// A configured port range means the process must listen on a port.
    pub fn listen_port_required(&self) -> bool {
        !self.port_range.is_empty()
    }
}

/// Outcome of the publish claim transaction.
#[derive(Debug, Clone)]
pub struct PublishClaim {
    pub package: PackageArtifact,
    pub proc_control: ProcessControl,
    /// True when the package row was inserted by this claim.
    pub created: bool,
}

// ── Config templates ───────────────────────────────────────────────

/// Database-resident config template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigTemplate {
    pub id: RowId,
    pub plugin_name: String,
    pub plugin_version: String,
    pub name: String,
    pub version: String,
    pub is_main: bool,
    pub format: String,
    pub file_path: String,
    pub content: String,
    pub creator: String,
    pub source_app_code: String,
    pub created_at: u64,
}

impl ConfigTemplate {
    /// Uniqueness tuple `(plugin, plugin_version, name, version, is_main)`.
    pub fn unique_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.plugin_name, self.plugin_version, self.name, self.version, self.is_main
        )
    }
}

/// A rendering request for a template, deduplicated by content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigInstance {
    pub id: RowId,
    pub template_id: RowId,
    /// Canonical (sorted-key) JSON of the render data.
    pub render_data: String,
    pub data_hash: String,
    pub creator: String,
    pub source_app_code: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ConfigInstance {
    pub fn table_key(&self) -> String {
        instance_key(self.template_id, &self.source_app_code, &self.data_hash)
    }
}

pub(crate) fn instance_key(template_id: RowId, source_app_code: &str, data_hash: &str) -> String {
    format!("{template_id}:{source_app_code}:{data_hash}")
}

// ── Uploads & exports ──────────────────────────────────────────────

/// An uploaded bundle stored under the upload root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadRecord {
    pub id: RowId,
    pub file_name: String,
    pub module: String,
    pub file_path: String,
    pub file_size: u64,
    pub checksum: String,
    pub creator: String,
    pub source_app_code: String,
    pub uploaded_at: u64,
}

/// Lifecycle of an export job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Ready,
    Doing,
    Success,
    Failed,
}

/// Asynchronous export of released packages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportJob {
    pub id: RowId,
    /// Exported module, e.g. `gse_plugin`.
    pub category: String,
    pub project: String,
    pub version: String,
    pub status: JobStatus,
    pub file_path: Option<String>,
    pub error_message: String,
    pub creator: String,
    pub source_app_code: String,
    pub created_at: u64,
    pub finished_at: Option<u64>,
}

// ── Subscriptions ──────────────────────────────────────────────────

/// What kind of object a subscription targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    Host,
    Service,
}

/// How the subscription's node list is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Topo,
    Instance,
}

/// A standing declaration of configuration intent over a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: RowId,
    pub name: String,
    pub bk_biz_id: Option<i64>,
    pub object_type: ObjectType,
    pub node_type: NodeType,
    pub nodes: Vec<Value>,
    pub target_hosts: Option<Value>,
    pub from_system: String,
    pub creator: String,
    pub enable: bool,
    pub is_main: bool,
    pub is_deleted: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One ordered step of a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionStep {
    pub subscription_id: RowId,
    pub index: u32,
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub config: Value,
    pub params: Value,
}

impl SubscriptionStep {
    pub fn table_key(&self) -> String {
        step_key(self.subscription_id, self.index)
    }
}

pub(crate) fn step_key(subscription_id: RowId, index: u32) -> String {
    format!("{}{index:08}", step_prefix(subscription_id))
}

pub(crate) fn step_prefix(subscription_id: RowId) -> String {
    format!("{subscription_id:020}:")
}

/// A step as supplied when a subscription is created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub step_id: String,
    pub step_type: String,
    pub config: Value,
    pub params: Value,
}

/// One trigger of a subscription over a resolved scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionTask {
    pub id: RowId,
    pub subscription_id: RowId,
    pub scope: Value,
    /// instance id → action name.
    pub actions: BTreeMap<String, String>,
    pub is_auto_trigger: bool,
    pub created_at: u64,
}

/// Per-step progress entry of an instance record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub pipeline_id: String,
    pub action: Option<String>,
    #[serde(default)]
    pub extra_info: Map<String, Value>,
}

/// Execution ledger for one target instance within one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: RowId,
    pub task_id: RowId,
    pub subscription_id: RowId,
    pub instance_id: String,
    pub instance_info: Value,
    /// `None` until the step list is first initialised.
    pub steps: Option<Vec<StepEntry>>,
    /// Handle of the attached external process; empty when none.
    pub pipeline_id: String,
    pub need_clean: bool,
    pub is_latest: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

pub(crate) fn latest_key(subscription_id: RowId, instance_id: &str) -> String {
    format!("{subscription_id}:{instance_id}")
}

/// A target instance supplied when a task is created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub instance_id: String,
    pub instance_info: Value,
}

/// A process graph stored under its runner handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessTree {
    pub handle: String,
    pub tree: Value,
    pub created_at: u64,
}
