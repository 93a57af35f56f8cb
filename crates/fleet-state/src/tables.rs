//! redb table definitions for the fleet state store.
//!
//! Row tables use `u64` ids and `&[u8]` values (JSON-serialized domain types).
//! Index tables map a composite `&str` key to a row id. Composite keys follow
//! the pattern `{parent}/{child}` or `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Monotonic id sequences keyed by sequence name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Plugin descriptors keyed by plugin name.
pub const PLUGIN_DESCS: TableDefinition<&str, &[u8]> = TableDefinition::new("plugin_descs");

/// Package artifacts keyed by id.
pub const PACKAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("packages");

/// `{project}/{version}/{os}/{cpu_arch}` → package id.
pub const PACKAGE_INDEX: TableDefinition<&str, u64> = TableDefinition::new("package_index");

/// Process controls keyed by the owning package id (one-to-one).
pub const PROC_CONTROLS: TableDefinition<u64, &[u8]> = TableDefinition::new("proc_controls");

/// Config templates keyed by id.
pub const CONFIG_TEMPLATES: TableDefinition<u64, &[u8]> = TableDefinition::new("config_templates");

/// `{plugin}/{plugin_version}/{name}/{version}/{is_main}` → template id.
pub const TEMPLATE_INDEX: TableDefinition<&str, u64> = TableDefinition::new("template_index");

/// Config instances keyed by `{template_id}:{source_app_code}:{data_hash}`.
pub const CONFIG_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("config_instances");

/// Uploaded bundle records keyed by id.
pub const UPLOADS: TableDefinition<u64, &[u8]> = TableDefinition::new("uploads");

/// Export jobs keyed by id.
pub const EXPORT_JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("export_jobs");

/// Subscriptions keyed by id.
pub const SUBSCRIPTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("subscriptions");

/// Subscription steps keyed by `{subscription_id:020}:{index:08}`.
pub const SUBSCRIPTION_STEPS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("subscription_steps");

/// Subscription tasks keyed by id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("subscription_tasks");

/// Instance records keyed by id.
pub const INSTANCE_RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("instance_records");

/// `{subscription_id}:{instance_id}` → id of the latest instance record.
pub const LATEST_RECORDS: TableDefinition<&str, u64> = TableDefinition::new("latest_records");

/// Process trees keyed by process handle.
pub const PROCESS_TREES: TableDefinition<&str, &[u8]> = TableDefinition::new("process_trees");
