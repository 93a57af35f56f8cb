//! Loading bundled config templates into the store, and deduplicated
//! config instances.

use std::fs;
use std::path::Path;

use fleet_core::{Manifest, is_contained_relative};
use fleet_state::{ConfigInstance, ConfigTemplate, RowId, StateError, StateStore};
use serde_json::Value;
use tracing::info;

use crate::archive::sha256_str;
use crate::error::{IoContext, PackError, PackResult};

/// Creator recorded on templates loaded during publish.
const SYSTEM_CREATOR: &str = "system";
const SYSTEM_APP: &str = "fleet";

/// Load every template the manifest declares, then delete the source files.
///
/// All source paths are checked and all source files read before anything
/// is stored, so a bad path or a missing file fails the import without
/// touching the store.
pub fn import_templates(
    store: &StateStore,
    src_dir: &Path,
    manifest: &Manifest,
    overwrite: bool,
) -> PackResult<Vec<ConfigTemplate>> {
    let mut loaded = Vec::with_capacity(manifest.config_templates.len());
    for spec in &manifest.config_templates {
        if !is_contained_relative(&spec.source_path) {
            return Err(PackError::Validation(format!(
                "config template source {:?} of {} escapes {}",
                spec.source_path,
                manifest.name,
                src_dir.display()
            )));
        }
        let path = src_dir.join(&spec.source_path);
        let content = fs::read_to_string(&path)
            .io_context(|| format!("read config template {}", path.display()))?;
        loaded.push((spec, path, content));
    }

    let mut created = Vec::with_capacity(loaded.len());
    for (spec, path, content) in loaded {
        let template = ConfigTemplate {
            id: 0,
            plugin_name: manifest.name.clone(),
            plugin_version: spec.plugin_version.clone(),
            name: spec.name.clone(),
            version: spec.version.clone(),
            is_main: spec.is_main_config,
            format: spec.format.clone(),
            file_path: spec.file_path.clone(),
            content,
            creator: SYSTEM_CREATOR.to_string(),
            source_app_code: SYSTEM_APP.to_string(),
            created_at: 0,
        };
        let stored = store
            .create_config_template(&template, overwrite)
            .map_err(|err| match err {
                StateError::Conflict(msg) => PackError::Conflict(msg),
                other => other.into(),
            })?;
        info!(
            plugin = %manifest.name,
            template = %stored.name,
            version = %stored.version,
            id = stored.id,
            "config template loaded"
        );
        fs::remove_file(&path).io_context(|| format!("remove {}", path.display()))?;
        created.push(stored);
    }
    Ok(created)
}

/// Canonical form of render data: JSON with object keys sorted.
pub fn canonical_json(data: &Value) -> String {
    // serde_json::Map is ordered by key unless `preserve_order` is enabled.
    data.to_string()
}

/// Create an instance of a template, or return the existing one for the
/// same `(template, source_app, content hash)`.
pub fn create_config_instance(
    store: &StateStore,
    template_id: RowId,
    data: &Value,
    creator: &str,
    source_app_code: &str,
) -> PackResult<ConfigInstance> {
    let render_data = canonical_json(data);
    let data_hash = sha256_str(&render_data);
    let (instance, created) = store.upsert_config_instance(
        template_id,
        &render_data,
        &data_hash,
        creator,
        source_app_code,
    )?;
    info!(template_id, instance_id = instance.id, created, "config instance resolved");
    Ok(instance)
}
