//! Config templates and their deduplicated instances.

use redb::{ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, epoch_secs, next_id};
use crate::tables::*;
use crate::types::*;

const TEMPLATE_SEQ: &str = "config_templates";
const INSTANCE_SEQ: &str = "config_instances";

impl StateStore {
    /// Insert a template, assigning its id.
    ///
    /// A template with the same `(plugin, plugin_version, name, version,
    /// is_main)` tuple is a [`StateError::Conflict`] unless `overwrite` is
    /// set, in which case the old row is deleted and replaced in the same
    /// transaction.
    pub fn create_config_template(
        &self,
        template: &ConfigTemplate,
        overwrite: bool,
    ) -> StateResult<ConfigTemplate> {
        let unique = template.unique_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut index = txn.open_table(TEMPLATE_INDEX).map_err(map_err!(Table))?;
            let mut templates = txn.open_table(CONFIG_TEMPLATES).map_err(map_err!(Table))?;
            let existing = index
                .get(unique.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value());
            if let Some(old_id) = existing {
                if !overwrite {
                    return Err(StateError::Conflict(format!(
                        "config template {unique} already exists"
                    )));
                }
                templates.remove(old_id).map_err(map_err!(Write))?;
                debug!(template = %unique, old_id, "config template replaced");
            }

            let id = next_id(&txn, TEMPLATE_SEQ)?;
            stored = ConfigTemplate {
                id,
                created_at: epoch_secs(),
                ..template.clone()
            };
            templates
                .insert(id, encode(&stored)?.as_slice())
                .map_err(map_err!(Write))?;
            index
                .insert(unique.as_str(), id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    pub fn get_config_template(&self, id: RowId) -> StateResult<Option<ConfigTemplate>> {
        self.get_row(CONFIG_TEMPLATES, id)
    }

    /// Templates of a plugin, optionally narrowed to one plugin version.
    pub fn list_config_templates(
        &self,
        plugin_name: &str,
        plugin_version: Option<&str>,
    ) -> StateResult<Vec<ConfigTemplate>> {
        self.list_rows(CONFIG_TEMPLATES, |tpl: &ConfigTemplate| {
            tpl.plugin_name == plugin_name
                && plugin_version.is_none_or(|v| tpl.plugin_version == v)
        })
    }

    /// Create a config instance, or refresh the existing one with the same
    /// `(template, source_app_code, data_hash)`. Returns the row and whether
    /// it was inserted.
    pub fn upsert_config_instance(
        &self,
        template_id: RowId,
        render_data: &str,
        data_hash: &str,
        creator: &str,
        source_app_code: &str,
    ) -> StateResult<(ConfigInstance, bool)> {
        let key = instance_key(template_id, source_app_code, data_hash);
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let templates = txn.open_table(CONFIG_TEMPLATES).map_err(map_err!(Table))?;
            if templates.get(template_id).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("config template {template_id}")));
            }

            let mut instances = txn.open_table(CONFIG_INSTANCES).map_err(map_err!(Table))?;
            let existing: Option<ConfigInstance> = instances
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            result = match existing {
                Some(mut inst) => {
                    inst.creator = creator.to_string();
                    inst.render_data = render_data.to_string();
                    inst.updated_at = now;
                    (inst, false)
                }
                None => {
                    let id = next_id(&txn, INSTANCE_SEQ)?;
                    let inst = ConfigInstance {
                        id,
                        template_id,
                        render_data: render_data.to_string(),
                        data_hash: data_hash.to_string(),
                        creator: creator.to_string(),
                        source_app_code: source_app_code.to_string(),
                        created_at: now,
                        updated_at: now,
                    };
                    (inst, true)
                }
            };
            instances
                .insert(key.as_str(), encode(&result.0)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// All instances rendered from one template.
    pub fn list_config_instances(&self, template_id: RowId) -> StateResult<Vec<ConfigInstance>> {
        let prefix = format!("{template_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIG_INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode::<ConfigInstance>(value.value())?);
            }
        }
        results.sort_by_key(|inst| inst.id);
        Ok(results)
    }
}
