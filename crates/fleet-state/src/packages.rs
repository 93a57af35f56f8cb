//! Plugin descriptors, package artifacts, process controls and the
//! release gate.

use std::collections::BTreeSet;

use fleet_core::{ArtifactKey, PluginCategory};
use redb::{ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, epoch_secs, next_id};
use crate::tables::*;
use crate::types::*;

const PACKAGE_SEQ: &str = "packages";

/// Sort checksums and join them with `|`, the form compared by `release`.
pub fn joined_checksums<'a>(checksums: impl IntoIterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = checksums.into_iter().collect();
    sorted.sort_unstable();
    sorted.join("|")
}

impl StateStore {
    // ── Publish ────────────────────────────────────────────────────

    /// Claim the artifact row for a publish of `key`.
    ///
    /// In one transaction: reject a released artifact with
    /// [`StateError::Conflict`], upsert the plugin descriptor, insert or
    /// reuse the package row (marking it not ready) and get-or-create its
    /// process control. A conflict leaves the store untouched.
    pub fn begin_publish(
        &self,
        desc: &PluginDesc,
        key: &ArtifactKey,
        module: &str,
    ) -> StateResult<PublishClaim> {
        let now = epoch_secs();
        let index_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claim;
        {
            let mut index = txn.open_table(PACKAGE_INDEX).map_err(map_err!(Table))?;
            let mut packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;

            let existing_id = index
                .get(index_key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value());
            let existing: Option<PackageArtifact> = match existing_id {
                Some(id) => packages
                    .get(id)
                    .map_err(map_err!(Read))?
                    .map(|guard| decode(guard.value()))
                    .transpose()?,
                None => None,
            };
            if existing.as_ref().is_some_and(|pkg| pkg.is_release) {
                return Err(StateError::Conflict(format!(
                    "package {key} is released and cannot be overwritten"
                )));
            }

            let mut descs = txn.open_table(PLUGIN_DESCS).map_err(map_err!(Table))?;
            let created_at = descs
                .get(desc.name.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| decode::<PluginDesc>(guard.value()))
                .transpose()?
                .map(|prev| prev.created_at);
            let stored_desc = PluginDesc {
                created_at: created_at.unwrap_or(now),
                updated_at: now,
                ..desc.clone()
            };
            descs
                .insert(desc.name.as_str(), encode(&stored_desc)?.as_slice())
                .map_err(map_err!(Write))?;

            let (package, created) = match existing {
                Some(mut pkg) => {
                    pkg.is_ready = false;
                    pkg.module = module.to_string();
                    pkg.updated_at = now;
                    (pkg, false)
                }
                None => {
                    let id = next_id(&txn, PACKAGE_SEQ)?;
                    let pkg = PackageArtifact {
                        id,
                        project: key.project.clone(),
                        version: key.version.clone(),
                        os: key.os,
                        cpu_arch: key.cpu_arch,
                        pkg_name: key.file_name(),
                        module: module.to_string(),
                        checksum: String::new(),
                        size: 0,
                        pkg_path: String::new(),
                        location: String::new(),
                        is_release: false,
                        is_ready: false,
                        created_at: now,
                        updated_at: now,
                    };
                    (pkg, true)
                }
            };
            packages
                .insert(package.id, encode(&package)?.as_slice())
                .map_err(map_err!(Write))?;
            index
                .insert(index_key.as_str(), package.id)
                .map_err(map_err!(Write))?;

            let mut controls = txn.open_table(PROC_CONTROLS).map_err(map_err!(Table))?;
            let found: Option<ProcessControl> = controls
                .get(package.id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let proc_control = match found {
                Some(pc) => pc,
                None => {
                    let pc = ProcessControl::empty_for(&package);
                    controls
                        .insert(package.id, encode(&pc)?.as_slice())
                        .map_err(map_err!(Write))?;
                    pc
                }
            };

            claim = PublishClaim {
                package,
                proc_control,
                created,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %index_key, id = claim.package.id, created = claim.created, "package claimed");
        Ok(claim)
    }

    /// Store a package's process control. The package must exist.
    pub fn put_proc_control(&self, pc: &ProcessControl) -> StateResult<()> {
        let value = encode(pc)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            if packages.get(pc.package_id).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("package {}", pc.package_id)));
            }
            let mut controls = txn.open_table(PROC_CONTROLS).map_err(map_err!(Table))?;
            controls
                .insert(pc.package_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Record the built archive and flip the package to ready.
    pub fn mark_package_ready(&self, id: RowId, info: ReadyInfo) -> StateResult<PackageArtifact> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let package;
        {
            let mut packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            let found: Option<PackageArtifact> = packages
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let mut pkg = found.ok_or_else(|| StateError::NotFound(format!("package {id}")))?;
            if pkg.is_release {
                return Err(StateError::Conflict(format!(
                    "package {} is released and cannot be overwritten",
                    pkg.key()
                )));
            }
            pkg.checksum = info.checksum;
            pkg.size = info.size;
            pkg.pkg_path = info.pkg_path;
            pkg.location = info.location;
            pkg.is_ready = true;
            pkg.updated_at = epoch_secs();
            packages
                .insert(id, encode(&pkg)?.as_slice())
                .map_err(map_err!(Write))?;
            package = pkg;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, checksum = %package.checksum, "package ready");
        Ok(package)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_package(&self, id: RowId) -> StateResult<Option<PackageArtifact>> {
        self.get_row(PACKAGES, id)
    }

    /// Look up a package by its `(project, version, os, arch)` identity.
    pub fn get_package_by_key(&self, key: &ArtifactKey) -> StateResult<Option<PackageArtifact>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(PACKAGE_INDEX).map_err(map_err!(Table))?;
        let Some(id) = index
            .get(key.table_key().as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };
        let packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
        match packages.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Packages matching `query`, in id order.
    pub fn list_packages(&self, query: &PackageQuery) -> StateResult<Vec<PackageArtifact>> {
        self.list_rows(PACKAGES, |pkg| query.matches(pkg))
    }

    /// Process control of a package.
    pub fn get_proc_control(&self, package_id: RowId) -> StateResult<Option<ProcessControl>> {
        self.get_row(PROC_CONTROLS, package_id)
    }

    pub fn get_plugin_desc(&self, name: &str) -> StateResult<Option<PluginDesc>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLUGIN_DESCS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All plugin descriptors, ordered by name.
    pub fn list_plugin_descs(&self) -> StateResult<Vec<PluginDesc>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLUGIN_DESCS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Descriptors of plugins that should be started automatically.
    pub fn list_auto_launch_plugins(&self) -> StateResult<Vec<PluginDesc>> {
        let mut descs = self.list_plugin_descs()?;
        descs.retain(|d| d.auto_launch);
        Ok(descs)
    }

    /// Names of all first-party plugins.
    pub fn official_plugin_names(&self) -> StateResult<Vec<String>> {
        Ok(self
            .list_plugin_descs()?
            .into_iter()
            .filter(|d| d.category == PluginCategory::Official)
            .map(|d| d.name)
            .collect())
    }

    // ── Release gate ───────────────────────────────────────────────

    /// Mark every package resolved from `target` as released.
    ///
    /// The sorted, `|`-joined checksums of the resolved set must equal those
    /// of `checksums`. Resolution, comparison and the flag flip share one
    /// transaction; any failure releases nothing.
    pub fn release_packages(
        &self,
        target: &ReleaseTarget,
        checksums: &[String],
    ) -> StateResult<Vec<PackageArtifact>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut released = Vec::new();
        {
            let mut packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            let mut resolved: Vec<PackageArtifact> = Vec::new();
            match target {
                ReleaseTarget::Ids(ids) => {
                    let unique: BTreeSet<RowId> = ids.iter().copied().collect();
                    for id in unique {
                        let found: Option<PackageArtifact> = packages
                            .get(id)
                            .map_err(map_err!(Read))?
                            .map(|guard| decode(guard.value()))
                            .transpose()?;
                        resolved
                            .push(found.ok_or_else(|| StateError::NotFound(format!("package {id}")))?);
                    }
                }
                ReleaseTarget::Query(query) => {
                    for entry in packages.iter().map_err(map_err!(Read))? {
                        let (_, value) = entry.map_err(map_err!(Read))?;
                        let pkg: PackageArtifact = decode(value.value())?;
                        if query.matches(&pkg) {
                            resolved.push(pkg);
                        }
                    }
                }
            }

            if resolved.is_empty() {
                return Err(StateError::NotFound(
                    "no packages matched the release target".to_string(),
                ));
            }
            if let Some(pkg) = resolved.iter().find(|pkg| !pkg.is_ready) {
                return Err(StateError::Invalid(format!(
                    "package {} is not ready and cannot be released",
                    pkg.key()
                )));
            }

            let actual = joined_checksums(resolved.iter().map(|pkg| pkg.checksum.as_str()));
            let expected = joined_checksums(checksums.iter().map(String::as_str));
            if actual != expected {
                return Err(StateError::ChecksumMismatch { expected, actual });
            }

            let now = epoch_secs();
            for mut pkg in resolved {
                pkg.is_release = true;
                pkg.updated_at = now;
                packages
                    .insert(pkg.id, encode(&pkg)?.as_slice())
                    .map_err(map_err!(Write))?;
                released.push(pkg);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(count = released.len(), "packages released");
        Ok(released)
    }
}
