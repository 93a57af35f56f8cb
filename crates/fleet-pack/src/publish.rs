//! Package build-and-publish pipeline.
//!
//! Pipeline:
//! 1. Load and validate `<src>/project.yaml`
//! 2. Take the per-artifact lock
//! 3. Claim the package row (descriptor upsert, released check, process
//!    control get-or-create) in one transaction
//! 4. Parse the port range and store the process control
//! 5. Optionally load bundled config templates
//! 6. Build `<project>-<version>.tgz`, digest it and copy it into
//!    `<dist_root>/<os>/<arch>/`
//! 7. Mark the package ready
//!
//! A failure after step 3 leaves the package existing but not ready.
//! Publishing is blocking I/O; run it on a worker thread
//! (`tokio::task::spawn_blocking` from async code).

use std::path::Path;
use std::sync::{Arc, PoisonError};

use fleet_core::{
    ArtifactKey, CpuArch, Manifest, PackageLayout, PluginOs, Settings, parse_port_range,
};
use fleet_state::{
    PackageArtifact, PluginDesc, ProcessControl, ReadyInfo, StateError, StateStore,
};
use tracing::{debug, info};

use crate::archive::{build_archive, copy_into_place, sha256_file};
use crate::error::{IoContext, PackError, PackResult};
use crate::locks::KeyLocks;
use crate::templates::import_templates;

/// Module name recorded on plugin packages.
pub const PLUGIN_MODULE: &str = "gse_plugin";

/// Per-call publish parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub os: PluginOs,
    pub cpu_arch: CpuArch,
    pub layout: PackageLayout,
    /// Load the manifest's config templates into the store.
    pub load_templates: bool,
    /// Replace templates that already exist.
    pub overwrite_templates: bool,
}

impl PublishOptions {
    pub fn new(os: PluginOs, cpu_arch: CpuArch) -> Self {
        Self {
            os,
            cpu_arch,
            layout: PackageLayout::Official,
            load_templates: false,
            overwrite_templates: false,
        }
    }
}

/// Builds archives and records them in the store.
#[derive(Clone)]
pub struct Publisher {
    store: StateStore,
    settings: Arc<Settings>,
    locks: Arc<KeyLocks>,
}

impl Publisher {
    pub fn new(store: StateStore, settings: Arc<Settings>) -> Self {
        Self {
            store,
            settings,
            locks: Arc::new(KeyLocks::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Publish the plugin source directory `src_dir`.
    pub fn publish(&self, src_dir: &Path, opts: &PublishOptions) -> PackResult<PackageArtifact> {
        let manifest = Manifest::from_dir(src_dir)?;
        let key = ArtifactKey::new(&manifest.name, &manifest.version, opts.os, opts.cpu_arch);
        info!(package = %key, src = %src_dir.display(), layout = ?opts.layout, "publishing package");

        let lock = self.locks.lock_for(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let claim = self
            .store
            .begin_publish(&plugin_desc(&manifest), &key, PLUGIN_MODULE)
            .map_err(|err| match err {
                StateError::Conflict(_) => PackError::Released {
                    key: key.to_string(),
                },
                other => other.into(),
            })?;
        let package_id = claim.package.id;
        debug!(package = %key, id = package_id, created = claim.created, "package row claimed");

        let port_range =
            parse_port_range(&manifest.port_range).map_err(|source| PackError::PortRange {
                key: key.to_string(),
                source,
            })?;
        let paths = self.settings.install_paths_for(&manifest.name, opts.os);
        let proc_control = ProcessControl {
            install_path: paths.install_path,
            log_path: paths.log_path,
            data_path: paths.data_path,
            pid_path: paths.pid_path,
            control: manifest.control.clone(),
            process_name: manifest.process_name.clone(),
            port_range,
            need_delegate: manifest.need_delegate,
            os: opts.os,
            ..claim.proc_control
        };
        self.store.put_proc_control(&proc_control)?;

        if opts.load_templates {
            let loaded =
                import_templates(&self.store, src_dir, &manifest, opts.overwrite_templates)?;
            debug!(package = %key, templates = loaded.len(), "config templates loaded");
        }

        let archive_root = opts.layout.archive_root(&manifest.name);
        let built = build_archive(src_dir, &archive_root, &self.settings.temp_dir)?;
        let checksum = sha256_file(built.path())?;
        let size = built
            .as_file()
            .metadata()
            .io_context(|| format!("stat {}", built.path().display()))?
            .len();

        let dist_dir = self
            .settings
            .dist_root
            .join(opts.os.as_str())
            .join(opts.cpu_arch.as_str());
        let dest = dist_dir.join(key.file_name());
        copy_into_place(built.path(), &dest)?;

        let location = format!(
            "{}/{}/{}",
            self.settings.download_base_url.trim_end_matches('/'),
            opts.os.as_str(),
            opts.cpu_arch.as_str()
        );
        let package = self.store.mark_package_ready(
            package_id,
            ReadyInfo {
                checksum,
                size,
                pkg_path: dist_dir.display().to_string(),
                location,
            },
        )?;
        info!(
            package = %key,
            id = package.id,
            path = %dest.display(),
            checksum = %package.checksum,
            "package is ready"
        );
        Ok(package)
    }
}

fn plugin_desc(manifest: &Manifest) -> PluginDesc {
    PluginDesc {
        name: manifest.name.clone(),
        category: manifest.category,
        description: manifest.description.clone(),
        description_en: manifest.description_en.clone(),
        scenario: manifest.scenario.clone(),
        scenario_en: manifest.scenario_en.clone(),
        launch_node: manifest.launch_node,
        config_file: manifest.config_file.clone(),
        config_format: manifest.config_format.clone(),
        use_db: manifest.use_db,
        auto_launch: manifest.auto_launch,
        is_binary: manifest.is_binary,
        created_at: 0,
        updated_at: 0,
    }
}
