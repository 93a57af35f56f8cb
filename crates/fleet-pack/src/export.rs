//! Exporting released packages as one downloadable bundle, and the export
//! job lifecycle around it.
//!
//! The bundle layout mirrors what [`crate::upload::import_upload`] expects:
//! `<type_root>_<os>_<arch>/<project>/...` at the top level.

use std::path::PathBuf;

use fleet_core::{Settings, is_single_segment};
use fleet_state::{ExportJob, JobStatus, PackageQuery, RowId, StateStore, epoch_secs};
use tracing::{error, info};

use crate::archive::{build_archive, copy_into_place, sha256_file, sha256_str};
use crate::error::{IoContext, PackError, PackResult};
use crate::extract::unzip_package;
use crate::publish::PLUGIN_MODULE;

/// Categories an export job may be created for.
pub const EXPORT_CATEGORIES: &[&str] = &[PLUGIN_MODULE];

/// Bundle every released and ready package of `project`/`version`.
/// Returns the path of the bundle under the export root.
pub fn export_plugins(
    store: &StateStore,
    settings: &Settings,
    project: &str,
    version: &str,
) -> PackResult<PathBuf> {
    let query = PackageQuery {
        version: Some(version.to_string()),
        is_release: Some(true),
        is_ready: Some(true),
        ..PackageQuery::project(project)
    };
    let packages = store.list_packages(&query)?;
    if packages.is_empty() {
        return Err(PackError::NotFound(format!(
            "no released package to export for {project} {version}"
        )));
    }

    std::fs::create_dir_all(&settings.temp_dir)
        .io_context(|| format!("create {}", settings.temp_dir.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix("fleet-export-")
        .tempdir_in(&settings.temp_dir)
        .io_context(|| format!("create scratch dir in {}", settings.temp_dir.display()))?;
    for pkg in &packages {
        unzip_package(pkg, scratch.path())?;
        info!(package = %pkg.key(), "package staged for export");
    }

    let bundle = build_archive(scratch.path(), ".", &settings.temp_dir)?;
    let checksum = sha256_file(bundle.path())?;
    let dest = settings
        .export_root
        .join(format!("{project}-{version}-{checksum}.tgz"));
    copy_into_place(bundle.path(), &dest)?;

    info!(project, version, packages = packages.len(), path = %dest.display(), "export ready");
    Ok(dest)
}

/// Record a new export job in the `Ready` state.
pub fn create_export_job(
    store: &StateStore,
    category: &str,
    project: &str,
    version: &str,
    creator: &str,
    source_app_code: &str,
) -> PackResult<ExportJob> {
    if !EXPORT_CATEGORIES.contains(&category) {
        return Err(PackError::Validation(format!(
            "unknown export category {category:?}"
        )));
    }
    for (field, value) in [("project", project), ("version", version)] {
        if !is_single_segment(value) {
            return Err(PackError::Validation(format!(
                "export {field} {value:?} must be a single path segment"
            )));
        }
    }
    let job = store.create_export_job(&ExportJob {
        id: 0,
        category: category.to_string(),
        project: project.to_string(),
        version: version.to_string(),
        status: JobStatus::Ready,
        file_path: None,
        error_message: String::new(),
        creator: creator.to_string(),
        source_app_code: source_app_code.to_string(),
        created_at: epoch_secs(),
        finished_at: None,
    })?;
    info!(job_id = job.id, category, project, version, "export job created");
    Ok(job)
}

/// Run a `Ready` export job to `Success` or `Failed`.
///
/// An export failure is recorded on the job and is not an error of this
/// call; store failures are.
pub fn execute_export_job(
    store: &StateStore,
    settings: &Settings,
    job_id: RowId,
) -> PackResult<ExportJob> {
    let mut job = store.claim_export_job(job_id)?;

    match export_plugins(store, settings, &job.project, &job.version) {
        Ok(path) => {
            job.status = JobStatus::Success;
            job.file_path = Some(path.display().to_string());
            job.error_message.clear();
        }
        Err(err) => {
            error!(job_id, error = %err, "export job failed");
            job.status = JobStatus::Failed;
            job.error_message = err.to_string();
        }
    }
    job.finished_at = Some(epoch_secs());
    store.put_export_job(&job)?;
    info!(job_id, status = ?job.status, "export job finished");
    Ok(job)
}

/// Key a downloader must present to fetch a finished export.
pub fn download_key(job: &ExportJob) -> Option<String> {
    job.file_path.as_deref().map(sha256_str)
}
