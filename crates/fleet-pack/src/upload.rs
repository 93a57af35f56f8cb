//! Uploaded bundles: recording them and publishing their contents.
//!
//! A bundle is a `.tgz` whose top-level directories are named
//! `[external_]plugins_<os>_<arch>`; each directory below one of those is a
//! plugin source directory with its own `project.yaml`.

use std::fs;
use std::path::{Path, PathBuf};

use fleet_core::{CpuArch, PackageLayout, PluginOs, is_single_segment};
use fleet_state::{PackageArtifact, RowId, UploadRecord, epoch_secs};
use regex::Regex;
use tracing::{info, warn};

use crate::archive::sha256_file;
use crate::error::{IoContext, PackError, PackResult};
use crate::extract::safe_extract;
use crate::publish::{PLUGIN_MODULE, PublishOptions, Publisher};

const BUNDLE_DIR_PATTERN: &str =
    r"^(?P<external>external_)?plugins_(?P<os>linux|windows|aix)_(?P<arch>x86_64|x86|powerpc|aarch64)$";

/// Platform and layout encoded in a bundle's top-level directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleDir {
    pub layout: PackageLayout,
    pub os: PluginOs,
    pub cpu_arch: CpuArch,
}

/// Matches bundle directory names.
pub struct BundleDirMatcher {
    re: Regex,
}

impl BundleDirMatcher {
    pub fn new() -> PackResult<Self> {
        let re = Regex::new(BUNDLE_DIR_PATTERN)
            .map_err(|e| PackError::Validation(format!("bundle pattern: {e}")))?;
        Ok(Self { re })
    }

    pub fn parse(&self, name: &str) -> Option<BundleDir> {
        let caps = self.re.captures(name)?;
        let os = caps.name("os")?.as_str().parse().ok()?;
        let cpu_arch = caps.name("arch")?.as_str().parse().ok()?;
        Some(BundleDir {
            layout: PackageLayout::from_external_flag(caps.name("external").is_some()),
            os,
            cpu_arch,
        })
    }
}

/// Who is uploading and how the file should be taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Name the file is stored under in the upload root.
    pub file_name: String,
    pub creator: String,
    pub source_app_code: String,
    /// Copy instead of move, leaving the source in place.
    pub copy: bool,
}

/// Options for publishing the contents of an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub load_templates: bool,
    pub overwrite_templates: bool,
}

/// Move (or copy) `file` into the upload root and record it.
pub fn register_upload(
    publisher: &Publisher,
    file: &Path,
    request: &UploadRequest,
) -> PackResult<UploadRecord> {
    if !file.is_file() {
        return Err(PackError::Io {
            context: format!("uploaded file {} does not exist", file.display()),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }
    if !is_single_segment(&request.file_name) {
        return Err(PackError::Validation(format!(
            "upload file name {:?} must be a plain file name",
            request.file_name
        )));
    }

    let upload_root = &publisher.settings().upload_root;
    fs::create_dir_all(upload_root).io_context(|| format!("create {}", upload_root.display()))?;
    let dest = upload_root.join(&request.file_name);
    if request.copy {
        fs::copy(file, &dest)
            .io_context(|| format!("copy {} to {}", file.display(), dest.display()))?;
    } else if fs::rename(file, &dest).is_err() {
        // rename fails across filesystems; fall back to copy + remove
        fs::copy(file, &dest)
            .io_context(|| format!("copy {} to {}", file.display(), dest.display()))?;
        fs::remove_file(file).io_context(|| format!("remove {}", file.display()))?;
    }

    let file_size = fs::metadata(&dest)
        .io_context(|| format!("stat {}", dest.display()))?
        .len();
    let record = publisher.store().create_upload(&UploadRecord {
        id: 0,
        file_name: request.file_name.clone(),
        module: PLUGIN_MODULE.to_string(),
        file_path: dest.display().to_string(),
        file_size,
        checksum: sha256_file(&dest)?,
        creator: request.creator.clone(),
        source_app_code: request.source_app_code.clone(),
        uploaded_at: epoch_secs(),
    })?;
    info!(
        id = record.id,
        file = %dest.display(),
        creator = %record.creator,
        source_app = %record.source_app_code,
        "upload registered"
    );
    Ok(record)
}

/// Extract an upload and publish every plugin directory in it.
pub fn import_upload(
    publisher: &Publisher,
    upload_id: RowId,
    options: ImportOptions,
) -> PackResult<Vec<PackageArtifact>> {
    let record = publisher
        .store()
        .get_upload(upload_id)?
        .ok_or_else(|| PackError::NotFound(format!("upload {upload_id}")))?;

    let temp_dir = &publisher.settings().temp_dir;
    fs::create_dir_all(temp_dir).io_context(|| format!("create {}", temp_dir.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix("fleet-import-")
        .tempdir_in(temp_dir)
        .io_context(|| format!("create scratch dir in {}", temp_dir.display()))?;
    safe_extract(Path::new(&record.file_path), scratch.path())?;

    let matcher = BundleDirMatcher::new()?;
    let mut published = Vec::new();
    for first in sorted_entries(scratch.path())? {
        let name = first
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(bundle) = matcher.parse(&name).filter(|_| first.is_dir()) else {
            info!(path = %first.display(), "not a platform directory, skipping");
            continue;
        };

        for source in sorted_entries(&first)? {
            if !source.is_dir() {
                info!(path = %source.display(), "plain file in platform directory, skipping");
                continue;
            }
            let opts = PublishOptions {
                os: bundle.os,
                cpu_arch: bundle.cpu_arch,
                layout: bundle.layout,
                load_templates: options.load_templates,
                overwrite_templates: options.overwrite_templates,
            };
            match publisher.publish(&source, &opts) {
                Ok(pkg) => published.push(pkg),
                Err(err) => {
                    warn!(upload_id, source = %source.display(), error = %err, "import aborted");
                    return Err(err);
                }
            }
        }
    }

    info!(upload_id, file = %record.file_name, packages = published.len(), "upload imported");
    Ok(published)
}

fn sorted_entries(dir: &Path) -> PackResult<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).io_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.io_context(|| format!("read dir {}", dir.display()))?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}
