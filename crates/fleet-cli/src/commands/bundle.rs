//! `fleet import` and `fleet export`.

use std::path::Path;

use anyhow::{Result, bail};
use fleet_pack::{ImportOptions, PLUGIN_MODULE, Publisher, UploadRequest};
use fleet_state::JobStatus;

pub fn import(
    publisher: &Publisher,
    file: &Path,
    copy: bool,
    creator: &str,
    load_templates: bool,
    overwrite: bool,
) -> Result<()> {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let request = UploadRequest {
        file_name,
        creator: creator.to_string(),
        source_app_code: "fleet-cli".to_string(),
        copy,
    };
    let upload = fleet_pack::register_upload(publisher, file, &request)?;
    println!("✓ Uploaded {} (id {}, {} bytes)", upload.file_name, upload.id, upload.file_size);

    let packages = fleet_pack::import_upload(
        publisher,
        upload.id,
        ImportOptions {
            load_templates,
            overwrite_templates: overwrite,
        },
    )?;
    for pkg in &packages {
        println!("  {} {}", pkg.key(), pkg.checksum);
    }
    println!("✓ Imported {} package(s)", packages.len());
    Ok(())
}

pub fn export(publisher: &Publisher, project: &str, version: &str, creator: &str) -> Result<()> {
    let store = publisher.store();
    let job =
        fleet_pack::create_export_job(store, PLUGIN_MODULE, project, version, creator, "fleet-cli")?;
    let job = fleet_pack::execute_export_job(store, publisher.settings(), job.id)?;
    if job.status != JobStatus::Success {
        bail!("export job {} failed: {}", job.id, job.error_message);
    }
    println!("✓ Exported {project} {version}");
    if let Some(path) = &job.file_path {
        println!("  Bundle: {path}");
    }
    if let Some(key) = fleet_pack::download_key(&job) {
        println!("  Key:    {key}");
    }
    Ok(())
}
