//! `fleet publish`, `fleet release` and `fleet list`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use fleet_core::{CpuArch, PackageLayout, PluginOs};
use fleet_pack::{PublishOptions, Publisher};
use fleet_state::{PackageQuery, ReleaseTarget, StateStore};

#[derive(Debug, Clone, Copy)]
pub struct Platform {
    pub os: PluginOs,
    pub cpu_arch: CpuArch,
}

impl Platform {
    pub fn parse(os: &str, arch: &str) -> Result<Self> {
        Ok(Self {
            os: os.parse()?,
            cpu_arch: arch.parse()?,
        })
    }
}

pub fn publish(
    publisher: &Publisher,
    path: &Path,
    platform: Platform,
    external: bool,
    load_templates: bool,
    overwrite: bool,
) -> Result<()> {
    let opts = PublishOptions {
        layout: PackageLayout::from_external_flag(external),
        load_templates,
        overwrite_templates: overwrite,
        ..PublishOptions::new(platform.os, platform.cpu_arch)
    };
    let pkg = publisher
        .publish(path, &opts)
        .with_context(|| format!("publish {}", path.display()))?;
    println!("✓ Published {} (id {})", pkg.key(), pkg.id);
    println!("  Archive: {}", pkg.archive_path().display());
    println!("  SHA256:  {}", pkg.checksum);
    Ok(())
}

/// Explicit ids win; otherwise at least one query field must be given so a
/// bare `--checksum` never targets every package.
pub fn release_target(
    ids: Vec<u64>,
    project: Option<String>,
    version: Option<String>,
    os: Option<String>,
    arch: Option<String>,
) -> Result<ReleaseTarget> {
    if !ids.is_empty() {
        return Ok(ReleaseTarget::Ids(ids));
    }
    if project.is_none() && version.is_none() && os.is_none() && arch.is_none() {
        bail!("release needs --id or at least one of --project/--version/--os/--arch");
    }
    Ok(ReleaseTarget::Query(PackageQuery {
        project,
        version,
        os: os.map(|s| s.parse()).transpose()?,
        cpu_arch: arch.map(|s| s.parse()).transpose()?,
        ..PackageQuery::default()
    }))
}

pub fn release(store: &StateStore, checksums: &[String], target: &ReleaseTarget) -> Result<()> {
    let released = fleet_pack::release(store, checksums, target)?;
    for pkg in &released {
        println!("✓ Released {} ({})", pkg.key(), pkg.checksum);
    }
    Ok(())
}

pub fn list(store: &StateStore, project: Option<&str>, released: bool) -> Result<()> {
    let query = PackageQuery {
        project: project.map(str::to_string),
        is_release: released.then_some(true),
        ..PackageQuery::default()
    };
    let packages = store.list_packages(&query)?;
    println!("{}", serde_json::to_string_pretty(&packages)?);
    Ok(())
}
