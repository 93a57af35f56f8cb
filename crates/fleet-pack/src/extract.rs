//! Archive extraction.
//!
//! Two entry points with different trust levels:
//!
//! * [`unzip_package`] lays a previously built artifact out under a scratch
//!   directory as `<type_root>_<os>_<arch>/<project>/`, stripping the
//!   archive root from every member.
//! * [`safe_extract`] unpacks an arbitrary uploaded bundle. Every member is
//!   validated before the first byte is written; a single escaping member
//!   aborts the extraction with nothing written.

use std::fs;
use std::path::{Component, Path, PathBuf};

use fleet_core::PackageLayout;
use fleet_state::PackageArtifact;
use tar::EntryType;
use tracing::{debug, info, warn};

use crate::archive::{list_members, open_archive};
use crate::error::{IoContext, PackError, PackResult};

/// Decide the layout of a built artifact from its member paths.
pub fn detect_layout(members: &[PathBuf]) -> PackageLayout {
    let external_root = PackageLayout::ThirdParty.type_root();
    let is_external = members.iter().any(|member| {
        member
            .components()
            .find(|c| !matches!(c, Component::CurDir))
            .is_some_and(|first| first.as_os_str() == external_root)
    });
    PackageLayout::from_external_flag(is_external)
}

/// Extract a built artifact under `target_root`. Returns the project
/// directory the files were written to.
pub fn unzip_package(pkg: &PackageArtifact, target_root: &Path) -> PackResult<PathBuf> {
    let archive_path = pkg.archive_path();
    if !archive_path.is_file() {
        return Err(PackError::Io {
            context: format!("archive of package {} missing at {}", pkg.key(), archive_path.display()),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }

    let members = list_members(&archive_path)?;
    let layout = detect_layout(&members);
    let target = target_root
        .join(layout.platform_dir(pkg.os, pkg.cpu_arch))
        .join(&pkg.project);
    fs::create_dir_all(&target).io_context(|| format!("create {}", target.display()))?;

    let package_root = PathBuf::from(layout.archive_root(&pkg.project));
    let type_root = PathBuf::from(layout.type_root());
    debug!(
        package = %pkg.key(),
        ?layout,
        target = %target.display(),
        "unzipping package"
    );

    let mut archive = open_archive(&archive_path)?;
    let entries = archive
        .entries()
        .io_context(|| format!("read archive {}", archive_path.display()))?;
    for entry in entries {
        let mut entry = entry.io_context(|| format!("read entry of {}", archive_path.display()))?;
        let member = entry
            .path()
            .io_context(|| format!("read entry path of {}", archive_path.display()))?
            .into_owned();
        let member = strip_cur_dir(&member);
        if member == package_root || member == type_root {
            continue;
        }
        check_member(&member, &archive_path, &target)?;

        let relative = member.strip_prefix(&package_root).unwrap_or(&member);
        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).io_context(|| format!("create {}", parent.display()))?;
        }
        entry
            .unpack(&dest)
            .io_context(|| format!("extract {} to {}", member.display(), dest.display()))?;
    }

    info!(package = %pkg.key(), target = %target.display(), "package unzipped");
    Ok(target)
}

/// Extract an untrusted `.tgz` into `dest`. Returns the written paths.
pub fn safe_extract(archive_path: &Path, dest: &Path) -> PackResult<Vec<PathBuf>> {
    // First pass: validate everything, write nothing.
    {
        let mut archive = open_archive(archive_path)?;
        let entries = archive
            .entries()
            .io_context(|| format!("read archive {}", archive_path.display()))?;
        for entry in entries {
            let entry = entry.io_context(|| format!("read entry of {}", archive_path.display()))?;
            let member = entry
                .path()
                .io_context(|| format!("read entry path of {}", archive_path.display()))?
                .into_owned();
            check_member(&member, archive_path, dest)?;

            let kind = entry.header().entry_type();
            if matches!(kind, EntryType::Symlink | EntryType::Link) {
                let link = entry
                    .link_name()
                    .io_context(|| format!("read link target of {}", member.display()))?
                    .unwrap_or_default()
                    .into_owned();
                check_link(&member, &link, archive_path, dest)?;
            }
        }
    }

    fs::create_dir_all(dest).io_context(|| format!("create {}", dest.display()))?;
    let mut written = Vec::new();
    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .io_context(|| format!("read archive {}", archive_path.display()))?;
    for entry in entries {
        let mut entry = entry.io_context(|| format!("read entry of {}", archive_path.display()))?;
        let member = entry
            .path()
            .io_context(|| format!("read entry path of {}", archive_path.display()))?
            .into_owned();
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory | EntryType::Symlink | EntryType::Link => {}
            other => {
                warn!(member = %member.display(), ?other, "skipping special archive member");
                continue;
            }
        }
        let unpacked = entry
            .unpack_in(dest)
            .io_context(|| format!("extract {} into {}", member.display(), dest.display()))?;
        if unpacked {
            written.push(dest.join(&member));
        }
    }

    info!(
        archive = %archive_path.display(),
        dest = %dest.display(),
        members = written.len(),
        "bundle extracted"
    );
    Ok(written)
}

fn strip_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// A member must be a relative path made of plain components.
fn check_member(member: &Path, archive: &Path, dest: &Path) -> PackResult<()> {
    if member.is_absolute()
        || member
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(traversal(member, archive, dest));
    }
    Ok(())
}

/// Link targets may only point downwards; with plain member paths this
/// keeps every link chain inside `dest`.
fn check_link(member: &Path, target: &Path, archive: &Path, dest: &Path) -> PackResult<()> {
    if target.as_os_str().is_empty()
        || target.is_absolute()
        || target
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        warn!(
            member = %member.display(),
            target = %target.display(),
            "archive link escapes destination"
        );
        return Err(traversal(member, archive, dest));
    }
    Ok(())
}

fn traversal(member: &Path, archive: &Path, dest: &Path) -> PackError {
    PackError::PathTraversal {
        archive: archive.to_path_buf(),
        member: member.display().to_string(),
        dest: dest.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use fleet_core::{CpuArch, PluginOs};

    /// Write a `.tgz` with the given regular files. Paths are written raw so
    /// hostile names survive.
    fn write_tgz(path: &Path, files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            {
                let raw = header.as_old_mut();
                raw.name[..name.len()].copy_from_slice(name.as_bytes());
            }
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn write_symlink_tgz(path: &Path, name: &str, target: &str) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, name, target).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn package(dir: &Path, project: &str) -> PackageArtifact {
        PackageArtifact {
            id: 1,
            project: project.to_string(),
            version: "1.0".to_string(),
            os: PluginOs::Linux,
            cpu_arch: CpuArch::X86_64,
            pkg_name: format!("{project}-1.0.tgz"),
            module: "gse_plugin".to_string(),
            checksum: String::new(),
            size: 0,
            pkg_path: dir.display().to_string(),
            location: String::new(),
            is_release: true,
            is_ready: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn traversal_member_aborts_with_nothing_written() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tgz");
        write_tgz(
            &archive,
            &[("ok/first.txt", b"fine"), ("../../etc/passwd", b"root::0:0")],
        );
        let dest = dir.path().join("out");

        let err = safe_extract(&archive, &dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(err.to_string().contains("../../etc/passwd"));
        assert!(!dest.join("ok/first.txt").exists());
        assert!(!dir.path().join("etc/passwd").exists());
    }

    #[test]
    fn absolute_member_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("abs.tgz");
        write_tgz(&archive, &[("/tmp/fleet-evil", b"x")]);
        let err = safe_extract(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, PackError::PathTraversal { .. }));
    }

    #[test]
    fn escaping_symlink_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("link.tgz");
        write_symlink_tgz(&archive, "plugins_linux_x86_64/etc", "../../../etc");
        let dest = dir.path().join("out");
        let err = safe_extract(&archive, &dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(!dest.exists());
    }

    #[test]
    fn clean_bundle_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ok.tgz");
        write_tgz(
            &archive,
            &[
                ("plugins_linux_x86_64/basereport/project.yaml", b"name: basereport"),
                ("./plugins_linux_x86_64/basereport/bin/basereport", b"bin"),
            ],
        );
        let dest = dir.path().join("out");
        let written = safe_extract(&archive, &dest).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            fs::read(dest.join("plugins_linux_x86_64/basereport/bin/basereport")).unwrap(),
            b"bin"
        );
    }

    #[test]
    fn detects_layout_from_first_segment() {
        let external = vec![PathBuf::from("external_plugins/a/bin/a")];
        assert_eq!(detect_layout(&external), PackageLayout::ThirdParty);
        let official = vec![PathBuf::from("plugins/bin/a"), PathBuf::from("plugins/etc")];
        assert_eq!(detect_layout(&official), PackageLayout::Official);
        let dotted = vec![PathBuf::from("./external_plugins/a")];
        assert_eq!(detect_layout(&dotted), PackageLayout::ThirdParty);
    }

    #[test]
    fn unzip_strips_third_party_root() {
        let dir = tempfile::tempdir().unwrap();
        write_tgz(
            &dir.path().join("sampler-1.0.tgz"),
            &[
                ("external_plugins/sampler/bin/sampler", b"bin"),
                ("external_plugins/sampler/etc/sampler.conf", b"conf"),
            ],
        );
        let pkg = package(dir.path(), "sampler");
        let scratch = dir.path().join("scratch");

        let target = unzip_package(&pkg, &scratch).unwrap();
        assert_eq!(target, scratch.join("external_plugins_linux_x86_64/sampler"));
        assert_eq!(fs::read(target.join("bin/sampler")).unwrap(), b"bin");
        assert_eq!(fs::read(target.join("etc/sampler.conf")).unwrap(), b"conf");
    }

    #[test]
    fn unzip_strips_official_root() {
        let dir = tempfile::tempdir().unwrap();
        write_tgz(
            &dir.path().join("basereport-1.0.tgz"),
            &[("plugins/bin/basereport", b"bin")],
        );
        let pkg = package(dir.path(), "basereport");
        let target = unzip_package(&pkg, &dir.path().join("scratch")).unwrap();
        assert!(target.ends_with("plugins_linux_x86_64/basereport"));
        assert_eq!(fs::read(target.join("bin/basereport")).unwrap(), b"bin");
    }

    #[test]
    fn unzip_missing_archive_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package(dir.path(), "ghost");
        let err = unzip_package(&pkg, &dir.path().join("scratch")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("ghost-1.0.tgz"));
    }
}
