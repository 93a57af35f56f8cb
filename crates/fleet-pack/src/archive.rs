//! gzip-compressed tar helpers and file digests.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{IoContext, PackResult};

/// Archive `src_dir` under `root` into a new temporary `.tgz` in `temp_dir`.
///
/// Symlinks are stored as links, not followed. The returned file is removed
/// when dropped.
pub fn build_archive(src_dir: &Path, root: &str, temp_dir: &Path) -> PackResult<NamedTempFile> {
    fs::create_dir_all(temp_dir).io_context(|| format!("create {}", temp_dir.display()))?;
    let tmp = tempfile::Builder::new()
        .prefix("fleet-")
        .suffix(".tgz")
        .tempfile_in(temp_dir)
        .io_context(|| format!("create temp archive in {}", temp_dir.display()))?;
    let file = tmp
        .reopen()
        .io_context(|| format!("open {}", tmp.path().display()))?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(root, src_dir)
        .io_context(|| format!("archive {} as {root}", src_dir.display()))?;
    let encoder = builder
        .into_inner()
        .io_context(|| format!("finish tar stream {}", tmp.path().display()))?;
    encoder
        .finish()
        .io_context(|| format!("finish gzip stream {}", tmp.path().display()))?;

    debug!(src = %src_dir.display(), root, archive = %tmp.path().display(), "archive built");
    Ok(tmp)
}

/// Open a `.tgz` for reading entries.
pub fn open_archive(path: &Path) -> PackResult<tar::Archive<GzDecoder<File>>> {
    let file = File::open(path).io_context(|| format!("open archive {}", path.display()))?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

/// Member paths of a `.tgz`, in archive order.
pub fn list_members(path: &Path) -> PackResult<Vec<PathBuf>> {
    let mut archive = open_archive(path)?;
    let mut members = Vec::new();
    let entries = archive
        .entries()
        .io_context(|| format!("read archive {}", path.display()))?;
    for entry in entries {
        let entry = entry.io_context(|| format!("read entry of {}", path.display()))?;
        let member = entry
            .path()
            .io_context(|| format!("read entry path of {}", path.display()))?
            .into_owned();
        members.push(member);
    }
    Ok(members)
}

/// Lowercase hex SHA-256 of a file, read in chunks.
pub fn sha256_file(path: &Path) -> PackResult<String> {
    let mut file = File::open(path).io_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .io_context(|| format!("read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_str(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Copy `src` to `dest`, creating `dest`'s parent directories.
pub fn copy_into_place(src: &Path, dest: &Path) -> PackResult<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).io_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(src, dest).io_context(|| format!("copy {} to {}", src.display(), dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_archive_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/basereport"), b"binary").unwrap();
        fs::write(src.join("project.yaml"), b"name: basereport").unwrap();

        let tmp = build_archive(&src, "external_plugins/basereport", &dir.path().join("tmp")).unwrap();
        let members = list_members(tmp.path()).unwrap();
        assert!(members.contains(&PathBuf::from("external_plugins/basereport/bin/basereport")));
        assert!(members.contains(&PathBuf::from("external_plugins/basereport/project.yaml")));
        assert!(members.iter().all(|m| m.starts_with("external_plugins/basereport")));
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_str("abc"), sha256_file(&path).unwrap());
    }

    #[test]
    fn copy_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.tgz");
        fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("linux/x86_64/a.tgz");
        assert_eq!(copy_into_place(&src, &dest).unwrap(), 4);
        // existing directory is fine
        copy_into_place(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"data");
    }
}
