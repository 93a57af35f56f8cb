//! End-to-end package pipeline.
//!
//! Publishes a plugin for two platforms, releases it, exports the bundle and
//! imports that bundle into a second, empty deployment.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_core::{CpuArch, PackageLayout, PluginOs, PortRange, Settings};
use fleet_pack::*;
use fleet_state::{PackageQuery, ReleaseTarget, StateStore};

fn publisher(root: &Path) -> Publisher {
    Publisher::new(
        StateStore::open_in_memory().unwrap(),
        Arc::new(Settings::rooted_at(root)),
    )
}

fn write_plugin(root: &Path) -> PathBuf {
    let src = root.join("source").join("exceptionbeat");
    fs::create_dir_all(src.join("etc")).unwrap();
    fs::write(src.join("exceptionbeat"), "#!/bin/sh\n").unwrap();
    fs::write(src.join("etc").join("main.conf.tpl"), "port: {{ port }}\n").unwrap();
    fs::write(
        src.join("project.yaml"),
        r#"
name: exceptionbeat
version: "3.2.1"
category: official
description: exception collector
port_range: "58000-58010,58100"
control:
  start: ./start.sh exceptionbeat
  stop: ./stop.sh exceptionbeat
config_templates:
  - source_path: etc/main.conf.tpl
    plugin_version: "*"
    name: main.conf
    version: "1"
    format: yaml
    file_path: etc
    is_main_config: true
"#,
    )
    .unwrap();
    src
}

#[test]
fn publish_release_export_import() {
    let origin_dir = tempfile::tempdir().unwrap();
    let origin = publisher(origin_dir.path());
    let src = write_plugin(origin_dir.path());

    let mut packages = Vec::new();
    for (os, arch) in [(PluginOs::Linux, CpuArch::X86_64), (PluginOs::Aix, CpuArch::Powerpc)] {
        let opts = PublishOptions {
            load_templates: os == PluginOs::Linux,
            ..PublishOptions::new(os, arch)
        };
        let src_copy = origin_dir.path().join(format!("copy-{os}"));
        copy_tree(&src, &src_copy);
        packages.push(origin.publish(&src_copy, &opts).unwrap());
    }
    assert!(packages.iter().all(|p| p.is_ready && !p.is_release));

    let control = origin
        .store()
        .get_proc_control(packages[0].id)
        .unwrap()
        .unwrap();
    assert_eq!(
        control.port_range,
        vec![
            PortRange {
                min: 58000,
                max: 58010
            },
            PortRange {
                min: 58100,
                max: 58100
            },
        ]
    );
    assert_eq!(
        origin
            .store()
            .list_config_templates("exceptionbeat", None)
            .unwrap()
            .len(),
        1
    );

    let checksums: Vec<String> = packages.iter().map(|p| p.checksum.clone()).collect();
    let released = release(
        origin.store(),
        &checksums,
        &ReleaseTarget::Query(PackageQuery::project("exceptionbeat")),
    )
    .unwrap();
    assert_eq!(released.len(), 2);

    let job = create_export_job(
        origin.store(),
        PLUGIN_MODULE,
        "exceptionbeat",
        "3.2.1",
        "admin",
        "fleet",
    )
    .unwrap();
    let job = execute_export_job(origin.store(), origin.settings(), job.id).unwrap();
    let bundle = PathBuf::from(job.file_path.clone().unwrap());

    let target_dir = tempfile::tempdir().unwrap();
    let target = publisher(target_dir.path());
    let upload = register_upload(
        &target,
        &bundle,
        &UploadRequest {
            file_name: "exceptionbeat-3.2.1.tgz".to_string(),
            creator: "admin".to_string(),
            source_app_code: "fleet".to_string(),
            copy: true,
        },
    )
    .unwrap();
    assert!(bundle.exists());

    let imported = import_upload(&target, upload.id, ImportOptions::default()).unwrap();
    let mut platforms: Vec<(PluginOs, CpuArch)> =
        imported.iter().map(|p| (p.os, p.cpu_arch)).collect();
    platforms.sort_by_key(|(os, _)| os.as_str());
    assert_eq!(
        platforms,
        vec![(PluginOs::Aix, CpuArch::Powerpc), (PluginOs::Linux, CpuArch::X86_64)]
    );
    for pkg in &imported {
        assert!(pkg.is_ready);
        assert!(!pkg.is_release, "import never releases");
        assert!(Path::new(&pkg.archive_path()).is_file());
    }

    let staged = unzip_package(&imported[0], &target_dir.path().join("check")).unwrap();
    assert!(staged.join("exceptionbeat").is_file());
    assert!(staged.join("project.yaml").is_file());
}

#[test]
fn released_package_cannot_be_republished() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = publisher(dir.path());
    let src = write_plugin(dir.path());
    let opts = PublishOptions::new(PluginOs::Linux, CpuArch::X86_64);

    let pkg = publisher.publish(&src, &opts).unwrap();
    release(
        publisher.store(),
        &[pkg.checksum.clone()],
        &ReleaseTarget::Ids(vec![pkg.id]),
    )
    .unwrap();

    let err = publisher.publish(&src, &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let stored = publisher.store().get_package(pkg.id).unwrap().unwrap();
    assert_eq!(stored.checksum, pkg.checksum);
    assert!(stored.is_release);
}

#[test]
fn hostile_upload_is_rejected_before_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = publisher(dir.path());

    let bundle = dir.path().join("evil.tgz");
    {
        let file = fs::File::create(&bundle).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        let data = b"owned";
        let mut header = tar::Header::new_gnu();
        let name = b"plugins_linux_x86_64/../../escape";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    let upload = register_upload(
        &publisher,
        &bundle,
        &UploadRequest {
            file_name: "evil.tgz".to_string(),
            creator: "mallory".to_string(),
            source_app_code: "fleet".to_string(),
            copy: false,
        },
    )
    .unwrap();
    let err = import_upload(&publisher, upload.id, ImportOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
    assert!(!dir.path().join("escape").exists());
    assert!(
        publisher
            .store()
            .list_packages(&PackageQuery::default())
            .unwrap()
            .is_empty()
    );
}

/// Pack `dir` as a bundle and register it as an upload.
fn upload_dir(publisher: &Publisher, root: &Path, dir: &Path) -> u64 {
    let bundle = root.join("bundle.tgz");
    {
        let file = fs::File::create(&bundle).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        builder.append_dir_all(".", dir).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }
    register_upload(
        publisher,
        &bundle,
        &UploadRequest {
            file_name: "bundle.tgz".to_string(),
            creator: "mallory".to_string(),
            source_app_code: "fleet".to_string(),
            copy: false,
        },
    )
    .unwrap()
    .id
}

fn bundle_with_manifest(root: &Path, manifest: &str) -> PathBuf {
    let staging = root.join("staging");
    let plugin = staging.join("plugins_linux_x86_64").join("evil");
    fs::create_dir_all(&plugin).unwrap();
    fs::write(plugin.join("evil"), "#!/bin/sh\n").unwrap();
    fs::write(plugin.join("project.yaml"), manifest).unwrap();
    staging
}

#[test]
fn bundle_manifest_cannot_name_paths_outside_the_dist_root() {
    for manifest in [
        "name: ../../../escaped\nversion: '1.0'\ncategory: official\n",
        "name: evil\nversion: ../../../../escaped\ncategory: official\n",
    ] {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let staging = bundle_with_manifest(dir.path(), manifest);
        let upload_id = upload_dir(&publisher, dir.path(), &staging);

        let err = import_upload(&publisher, upload_id, ImportOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{manifest:?}: {err}");
        assert!(!dir.path().join("escaped-1.0.tgz").exists());
        assert!(!dir.path().join("download").exists());
        assert!(publisher.store().list_plugin_descs().unwrap().is_empty());
        assert!(
            publisher
                .store()
                .list_packages(&PackageQuery::default())
                .unwrap()
                .is_empty()
        );
    }
}

#[test]
fn bundle_templates_cannot_read_host_files() {
    for absolute in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.txt");
        fs::write(&victim, "do not steal").unwrap();
        // the plugin is extracted to <root>/tmp/<scratch>/<platform>/evil
        let source = if absolute {
            victim.display().to_string()
        } else {
            "../../../../victim.txt".to_string()
        };
        let publisher = publisher(dir.path());
        let manifest = format!(
            r#"
name: evil
version: "1.0"
category: official
config_templates:
  - source_path: {source:?}
    plugin_version: "*"
    name: stolen.conf
    version: "1"
    format: yaml
    file_path: etc
"#
        );
        let staging = bundle_with_manifest(dir.path(), &manifest);
        let upload_id = upload_dir(&publisher, dir.path(), &staging);
        fs::remove_dir_all(&staging).unwrap();

        let options = ImportOptions {
            load_templates: true,
            overwrite_templates: true,
        };
        let err = import_upload(&publisher, upload_id, options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{source:?}: {err}");
        assert_eq!(fs::read_to_string(&victim).unwrap(), "do not steal");
        assert!(
            publisher
                .store()
                .list_config_templates("evil", None)
                .unwrap()
                .is_empty()
        );
        assert!(publisher.store().list_plugin_descs().unwrap().is_empty());
    }
}

#[test]
fn third_party_layout_survives_import() {
    let dir = tempfile::tempdir().unwrap();
    let origin = publisher(dir.path());
    let src = write_plugin(dir.path());
    let opts = PublishOptions {
        layout: PackageLayout::ThirdParty,
        ..PublishOptions::new(PluginOs::Windows, CpuArch::X86_64)
    };
    let pkg = origin.publish(&src, &opts).unwrap();
    release(origin.store(), &[pkg.checksum.clone()], &ReleaseTarget::Ids(vec![pkg.id])).unwrap();
    let bundle = export_plugins(origin.store(), origin.settings(), "exceptionbeat", "3.2.1").unwrap();

    let other_dir = tempfile::tempdir().unwrap();
    let other = publisher(other_dir.path());
    let upload = register_upload(
        &other,
        &bundle,
        &UploadRequest {
            file_name: "bundle.tgz".to_string(),
            creator: "admin".to_string(),
            source_app_code: "fleet".to_string(),
            copy: true,
        },
    )
    .unwrap();
    let imported = import_upload(&other, upload.id, ImportOptions::default()).unwrap();
    assert_eq!(imported.len(), 1);
    let members = archive::list_members(Path::new(&imported[0].archive_path())).unwrap();
    assert!(
        members
            .iter()
            .any(|m| m.starts_with("external_plugins/exceptionbeat"))
    );
}

fn copy_tree(src: &Path, dest: &Path) {
    fs::create_dir_all(dest).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dest.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}
