use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use imgforge::config::{BuildConfig, BuildMode, ClassicOptions, Compression, SnapOptions};
use imgforge::disk::io::read_region;
use imgforge::disk::utils::MIB;
use imgforge::error::BuildError;
use imgforge::statemachine::report::RecordingReporter;
use imgforge::statemachine::state::StateFile;
use imgforge::statemachine::workspace::WorkspaceLock;
use imgforge::statemachine::{MachineState, StateMachine};
use imgforge::steps::Manifest;
use imgforge::tools::ToolCommand;
use imgforge::tools::FakeRunner;

const SNAP_LAYOUT: &str = r#"
name = "pc"
bootloader = "grub"

[[structure]]
name = "mbr"
kind = "mbr"
size = "440"
content = [{ image = "pc-boot.img" }]

[[structure]]
name = "system-boot"
kind = "esp"
role = "system-boot"
filesystem = "vfat"
size = "4M"
bootable = true
content = [{ source = "grubx64.efi", target = "EFI/boot/" }]

[[structure]]
name = "writable"
kind = "linux"
role = "system-data"
filesystem = "ext4"
size = "8M"
"#;

const CLASSIC_LAYOUT: &str = r#"
name = "pc"
bootloader = "grub"

[[structure]]
name = "system-boot"
kind = "esp"
role = "system-boot"
filesystem = "vfat"
size = "4M"
bootable = true

[[structure]]
name = "writable"
kind = "linux"
role = "system-data"
filesystem = "ext4"
label = "rootfs"
size = "8M"
"#;

fn boot_code() -> Vec<u8> {
    (0..440u32).map(|i| (i % 251) as u8).collect()
}

fn snap_bundle(root: &Path, layout: &str) -> PathBuf {
    let bundle = root.join("bundle");
    fs::create_dir_all(bundle.join("meta")).expect("meta dir");
    fs::create_dir_all(bundle.join("content")).expect("content dir");
    fs::create_dir_all(bundle.join("rootfs/etc")).expect("rootfs dir");
    fs::write(bundle.join("meta/layout.toml"), layout).expect("layout");
    fs::write(bundle.join("content/pc-boot.img"), boot_code()).expect("boot code");
    fs::write(bundle.join("content/grubx64.efi"), b"grub").expect("grub");
    fs::write(bundle.join("rootfs/etc/hostname"), b"pc\n").expect("hostname");
    bundle
}

fn snap_config(root: &Path) -> BuildConfig {
    let bundle = snap_bundle(root, SNAP_LAYOUT);
    let mut config = BuildConfig::new(
        BuildMode::Snap(SnapOptions { bundle }),
        root.join("out/pc.img"),
    );
    config.architecture = "x86_64".into();
    config.workdir = Some(root.join("work"));
    config
}

fn classic_config(root: &Path) -> BuildConfig {
    let gadget = root.join("gadget");
    fs::create_dir_all(&gadget).expect("gadget dir");
    fs::write(gadget.join("layout.toml"), CLASSIC_LAYOUT).expect("layout");
    let hook = gadget.join("99-motd.sh");
    fs::write(&hook, "#!/bin/sh\n").expect("hook");

    let mut opts = ClassicOptions::new(gadget.join("layout.toml"), "noble");
    opts.extra_packages = vec!["linux-image-generic".into()];
    opts.hooks = vec![hook];
    opts.hostname = Some("forge".into());

    let mut config = BuildConfig::new(BuildMode::Classic(opts), root.join("out/pc.img"));
    config.architecture = "x86_64".into();
    config.workdir = Some(root.join("work"));
    config
}

fn machine(config: BuildConfig, runner: &FakeRunner, reporter: &RecordingReporter) -> StateMachine {
    StateMachine::with_collaborators(config, Box::new(runner.clone()), Box::new(reporter.clone()))
}

fn read_manifest(config: &BuildConfig) -> Manifest {
    let bytes = fs::read(config.manifest_path()).expect("manifest exists");
    serde_json::from_slice(&bytes).expect("manifest parses")
}

fn artifact_names(manifest: &Manifest) -> BTreeSet<String> {
    manifest.artifacts.iter().map(|a| a.name.clone()).collect()
}

fn fake_debootstrap(runner: &FakeRunner) {
    runner.on_run("debootstrap", |cmd| {
        let chroot = PathBuf::from(&cmd.args[cmd.args.len() - 2]);
        fs::create_dir_all(chroot.join("etc"))?;
        fs::write(chroot.join("etc/os-release"), "ID=ubuntu\n")?;
        fs::create_dir_all(chroot.join("usr/lib/grub/x86_64-efi"))?;
        Ok(())
    });
}

/// Emulate the filesystem tools by writing a listing of the staged tree
/// into the image, so the image content depends on what was staged.
fn fake_filesystems(runner: &FakeRunner) {
    fn listing(dir: &Path, rel: &Path, out: &mut Vec<u8>) -> std::io::Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let rel = rel.join(entry.file_name());
            out.extend_from_slice(rel.to_string_lossy().as_bytes());
            out.push(b'\n');
            if entry.file_type()?.is_dir() {
                listing(&entry.path(), &rel, out)?;
            } else {
                out.extend(fs::read(entry.path())?);
            }
        }
        Ok(())
    }
    fn stamp(image: &Path, staged: &[PathBuf]) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        for path in staged {
            if path.is_dir() {
                listing(path, Path::new(""), &mut bytes)?;
            } else {
                bytes.extend(fs::read(path)?);
            }
        }
        let mut image = fs::OpenOptions::new().write(true).open(image)?;
        std::io::Write::write_all(&mut image, &bytes)?;
        Ok(())
    }
    runner.on_run("mkfs.ext4", |cmd: &ToolCommand| {
        let n = cmd.args.len();
        stamp(Path::new(&cmd.args[n - 1]), &[PathBuf::from(&cmd.args[n - 2])])
    });
    runner.on_run("mcopy", |cmd: &ToolCommand| {
        let n = cmd.args.len();
        let staged: Vec<PathBuf> = cmd.args[4..n - 1].iter().map(PathBuf::from).collect();
        stamp(Path::new(&cmd.args[3]), &staged)
    });
}

/// Manifest with the fields that legitimately differ between two builds of
/// the same inputs blanked out: the timestamp and the workspace location.
fn comparable(mut manifest: Manifest, root: &Path) -> Manifest {
    manifest.created_at.clear();
    for artifact in &mut manifest.artifacts {
        if let Ok(rel) = artifact.path.strip_prefix(root) {
            artifact.path = rel.to_path_buf();
        }
    }
    manifest
}

#[test]
fn snap_build_runs_every_step_and_cleans_up() {
    let temp = TempDir::new().expect("temp dir");
    let config = snap_config(temp.path());
    let runner = FakeRunner::new();
    let reporter = RecordingReporter::new();

    let mut m = machine(config.clone(), &runner, &reporter);
    m.execute().expect("build");
    assert_eq!(m.status(), &MachineState::Completed);
    assert_eq!(reporter.started(), m.step_names());

    let meta = fs::metadata(&config.output).expect("image exists");
    assert_eq!(meta.len(), 14 * MIB);
    assert_eq!(read_region(&config.output, 0, 440).expect("mbr"), boot_code());

    let manifest = read_manifest(&config);
    assert_eq!(manifest.volume, "pc");
    assert_eq!(manifest.structures.len(), 3);
    assert_eq!(
        artifact_names(&manifest),
        ["bundle", "disk-image", "layout", "structures"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>()
    );
    let disk = manifest
        .artifacts
        .iter()
        .find(|a| a.name == "disk-image")
        .expect("disk entry");
    assert_eq!(disk.size, 14 * MIB);
    assert!(disk.sha256.is_some());

    assert_eq!(runner.programs(), vec!["mkfs.vfat", "mcopy", "mkfs.ext4"]);

    let work = temp.path().join("work");
    assert!(!StateFile::in_workspace(&work).exists());
    assert!(!work.join("unpack").exists());
    assert!(!work.join("structures").exists());
}

#[test]
fn classic_build_runs_every_step() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = classic_config(temp.path());
    config.run.preserve_artifacts = true;
    let runner = FakeRunner::new();
    fake_debootstrap(&runner);
    let reporter = RecordingReporter::new();

    let mut m = machine(config.clone(), &runner, &reporter);
    m.execute().expect("build");
    assert_eq!(m.status(), &MachineState::Completed);
    assert_eq!(reporter.started(), m.step_names());

    let BuildMode::Classic(opts) = &config.mode else {
        unreachable!()
    };
    let hook = opts.hooks[0].to_string_lossy().to_string();
    assert_eq!(
        runner.programs(),
        vec![
            "debootstrap",
            "chroot",
            "chroot",
            hook.as_str(),
            "mkfs.ext4",
            "grub-install",
            "mkfs.vfat",
            "mcopy",
        ]
    );
    let hook_call = &runner.calls()[3];
    assert!(hook_call.env.iter().any(|(k, _)| k == "IMAGE_ROOTFS"));

    let work = temp.path().join("work");
    assert_eq!(
        fs::read_to_string(work.join("chroot/etc/hostname")).expect("hostname"),
        "forge\n"
    );
    let stub = fs::read_to_string(work.join("structures/bootloader/boot/grub/grub.cfg"))
        .expect("grub stub");
    assert!(stub.contains("--label rootfs"));

    let manifest = read_manifest(&config);
    assert_eq!(
        artifact_names(&manifest),
        ["bootloader", "disk-image", "layout", "rootfs", "structures"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>()
    );
    // preserved: the record stays for inspection
    assert!(StateFile::in_workspace(&work).exists());
}

#[test]
fn failed_step_resumes_where_it_stopped() {
    let temp = TempDir::new().expect("temp dir");
    let config = snap_config(temp.path());
    let runner = FakeRunner::new();
    runner.fail_on("mkfs.ext4");
    let reporter = RecordingReporter::new();

    let mut first = machine(config.clone(), &runner, &reporter);
    let err = first.execute().expect_err("mkfs fails");
    assert_eq!(err.failed_step(), Some("populate_structures"));
    assert!(matches!(
        first.status(),
        MachineState::Failed { ordinal: 4, .. }
    ));

    let work = temp.path().join("work");
    let record = StateFile::in_workspace(&work).load().expect("record kept");
    assert_eq!(record.current_step_ordinal, 4);
    assert_eq!(
        record.completed_step_names,
        vec![
            "unpack_bundle",
            "load_layout",
            "create_disk_image",
            "partition_disk"
        ]
    );
    // the lock was released on teardown
    WorkspaceLock::acquire(&work)
        .expect("lock free")
        .release()
        .expect("release");

    runner.clear_failures();
    let mut config = config;
    config.run.resume = true;
    let resumed_reporter = RecordingReporter::new();
    let mut second = machine(config, &runner, &resumed_reporter);
    second.execute().expect("resumed build");
    assert_eq!(
        resumed_reporter.started(),
        vec![
            "populate_structures",
            "finalize",
            "generate_manifest",
            "compress_image"
        ]
    );
}

#[test]
fn paused_and_resumed_build_matches_uninterrupted_build() {
    let straight = TempDir::new().expect("temp dir");
    let mut straight_config = snap_config(straight.path());
    straight_config.run.preserve_artifacts = true;
    let runner = FakeRunner::new();
    fake_filesystems(&runner);
    machine(straight_config.clone(), &runner, &RecordingReporter::new())
        .execute()
        .expect("straight build");

    let paused = TempDir::new().expect("temp dir");
    let mut config = snap_config(paused.path());
    config.run.preserve_artifacts = true;
    config.run.until = Some("populate_structures".into());
    let runner = FakeRunner::new();
    fake_filesystems(&runner);
    let mut m = machine(config.clone(), &runner, &RecordingReporter::new());
    m.execute().expect("paused build");
    assert_eq!(m.status(), &MachineState::Paused { ordinal: 4 });
    assert!(StateFile::in_workspace(&paused.path().join("work")).exists());

    config.run.until = None;
    config.run.resume = true;
    machine(config.clone(), &runner, &RecordingReporter::new())
        .execute()
        .expect("resumed build");

    let a = read_manifest(&straight_config);
    let b = read_manifest(&config);
    for structure in &a.structures {
        let region = |image: &Path| {
            read_region(image, structure.offset, structure.size).expect("structure region")
        };
        assert_eq!(
            region(&straight_config.output),
            region(&config.output),
            "{} differs",
            structure.name
        );
    }
    // the staged files really reached the image
    let writable = a
        .structures
        .iter()
        .find(|s| s.name == "writable")
        .expect("writable");
    let head = read_region(&straight_config.output, writable.offset, 64).expect("writable");
    assert!(head.iter().any(|b| *b != 0));

    assert_eq!(
        fs::read(&straight_config.output).expect("straight image"),
        fs::read(&config.output).expect("resumed image")
    );
    assert_eq!(
        comparable(a, straight.path()),
        comparable(b, paused.path())
    );
}

#[test]
fn resume_needs_only_the_workspace() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.run.thru = Some("partition_disk".into());
    machine(config.clone(), &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect("paused build");

    let work = temp.path().join("work");
    let saved = StateFile::in_workspace(&work)
        .resume_config()
        .expect("config from record");
    assert_eq!(saved.mode, config.mode);
    assert_eq!(saved.output, config.output);
    assert!(saved.run.resume);
    assert!(saved.run.thru.is_none());

    let reporter = RecordingReporter::new();
    let mut m = machine(saved, &FakeRunner::new(), &reporter);
    m.execute().expect("resumed build");
    assert_eq!(m.status(), &MachineState::Completed);
    assert_eq!(reporter.started()[0], "populate_structures");
    assert!(config.manifest_path().exists());

    let empty = temp.path().join("empty");
    fs::create_dir_all(&empty).expect("empty workspace");
    let err = StateFile::in_workspace(&empty)
        .resume_config()
        .expect_err("nothing saved");
    assert!(matches!(err, BuildError::Config(_)));
}

#[test]
fn cleanup_failure_after_completed_build_is_reported() {
    let temp = TempDir::new().expect("temp dir");
    let config = snap_config(temp.path());
    let mut m = machine(config, &FakeRunner::new(), &RecordingReporter::new());
    m.setup().expect("setup");
    m.run().expect("run");
    assert_eq!(m.status(), &MachineState::Completed);

    // a directory where the state record should be cannot be unlinked
    let work = temp.path().join("work");
    let state = StateFile::in_workspace(&work);
    fs::remove_file(state.path()).expect("remove record");
    fs::create_dir_all(state.path().join("pinned")).expect("block record path");

    let err = m.teardown().expect_err("cleanup fails");
    assert!(matches!(err, BuildError::Cleanup { ref path, .. } if path == state.path()));
    // the lock is released regardless
    WorkspaceLock::acquire(&work)
        .expect("lock free")
        .release()
        .expect("release");
}

#[test]
fn malformed_sizes_are_config_errors_before_any_workspace() {
    for size in ["8é", "0xffffffffffffffff"] {
        let temp = TempDir::new().expect("temp dir");
        let layout = SNAP_LAYOUT.replace(r#"size = "8M""#, &format!(r#"size = "{size}""#));
        let bundle = snap_bundle(temp.path(), &layout);
        let mut config = BuildConfig::new(
            BuildMode::Snap(SnapOptions { bundle }),
            temp.path().join("out/pc.img"),
        );
        config.architecture = "x86_64".into();
        config.workdir = Some(temp.path().join("work"));

        let err = machine(config, &FakeRunner::new(), &RecordingReporter::new())
            .setup()
            .expect_err("bad size");
        assert!(matches!(err, BuildError::Config(_)), "{size}: {err}");
        assert!(!temp.path().join("work").exists());
    }
}

#[test]
fn thru_stops_after_the_named_step() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.run.thru = Some("partition_disk".into());
    let reporter = RecordingReporter::new();

    let mut m = machine(config.clone(), &FakeRunner::new(), &reporter);
    m.execute().expect("partial build");
    assert_eq!(m.status(), &MachineState::Paused { ordinal: 4 });
    assert_eq!(reporter.started().last().map(String::as_str), Some("partition_disk"));
    assert!(config.output.exists());
    assert!(!config.manifest_path().exists());
}

#[test]
fn second_setup_on_a_live_workspace_is_busy() {
    let temp = TempDir::new().expect("temp dir");
    let config = snap_config(temp.path());
    let runner = FakeRunner::new();

    let mut first = machine(config.clone(), &runner, &RecordingReporter::new());
    first.setup().expect("first setup");

    let mut second = machine(config, &runner, &RecordingReporter::new());
    assert!(matches!(second.setup(), Err(BuildError::WorkspaceBusy(_))));

    assert_eq!(first.status(), &MachineState::Running { ordinal: 0 });
    first.run().expect("first run");
    first.teardown().expect("first teardown");
    assert_eq!(first.status(), &MachineState::Completed);
}

#[test]
fn overlapping_layout_fails_before_any_image_exists() {
    let temp = TempDir::new().expect("temp dir");
    let bundle = snap_bundle(
        temp.path(),
        r#"
            name = "broken"

            [[structure]]
            name = "a"
            kind = "linux"
            filesystem = "ext4"
            offset = "1M"
            size = "4M"
            bootable = true

            [[structure]]
            name = "b"
            kind = "linux"
            filesystem = "ext4"
            offset = "2M"
            size = "4M"
        "#,
    );
    let mut config = BuildConfig::new(
        BuildMode::Snap(SnapOptions { bundle }),
        temp.path().join("out/broken.img"),
    );
    config.architecture = "x86_64".into();
    config.workdir = Some(temp.path().join("work"));

    let runner = FakeRunner::new();
    let err = machine(config.clone(), &runner, &RecordingReporter::new())
        .execute()
        .expect_err("overlap");
    assert!(matches!(err, BuildError::Config(_)));
    assert!(!config.output.exists());
    assert!(!temp.path().join("work").exists());
    assert!(runner.calls().is_empty());
}

#[test]
fn resume_with_different_output_is_rejected() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.run.until = Some("create_disk_image".into());
    machine(config.clone(), &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect("paused build");

    config.run.until = None;
    config.run.resume = true;
    config.output = temp.path().join("out/other.img");
    let err = machine(config, &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect_err("drift");
    assert!(matches!(err, BuildError::Config(_)));

    let record = StateFile::in_workspace(&temp.path().join("work"))
        .load()
        .expect("record untouched");
    assert_eq!(record.current_step_ordinal, 2);
}

#[test]
fn resume_refuses_damaged_state() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.run.until = Some("partition_disk".into());
    machine(config.clone(), &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect("paused build");

    let state = StateFile::in_workspace(&temp.path().join("work"));
    fs::write(state.path(), b"{\"schemaVersion\": 1, \"buildMode\": ").expect("damage");

    config.run.until = None;
    config.run.resume = true;
    let err = machine(config.clone(), &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect_err("corrupt");
    assert!(matches!(err, BuildError::CorruptState { .. }));

    fs::write(state.path(), b"{\"schemaVersion\": 7}").expect("future version");
    let err = machine(config, &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect_err("version");
    assert!(matches!(err, BuildError::StateVersion { found: 7, .. }));
}

#[test]
fn stale_state_is_discarded_without_resume() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.run.until = Some("populate_structures".into());
    machine(config.clone(), &FakeRunner::new(), &RecordingReporter::new())
        .execute()
        .expect("paused build");

    config.run.until = None;
    let reporter = RecordingReporter::new();
    machine(config.clone(), &FakeRunner::new(), &reporter)
        .execute()
        .expect("fresh build");
    assert_eq!(reporter.started().len(), 8);
    assert_eq!(reporter.started()[0], "unpack_bundle");
}

#[test]
fn compression_replaces_raw_image() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.compression = Compression::Xz;
    let runner = FakeRunner::new();
    runner.on_run("xz", |cmd| {
        let raw = PathBuf::from(cmd.args.last().expect("image argument"));
        fs::copy(&raw, raw.with_extension("img.xz"))?;
        fs::remove_file(&raw)?;
        Ok(())
    });

    machine(config.clone(), &runner, &RecordingReporter::new())
        .execute()
        .expect("build");

    let xz = runner
        .calls()
        .into_iter()
        .find(|c| c.program == "xz")
        .expect("xz ran");
    assert!(xz.has_arg("-T0"));
    assert!(!config.output.exists());
    assert!(config.compressed_output().expect("xz path").exists());
    // the manifest is written before compression
    assert!(!artifact_names(&read_manifest(&config)).contains("compressed-image"));
}

fn temp_workspaces() -> usize {
    fs::read_dir(std::env::temp_dir())
        .expect("temp dir readable")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("imgforge-"))
        .count()
}

#[test]
#[serial]
fn temporary_workspace_is_removed_after_success() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.workdir = None;
    let before = temp_workspaces();

    let mut m = machine(config.clone(), &FakeRunner::new(), &RecordingReporter::new());
    m.execute().expect("build");
    let dir = m.workspace().expect("workspace").to_path_buf();
    assert!(!dir.exists());
    assert_eq!(temp_workspaces(), before);
    assert!(config.output.exists());
}

#[test]
#[serial]
fn temporary_workspace_is_kept_after_failure() {
    let temp = TempDir::new().expect("temp dir");
    let mut config = snap_config(temp.path());
    config.workdir = None;
    let runner = FakeRunner::new();
    runner.fail_on("mkfs.vfat");

    let mut m = machine(config, &runner, &RecordingReporter::new());
    m.execute().expect_err("mkfs fails");
    let dir = m.workspace().expect("workspace").to_path_buf();
    assert!(StateFile::in_workspace(&dir).exists());
    fs::remove_dir_all(dir).expect("cleanup");
}
