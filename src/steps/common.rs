use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use walkdir::WalkDir;

use crate::disk::utils::{format_mib, slug};
use crate::disk::{self, gpt, io};
use crate::layout::{self, Content, Filesystem, ResolveOptions, Structure};
use crate::statemachine::variant::BuildVariant;
use crate::tools::ToolCommand;

use super::artifacts::{DISK_IMAGE, LAYOUT, STRUCTURES};
use super::StepContext;

pub const STRUCTURES_DIR: &str = "structures";

pub fn load_layout(ctx: &mut StepContext<'_>) -> Result<()> {
    let config = ctx.config();
    let sources = config.mode.staged_layout(ctx.workspace);
    let opts = ResolveOptions {
        sector_size: config.sector_size,
        architecture: &config.architecture,
        image_size: config.image_size,
        content_root: &sources.content_root,
    };
    let volume = layout::load_volume(&sources.layout_file, &opts)?;
    info!(
        "volume {}: {} structures, {}",
        volume.name,
        volume.structures.len(),
        format_mib(volume.size)
    );

    let resolved = ctx.workspace.join("layout.json");
    let json = serde_json::to_vec_pretty(&volume)?;
    fs::write(&resolved, json)
        .with_context(|| format!("failed to write {}", resolved.display()))?;

    ctx.state.volume = Some(volume);
    ctx.state.register_artifact(LAYOUT, resolved);
    Ok(())
}

pub fn create_disk_image(ctx: &mut StepContext<'_>) -> Result<()> {
    let output = ctx.config().output.clone();
    let size = ctx.state.volume()?.size;
    disk::create_image(&output, size)?;
    info!("created {} ({})", output.display(), format_mib(size));
    ctx.state.register_artifact(DISK_IMAGE, output);
    Ok(())
}

pub fn partition_disk(ctx: &mut StepContext<'_>) -> Result<()> {
    let disk = disk_image(ctx)?;
    let volume = ctx.state.volume()?;
    // the same inputs rebuilt anywhere produce the same GUIDs
    let seed = format!(
        "{}/{}/{}",
        volume.name,
        ctx.config().architecture,
        disk.file_name().unwrap_or_default().to_string_lossy()
    );
    let parts = gpt::write_partition_table(&disk, volume, &seed)?;
    for part in &parts {
        info!(
            "partition {} {}: {} at {}",
            part.index,
            part.name,
            format_mib(part.size_bytes),
            part.start_bytes
        );
    }
    Ok(())
}

pub fn disk_image(ctx: &StepContext<'_>) -> Result<PathBuf> {
    match ctx.state.artifact(DISK_IMAGE) {
        Some(path) => Ok(path.to_path_buf()),
        None => bail!("disk image has not been created yet"),
    }
}

/// Directory holding per-structure staging trees and filesystem images.
pub fn structures_dir(ctx: &mut StepContext<'_>) -> Result<PathBuf> {
    let dir = ctx.workspace.join(STRUCTURES_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    ctx.state.register_artifact(STRUCTURES, dir.clone());
    Ok(dir)
}

/// Write one structure into the disk image.
///
/// Raw structures get their content images written at the requested
/// offsets. Filesystem structures are staged into a directory, turned into
/// a filesystem image by the host tools, and copied into place. `tree`
/// seeds the staging directory; system-data passes the root filesystem here.
pub fn populate_structure(
    ctx: &StepContext<'_>,
    structure: &Structure,
    content_root: &Path,
    tree: Option<&Path>,
) -> Result<()> {
    let disk = disk_image(ctx)?;
    if structure.filesystem == Filesystem::None {
        return write_raw_content(&disk, structure, content_root);
    }

    let base = ctx.workspace.join(STRUCTURES_DIR);
    let name = slug(&structure.name);
    let staging = base.join(&name);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to clear {}", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    if let Some(tree) = tree {
        copy_tree(tree, &staging)?;
    }
    stage_content(structure, content_root, &staging)?;

    let image = base.join(format!("{name}.img"));
    build_filesystem(ctx, structure, &staging, &image)?;
    let written = io::write_file_at(&disk, structure.offset, structure.size, &image)?;
    info!(
        "wrote {} ({}) at offset {}",
        structure.name,
        format_mib(written),
        structure.offset
    );
    Ok(())
}

fn write_raw_content(disk: &Path, structure: &Structure, content_root: &Path) -> Result<()> {
    for content in &structure.content {
        if let Content::Image { path, offset } = content {
            let src = content_root.join(path);
            let room = structure.size.saturating_sub(*offset);
            let written = io::write_file_at(disk, structure.offset + offset, room, &src)
                .with_context(|| format!("failed to write content of {}", structure.name))?;
            debug!("{}: {} bytes of {}", structure.name, written, src.display());
        }
    }
    Ok(())
}

/// Copy `File` content entries into a staging tree. A target ending in `/`
/// names a directory the source is copied into.
pub fn stage_content(structure: &Structure, content_root: &Path, staging: &Path) -> Result<()> {
    for content in &structure.content {
        let Content::File { source, target } = content else {
            continue;
        };
        let src = content_root.join(source);
        let rel = target.trim_start_matches('/');
        let mut dest = staging.join(rel);
        if target.ends_with('/') || rel.is_empty() {
            if let Some(file_name) = src.file_name() {
                dest = dest.join(file_name);
            }
        }
        if src.is_dir() {
            copy_tree(&src, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest).with_context(|| {
                format!("failed to copy {} to {}", src.display(), dest.display())
            })?;
        }
    }
    Ok(())
}

fn build_filesystem(
    ctx: &StepContext<'_>,
    structure: &Structure,
    staging: &Path,
    image: &Path,
) -> Result<()> {
    disk::create_image(image, structure.size)?;
    let label = structure.label_or_name();
    match structure.filesystem {
        Filesystem::Ext4 => {
            ctx.runner.run(
                &ToolCommand::new("mkfs.ext4")
                    .args(["-F", "-q", "-L", label, "-d"])
                    .arg(staging)
                    .arg(image),
            )?;
        }
        Filesystem::Vfat => {
            ctx.runner.run(
                &ToolCommand::new("mkfs.vfat")
                    .arg("-n")
                    .arg(fat_label(label)?)
                    .arg(image),
            )?;
            let mut entries: Vec<PathBuf> = fs::read_dir(staging)?
                .map(|e| e.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            if !entries.is_empty() {
                entries.sort();
                ctx.runner.run(
                    &ToolCommand::new("mcopy")
                        .args(["-s", "-o", "-i"])
                        .arg(image)
                        .args(&entries)
                        .arg("::"),
                )?;
            }
        }
        Filesystem::None => {}
    }
    Ok(())
}

/// FAT volume labels are at most 11 characters and conventionally upper case.
pub fn fat_label(label: &str) -> Result<String> {
    let label = label.trim().to_ascii_uppercase();
    if label.is_empty() {
        bail!("FAT label cannot be empty");
    }
    if label.len() > 11 {
        bail!("FAT label {label} is longer than 11 characters");
    }
    Ok(label)
}

/// Recursively copy `src` into `dest`, keeping symlinks as symlinks.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("failed to link {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {}", entry.path().display())
            })?;
        }
    }
    Ok(())
}
