use std::collections::HashSet;
use std::path::Path;

use crate::config::normalize_arch;
use crate::disk::utils::{align_up, parse_size, MIB};
use crate::error::{BuildError, BuildResult};

use super::{
    Content, ContentDescription, Filesystem, LayoutDescription, Structure, StructureDescription,
    StructureKind, Volume,
};

const GPT_ENTRIES_BYTES: u64 = 128 * 128;
const MBR_BOOTCODE_MAX: u64 = 440;

pub struct ResolveOptions<'a> {
    pub sector_size: u64,
    pub architecture: &'a str,
    pub image_size: Option<u64>,
    /// Directory that relative content paths resolve against.
    pub content_root: &'a Path,
}

/// Bytes taken by the primary GPT (protective MBR, header, entries) and the
/// backup GPT (entries, header).
pub fn gpt_reserve(sector_size: u64) -> (u64, u64) {
    let entries = GPT_ENTRIES_BYTES.div_ceil(sector_size) * sector_size;
    (2 * sector_size + entries, entries + sector_size)
}

pub fn resolve(desc: &LayoutDescription, opts: &ResolveOptions<'_>) -> BuildResult<Volume> {
    if desc.structures.is_empty() {
        return Err(invalid(&desc.name, "layout has no structures"));
    }

    let sector = opts.sector_size;
    let (primary_reserve, backup_reserve) = gpt_reserve(sector);
    let mut names = HashSet::new();
    let mut structures = Vec::with_capacity(desc.structures.len());
    let mut cursor = primary_reserve;

    for (index, sd) in desc.structures.iter().enumerate() {
        if !names.insert(sd.name.as_str()) {
            return Err(invalid(&sd.name, "duplicate structure name"));
        }
        let size = parse_size(&sd.size).map_err(|e| invalid(&sd.name, e))?;
        if size == 0 {
            return Err(invalid(&sd.name, "size must be non-zero"));
        }

        let offset = match &sd.offset {
            Some(raw) => {
                let offset = parse_size(raw).map_err(|e| invalid(&sd.name, e))?;
                if !offset.is_multiple_of(sector) {
                    return Err(invalid(
                        &sd.name,
                        format!("offset {offset} is not aligned to {sector}-byte sectors"),
                    ));
                }
                offset
            }
            None if sd.kind == StructureKind::Mbr => 0,
            None => align_up(cursor, MIB)
                .ok_or_else(|| invalid(&sd.name, "offset past the end of the addressable disk"))?,
        };

        check_kind(sd, offset, size)?;

        let size = if sd.kind == StructureKind::Mbr {
            size
        } else {
            if offset < primary_reserve {
                return Err(invalid(
                    &sd.name,
                    format!("offset {offset} overlaps the partition table"),
                ));
            }
            align_up(size, sector).ok_or_else(|| invalid(&sd.name, "size too large"))?
        };
        let end = offset
            .checked_add(size)
            .ok_or_else(|| invalid(&sd.name, "offset plus size overflows"))?;
        if sd.kind != StructureKind::Mbr {
            cursor = end;
        }

        let content = resolve_content(sd, size, opts.content_root)?;
        structures.push(Structure {
            index,
            name: sd.name.clone(),
            kind: sd.kind,
            role: sd.role,
            filesystem: sd.filesystem,
            label: sd.label.clone(),
            offset,
            size,
            bootable: sd.bootable,
            content,
        });
    }

    check_overlaps(&structures)?;
    check_roles(&structures)?;
    check_bootable(desc, opts.architecture)?;

    let end = structures.iter().map(Structure::end).max().unwrap_or(0);
    let required = end
        .checked_add(backup_reserve)
        .and_then(|n| align_up(n, MIB))
        .ok_or_else(|| BuildError::config(format!("volume {} is too large", desc.name)))?;
    let size = match opts.image_size {
        Some(requested) if requested < required => {
            return Err(BuildError::config(format!(
                "image size {requested} is smaller than the {required} bytes volume {} needs",
                desc.name
            )));
        }
        Some(requested) => align_up(requested, sector).ok_or_else(|| {
            BuildError::config(format!("image size {requested} is too large"))
        })?,
        None => required,
    };

    Ok(Volume {
        name: desc.name.clone(),
        bootloader: desc.bootloader,
        sector_size: sector,
        size,
        structures,
    })
}

fn invalid(structure: &str, msg: impl std::fmt::Display) -> BuildError {
    BuildError::config(format!("structure \"{structure}\": {msg}"))
}

fn check_kind(sd: &StructureDescription, offset: u64, size: u64) -> BuildResult<()> {
    match sd.kind {
        StructureKind::Mbr => {
            if offset != 0 {
                return Err(invalid(&sd.name, "mbr structures must sit at offset 0"));
            }
            if size > MBR_BOOTCODE_MAX {
                return Err(invalid(
                    &sd.name,
                    format!("mbr structures hold at most {MBR_BOOTCODE_MAX} bytes"),
                ));
            }
            if sd.role.is_some() {
                return Err(invalid(&sd.name, "mbr structures cannot carry a role"));
            }
        }
        StructureKind::Esp if sd.filesystem != Filesystem::Vfat => {
            return Err(invalid(&sd.name, "esp structures must use vfat"));
        }
        _ => {}
    }
    if matches!(
        sd.kind,
        StructureKind::Mbr | StructureKind::Bare | StructureKind::BiosBoot
    ) && sd.filesystem != Filesystem::None
    {
        return Err(invalid(&sd.name, "raw structures cannot have a filesystem"));
    }
    if sd.role.is_some_and(|r| r == super::Role::SystemData) && sd.filesystem == Filesystem::None {
        return Err(invalid(&sd.name, "system-data needs a filesystem"));
    }
    Ok(())
}

fn resolve_content(
    sd: &StructureDescription,
    size: u64,
    content_root: &Path,
) -> BuildResult<Vec<Content>> {
    let mut out = Vec::with_capacity(sd.content.len());
    for item in &sd.content {
        match item {
            ContentDescription::Image { image, offset } => {
                if sd.filesystem != Filesystem::None {
                    return Err(invalid(
                        &sd.name,
                        "image content only fits raw structures, use source/target",
                    ));
                }
                let offset = match offset {
                    Some(raw) => parse_size(raw).map_err(|e| invalid(&sd.name, e))?,
                    None => 0,
                };
                let path = content_root.join(image);
                let len = readable_file_len(&path).map_err(|e| invalid(&sd.name, e))?;
                if offset.checked_add(len).is_none_or(|end| end > size) {
                    return Err(invalid(
                        &sd.name,
                        format!(
                            "{} ({len} bytes at offset {offset}) does not fit in {size} bytes",
                            image.display()
                        ),
                    ));
                }
                out.push(Content::Image {
                    path: image.clone(),
                    offset,
                });
            }
            ContentDescription::File { source, target } => {
                if sd.filesystem == Filesystem::None {
                    return Err(invalid(
                        &sd.name,
                        "source/target content needs a filesystem, use image",
                    ));
                }
                check_readable(&content_root.join(source)).map_err(|e| invalid(&sd.name, e))?;
                out.push(Content::File {
                    source: source.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    Ok(out)
}

fn readable_file_len(path: &Path) -> Result<u64, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("content {} is not readable: {e}", path.display()))?;
    let meta = file
        .metadata()
        .map_err(|e| format!("content {} is not readable: {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!("content {} is not a file", path.display()));
    }
    Ok(meta.len())
}

fn check_readable(path: &Path) -> Result<(), String> {
    if path.is_dir() {
        std::fs::read_dir(path)
            .map(|_| ())
            .map_err(|e| format!("content {} is not readable: {e}", path.display()))
    } else {
        readable_file_len(path).map(|_| ())
    }
}

fn check_overlaps(structures: &[Structure]) -> BuildResult<()> {
    let mut sorted: Vec<&Structure> = structures.iter().collect();
    sorted.sort_by_key(|s| (s.offset, s.end()));
    for pair in sorted.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b.offset < a.end() {
            return Err(BuildError::config(format!(
                "structures \"{}\" [{}, {}) and \"{}\" [{}, {}) overlap",
                a.name,
                a.offset,
                a.end(),
                b.name,
                b.offset,
                b.end()
            )));
        }
    }
    Ok(())
}

fn check_roles(structures: &[Structure]) -> BuildResult<()> {
    if structures.iter().filter(|s| s.is_system_data()).count() > 1 {
        return Err(BuildError::config("more than one system-data structure"));
    }
    if structures.iter().filter(|s| s.is_system_boot()).count() > 1 {
        return Err(BuildError::config("more than one system-boot structure"));
    }
    Ok(())
}

fn check_bootable(desc: &LayoutDescription, architecture: &str) -> BuildResult<()> {
    let arch = normalize_arch(architecture);
    let bootable = desc.structures.iter().any(|s| {
        s.bootable
            && (s.architectures.is_empty()
                || s.architectures.iter().any(|a| normalize_arch(a) == arch))
    });
    if bootable {
        Ok(())
    } else {
        Err(BuildError::config(format!(
            "volume {} has no bootable structure for {arch}",
            desc.name
        )))
    }
}
