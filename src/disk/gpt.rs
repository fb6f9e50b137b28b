use anyhow::{anyhow, bail, Context, Result};
use gpt::{disk::LogicalBlockSize, mbr::ProtectiveMBR, partition_types, GptConfig};
use sha2::{Digest, Sha256};
use std::{fs::File, path::Path};
use uuid::Uuid;

use super::types::PartitionInfo;
use crate::layout::{StructureKind, Volume};

pub fn logical_block_size(sector_size: u64) -> Result<LogicalBlockSize> {
    match sector_size {
        512 => Ok(LogicalBlockSize::Lb512),
        4096 => Ok(LogicalBlockSize::Lb4096),
        other => bail!("unsupported sector size {other}"),
    }
}

pub fn open_gpt(disk: &Path, sector_size: u64, writable: bool) -> Result<gpt::GptDisk<File>> {
    GptConfig::new()
        .writable(writable)
        .logical_block_size(logical_block_size(sector_size)?)
        .open(disk)
        .map_err(|e| anyhow!("failed to open GPT: {e}"))
}

pub fn map_partitions(gdisk: &gpt::GptDisk<File>, sector_size: u64) -> Result<Vec<PartitionInfo>> {
    let lb = logical_block_size(sector_size)?;
    let mut out = Vec::new();
    for (idx, part) in gdisk.partitions().iter() {
        if !part.is_used() {
            continue;
        }
        let start = part
            .bytes_start(lb)
            .map_err(|e| anyhow!("invalid partition start: {e}"))?;
        let size = part
            .bytes_len(lb)
            .map_err(|e| anyhow!("invalid partition size: {e}"))?;
        out.push(PartitionInfo {
            index: *idx,
            name: part.name.clone(),
            first_lba: part.first_lba,
            last_lba: part.last_lba,
            start_bytes: start,
            size_bytes: size,
        });
    }
    out.sort_by_key(|p| p.index);
    Ok(out)
}

/// Version 4 style GUID derived from `seed` and `name`, so the same build
/// always writes the same table.
pub fn stable_guid(seed: &str, name: &str) -> Uuid {
    let digest = Sha256::new()
        .chain_update(seed.as_bytes())
        .chain_update([0u8])
        .chain_update(name.as_bytes())
        .finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Write a fresh protective MBR and GPT describing every partition structure
/// of `volume`. Any previous table on the image is replaced. Disk and
/// partition GUIDs are derived from `seed`.
pub fn write_partition_table(
    disk: &Path,
    volume: &Volume,
    seed: &str,
) -> Result<Vec<PartitionInfo>> {
    let sector = volume.sector_size;
    let disk_size = std::fs::metadata(disk)
        .map_err(|e| anyhow!("failed to stat disk {}: {e}", disk.display()))?
        .len();
    if disk_size < volume.size {
        bail!(
            "disk {} is {disk_size} bytes, volume needs {}",
            disk.display(),
            volume.size
        );
    }

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(disk)
        .map_err(|e| anyhow!("failed to open disk {}: {e}", disk.display()))?;

    let total_lba = disk_size / sector;
    let mbr = ProtectiveMBR::with_lb_size(u32::try_from(total_lba - 1).unwrap_or(u32::MAX));
    mbr.overwrite_lba0(&mut file)
        .map_err(|e| anyhow!("failed to write protective MBR: {e:?}"))?;

    let mut gdisk = GptConfig::new()
        .writable(true)
        .logical_block_size(logical_block_size(sector)?)
        .create_from_device(file, Some(stable_guid(seed, "")))
        .map_err(|e| anyhow!("failed to create GPT: {e}"))?;

    let header = gdisk.header();
    let usable_start_lba = header.first_usable;
    let usable_last_lba = header.last_usable;

    let mut part_id: u32 = 1;
    for structure in volume.partitions() {
        let start_lba = structure.offset / sector;
        let size_lba = structure.size / sector;
        if start_lba < usable_start_lba {
            bail!("partition {} starts before the usable LBA range", structure.name);
        }
        if start_lba + size_lba - 1 > usable_last_lba {
            bail!("partition {} exceeds usable LBA range", structure.name);
        }

        let part_type = match structure.kind {
            StructureKind::Esp => partition_types::EFI,
            StructureKind::BiosBoot => partition_types::BIOS,
            _ => partition_types::LINUX_FS,
        };

        debug!(
            "partition {part_id}: {} lba {start_lba}+{size_lba}",
            structure.name
        );
        gdisk
            .add_partition_at(&structure.name, part_id, start_lba, size_lba, part_type, 0)
            .map_err(|e| anyhow!("failed to add partition {}: {e}", structure.name))?;

        part_id = part_id.saturating_add(1);
    }

    let mut parts = gdisk.partitions().clone();
    for part in parts.values_mut() {
        part.part_guid = stable_guid(seed, &part.name);
    }
    gdisk
        .update_partitions(parts)
        .map_err(|e| anyhow!("failed to set partition GUIDs: {e}"))?;

    let partitions = map_partitions(&gdisk, sector)?;
    let mut file = gdisk
        .write()
        .map_err(|e| anyhow!("failed to write GPT: {e}"))?;
    std::io::Write::flush(&mut file).context("failed to flush partition table")?;
    file.sync_all().context("failed to sync partition table")?;
    Ok(partitions)
}
