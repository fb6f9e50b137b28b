use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::{Compression, ImageType};
use crate::disk::gpt;
use crate::layout::{Filesystem, Role, StructureKind};
use crate::tools::ToolCommand;

use super::artifacts::{COMPRESSED_IMAGE, MANIFEST};
use super::common::disk_image;
use super::StepContext;

/// Check the image against the volume it was built from.
pub fn finalize(ctx: &mut StepContext<'_>) -> Result<()> {
    let disk = disk_image(ctx)?;
    let volume = ctx.state.volume()?;

    let len = std::fs::metadata(&disk)
        .with_context(|| format!("failed to stat {}", disk.display()))?
        .len();
    if len != volume.size {
        bail!(
            "{} is {len} bytes, expected {}",
            disk.display(),
            volume.size
        );
    }

    let gdisk = gpt::open_gpt(&disk, volume.sector_size, false)?;
    let table = gpt::map_partitions(&gdisk, volume.sector_size)?;
    let expected: Vec<_> = volume.partitions().collect();
    if table.len() != expected.len() {
        bail!(
            "partition table has {} entries, layout has {} partitions",
            table.len(),
            expected.len()
        );
    }
    for (part, structure) in table.iter().zip(expected) {
        if part.start_bytes != structure.offset || part.size_bytes != structure.size {
            bail!(
                "partition {} covers {}+{}, layout wants {}+{}",
                part.name,
                part.start_bytes,
                part.size_bytes,
                structure.offset,
                structure.size
            );
        }
    }
    info!("{} verified: {} partitions", disk.display(), table.len());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub image_type: ImageType,
    pub volume: String,
    pub architecture: String,
    pub size: u64,
    pub created_at: String,
    pub artifacts: Vec<ManifestArtifact>,
    pub structures: Vec<ManifestStructure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestArtifact {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStructure {
    pub name: String,
    pub kind: StructureKind,
    pub role: Option<Role>,
    pub filesystem: Filesystem,
    pub offset: u64,
    pub size: u64,
}

pub fn generate_manifest(ctx: &mut StepContext<'_>) -> Result<()> {
    let volume = ctx.state.volume()?;
    let mut artifacts = Vec::with_capacity(ctx.state.artifacts.len());
    for (name, path) in &ctx.state.artifacts {
        artifacts.push(describe_artifact(name, path)?);
    }

    let manifest = Manifest {
        image_type: ctx.config().image_type(),
        volume: volume.name.clone(),
        architecture: ctx.config().architecture.clone(),
        size: volume.size,
        created_at: chrono::Utc::now().to_rfc3339(),
        artifacts,
        structures: volume
            .structures
            .iter()
            .map(|s| ManifestStructure {
                name: s.name.clone(),
                kind: s.kind,
                role: s.role,
                filesystem: s.filesystem,
                offset: s.offset,
                size: s.size,
            })
            .collect(),
    };

    let path = ctx.config().manifest_path();
    write_atomic(&path, &serde_json::to_vec_pretty(&manifest)?)?;
    info!("wrote manifest {}", path.display());
    ctx.state.register_artifact(MANIFEST, path);
    Ok(())
}

fn describe_artifact(name: &str, path: &Path) -> Result<ManifestArtifact> {
    if path.is_dir() {
        let mut size = 0;
        let mut files = 0;
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                size += entry.metadata()?.len();
                files += 1;
            }
        }
        return Ok(ManifestArtifact {
            name: name.to_string(),
            path: path.to_path_buf(),
            kind: ArtifactKind::Dir,
            size,
            sha256: None,
            files: Some(files),
        });
    }
    let (sha, size) = sha256_file(path)?;
    Ok(ManifestArtifact {
        name: name.to_string(),
        path: path.to_path_buf(),
        kind: ArtifactKind::File,
        size,
        sha256: Some(sha),
        files: None,
    })
}

pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn compress_image(ctx: &mut StepContext<'_>) -> Result<()> {
    let compression = ctx.config().compression;
    let Some(target) = ctx.config().compressed_output() else {
        info!("compression disabled");
        return Ok(());
    };
    let disk = disk_image(ctx)?;

    // A previous attempt may have compressed the image and died before the
    // checkpoint; the tools remove their input.
    if !disk.exists() && target.exists() {
        info!("{} already compressed", disk.display());
        ctx.state.register_artifact(COMPRESSED_IMAGE, target);
        return Ok(());
    }

    let cmd = match compression {
        Compression::Xz => ToolCommand::new("xz").args(["-f", "-T0"]).arg(&disk),
        Compression::Gzip => ToolCommand::new("gzip").arg("-f").arg(&disk),
        Compression::Zstd => ToolCommand::new("zstd")
            .args(["-f", "-q", "--rm"])
            .arg(&disk)
            .arg("-o")
            .arg(&target),
        Compression::None => return Ok(()),
    };
    ctx.runner.run(&cmd).context("compression failed")?;
    info!("compressed image written to {}", target.display());
    ctx.state.register_artifact(COMPRESSED_IMAGE, target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sha256_of_known_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        let (sha, size) = sha256_file(&path).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn directories_are_counted_not_hashed() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/one"), b"12").unwrap();
        std::fs::write(temp.path().join("a/b/two"), b"345").unwrap();
        let entry = describe_artifact("structures", &temp.path().join("a")).unwrap();
        assert_eq!(entry.files, Some(2));
        assert_eq!(entry.size, 5);
        assert!(entry.sha256.is_none());
        assert_eq!(entry.kind, ArtifactKind::Dir);
    }

    #[test]
    fn atomic_write_replaces_target() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pc.manifest.json");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
