//! Volume layout model.
//!
//! A layout description is a TOML file naming the structures (partitions and
//! raw regions) of a single disk volume:
//!
//! ```toml
//! name = "pc"
//! bootloader = "grub"
//!
//! [[structure]]
//! name = "mbr"
//! kind = "mbr"
//! size = "440"
//! content = [{ image = "pc-boot.img" }]
//!
//! [[structure]]
//! name = "EFI System"
//! kind = "esp"
//! role = "system-boot"
//! filesystem = "vfat"
//! size = "256M"
//! bootable = true
//! content = [{ source = "grubx64.efi", target = "EFI/boot/grubx64.efi" }]
//!
//! [[structure]]
//! name = "writable"
//! kind = "linux"
//! role = "system-data"
//! filesystem = "ext4"
//! size = "2G"
//! ```
//!
//! [`resolve`] turns the description into a [`Volume`] with concrete offsets
//! and rejects anything that would produce a broken image.

mod resolve;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};

pub use resolve::{gpt_reserve, resolve, ResolveOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    Grub,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureKind {
    /// Boot code in the first 440 bytes of the disk, outside the partition table.
    Mbr,
    /// A raw region that is not listed in the partition table.
    Bare,
    BiosBoot,
    Esp,
    Linux,
}

impl StructureKind {
    pub fn is_partition(&self) -> bool {
        matches!(self, Self::BiosBoot | Self::Esp | Self::Linux)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    SystemBoot,
    SystemData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Filesystem {
    #[default]
    None,
    Vfat,
    Ext4,
}

/// Layout file as written by the user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LayoutDescription {
    pub name: String,
    #[serde(default)]
    pub bootloader: Bootloader,
    #[serde(rename = "structure", default)]
    pub structures: Vec<StructureDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StructureDescription {
    pub name: String,
    pub kind: StructureKind,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub filesystem: Filesystem,
    #[serde(default)]
    pub label: Option<String>,
    pub size: String,
    #[serde(default)]
    pub offset: Option<String>,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub content: Vec<ContentDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContentDescription {
    Image {
        image: PathBuf,
        #[serde(default)]
        offset: Option<String>,
    },
    File {
        source: PathBuf,
        target: String,
    },
}

/// A fully resolved volume: every structure has a concrete offset and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub bootloader: Bootloader,
    pub sector_size: u64,
    /// Total image size in bytes, backup GPT included.
    pub size: u64,
    pub structures: Vec<Structure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Position in the layout description.
    pub index: usize,
    pub name: String,
    pub kind: StructureKind,
    pub role: Option<Role>,
    pub filesystem: Filesystem,
    pub label: Option<String>,
    pub offset: u64,
    pub size: u64,
    pub bootable: bool,
    pub content: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Content {
    /// Raw bytes written at `offset` within the structure.
    Image { path: PathBuf, offset: u64 },
    /// A file or directory copied into the structure's filesystem.
    File { source: PathBuf, target: String },
}

impl Structure {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn is_system_data(&self) -> bool {
        self.role == Some(Role::SystemData)
    }

    pub fn is_system_boot(&self) -> bool {
        self.role == Some(Role::SystemBoot)
    }

    pub fn label_or_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

impl Volume {
    pub fn partitions(&self) -> impl Iterator<Item = &Structure> {
        self.structures.iter().filter(|s| s.kind.is_partition())
    }

    pub fn system_data(&self) -> Option<&Structure> {
        self.structures.iter().find(|s| s.is_system_data())
    }

    pub fn system_boot(&self) -> Option<&Structure> {
        self.structures.iter().find(|s| s.is_system_boot())
    }
}

pub fn load_description(path: &Path) -> BuildResult<LayoutDescription> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        BuildError::config(format!("cannot read layout {}: {e}", path.display()))
    })?;
    toml::from_str(&text)
        .map_err(|e| BuildError::config(format!("cannot parse layout {}: {e}", path.display())))
}

/// Read, resolve and validate a layout file in one go.
pub fn load_volume(path: &Path, opts: &ResolveOptions<'_>) -> BuildResult<Volume> {
    let description = load_description(path)?;
    resolve(&description, opts)
}
