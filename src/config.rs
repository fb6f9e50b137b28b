use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};

pub const CONFIG_FILE: &str = ".imgforge.toml";
pub const DEFAULT_MIRROR: &str = "http://archive.ubuntu.com/ubuntu/";
pub const SECTOR_SIZES: [u64; 2] = [512, 4096];

/// Project-level defaults read from `.imgforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                path.display()
            );
        }

        fs::write(path, Self::generate_full_config()?)?;

        info!("Configuration file generated: {}", path.display());
        info!("Command line arguments override every value in this file");
        Ok(())
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let config = AppConfig {
            defaults: Some(Defaults {
                sector_size: Some(512),
                compression: Some(Compression::None),
                architecture: Some(host_architecture()),
                mirror: Some(DEFAULT_MIRROR.to_string()),
            }),
        };
        let toml_content = toml::to_string_pretty(&config)?;
        Ok(format!(
            "# imgforge configuration file\n# All fields are optional, command line arguments override config file values\n\n{}",
            toml_content
        ))
    }

    pub fn defaults(&self) -> Defaults {
        self.defaults.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Snap,
    Classic,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snap => write!(f, "snap"),
            Self::Classic => write!(f, "classic"),
        }
    }
}

/// Build mode together with the options only that mode understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildMode {
    Snap(SnapOptions),
    Classic(ClassicOptions),
}

impl BuildMode {
    pub fn image_type(&self) -> ImageType {
        match self {
            Self::Snap(_) => ImageType::Snap,
            Self::Classic(_) => ImageType::Classic,
        }
    }

    /// The layout description a run was started from. For snap builds the
    /// layout ships inside the bundle, so the bundle stands in for it.
    pub fn layout_description(&self) -> &Path {
        match self {
            Self::Snap(opts) => &opts.bundle,
            Self::Classic(opts) => &opts.layout,
        }
    }
}

/// A prepared bundle: `meta/layout.toml`, gadget `content/` and an optional
/// `rootfs/` tree for the system-data structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapOptions {
    pub bundle: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassicOptions {
    /// Layout file; content sources resolve relative to its directory.
    pub layout: PathBuf,
    pub suite: String,
    pub mirror: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub extra_packages: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<PathBuf>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl ClassicOptions {
    pub fn new(layout: impl Into<PathBuf>, suite: impl Into<String>) -> Self {
        Self {
            layout: layout.into(),
            suite: suite.into(),
            mirror: DEFAULT_MIRROR.to_string(),
            components: vec!["main".to_string()],
            extra_packages: Vec::new(),
            hooks: Vec::new(),
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Xz,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Xz => Some("xz"),
            Self::Gzip => Some("gz"),
            Self::Zstd => Some("zst"),
        }
    }
}

/// Per-invocation knobs. These are never part of the saved snapshot since
/// they legitimately change between a paused run and its resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunControl {
    pub resume: bool,
    pub preserve_artifacts: bool,
    /// Stop before this step.
    pub until: Option<String>,
    /// Stop after this step.
    pub thru: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildConfig {
    pub mode: BuildMode,
    pub output: PathBuf,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub image_size: Option<u64>,
    pub sector_size: u64,
    pub architecture: String,
    #[serde(default)]
    pub compression: Compression,
    #[serde(skip)]
    pub run: RunControl,
}

impl BuildConfig {
    pub fn new(mode: BuildMode, output: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            output: output.into(),
            workdir: None,
            image_size: None,
            sector_size: 512,
            architecture: host_architecture(),
            compression: Compression::None,
            run: RunControl::default(),
        }
    }

    pub fn image_type(&self) -> ImageType {
        self.mode.image_type()
    }

    /// Checks everything that can be checked without touching the workspace.
    pub fn validate(&self) -> BuildResult<()> {
        if !SECTOR_SIZES.contains(&self.sector_size) {
            return Err(BuildError::config(format!(
                "sector size must be 512 or 4096, got {}",
                self.sector_size
            )));
        }
        if self.output.file_name().is_none() || self.output.is_dir() {
            return Err(BuildError::config(format!(
                "output {} must name an image file",
                self.output.display()
            )));
        }
        if debian_arch(&self.architecture).is_none() {
            return Err(BuildError::config(format!(
                "unsupported architecture {}",
                self.architecture
            )));
        }
        if self.run.until.is_some() && self.run.thru.is_some() {
            return Err(BuildError::config("--until and --thru are mutually exclusive"));
        }
        let needs_workdir =
            self.run.resume || self.run.until.is_some() || self.run.thru.is_some();
        if needs_workdir && self.workdir.is_none() {
            return Err(BuildError::config(
                "--resume, --until and --thru need an explicit --workdir",
            ));
        }

        match &self.mode {
            BuildMode::Snap(opts) => {
                if !opts.bundle.is_dir() {
                    return Err(BuildError::config(format!(
                        "bundle {} is not a directory",
                        opts.bundle.display()
                    )));
                }
            }
            BuildMode::Classic(opts) => {
                if !opts.layout.is_file() {
                    return Err(BuildError::config(format!(
                        "layout {} does not exist",
                        opts.layout.display()
                    )));
                }
                if opts.suite.trim().is_empty() {
                    return Err(BuildError::config("classic builds need a suite"));
                }
                if let Some(hook) = opts.hooks.iter().find(|h| !h.is_file()) {
                    return Err(BuildError::config(format!(
                        "customization hook {} does not exist",
                        hook.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rejects a resume whose immutable inputs differ from the saved run.
    pub fn check_resumable_from(&self, snapshot: &BuildConfig) -> BuildResult<()> {
        if self.image_type() != snapshot.image_type() {
            return Err(BuildError::config(format!(
                "saved run is a {} build, this invocation is a {} build",
                snapshot.image_type(),
                self.image_type()
            )));
        }
        if !same_path(&self.output, &snapshot.output) {
            return Err(BuildError::config(format!(
                "saved run writes {}, this invocation writes {}",
                snapshot.output.display(),
                self.output.display()
            )));
        }
        let (ours, theirs) = (
            self.mode.layout_description(),
            snapshot.mode.layout_description(),
        );
        if !same_path(ours, theirs) {
            return Err(BuildError::config(format!(
                "saved run uses layout {}, this invocation uses {}",
                theirs.display(),
                ours.display()
            )));
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        self.output.with_file_name(format!("{stem}.manifest.json"))
    }

    pub fn compressed_output(&self) -> Option<PathBuf> {
        let ext = self.compression.extension()?;
        let mut name = self.output.file_name()?.to_os_string();
        name.push(".");
        name.push(ext);
        Some(self.output.with_file_name(name))
    }

    /// Apply `.imgforge.toml` defaults to fields the caller left unset.
    pub fn apply_defaults(&mut self, defaults: &Defaults) {
        if let Some(sector_size) = defaults.sector_size {
            self.sector_size = sector_size;
        }
        if let Some(compression) = defaults.compression {
            self.compression = compression;
        }
        if let Some(arch) = &defaults.architecture {
            self.architecture = normalize_arch(arch);
        }
        if let (BuildMode::Classic(opts), Some(mirror)) = (&mut self.mode, &defaults.mirror) {
            opts.mirror = mirror.clone();
        }
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::path::absolute(a), std::path::absolute(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

pub fn host_architecture() -> String {
    normalize_arch(std::env::consts::ARCH)
}

/// Map Debian-style names onto the kernel ones used throughout the crate.
pub fn normalize_arch(arch: &str) -> String {
    match arch.trim() {
        "amd64" => "x86_64".to_string(),
        "arm64" => "aarch64".to_string(),
        "armhf" => "arm".to_string(),
        other => other.to_string(),
    }
}

pub fn debian_arch(arch: &str) -> Option<&'static str> {
    match normalize_arch(arch).as_str() {
        "x86_64" => Some("amd64"),
        "aarch64" => Some("arm64"),
        "arm" => Some("armhf"),
        "riscv64" => Some("riscv64"),
        "powerpc64" => Some("ppc64el"),
        "s390x" => Some("s390x"),
        _ => None,
    }
}
