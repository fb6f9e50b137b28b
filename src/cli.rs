use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use imgforge::config::{self, AppConfig, BuildConfig, BuildMode, Compression, ImageType};
use imgforge::disk::utils::parse_size;
use imgforge::error::BuildResult;
use imgforge::statemachine::state::StateFile;

#[derive(Parser)]
#[command(name = "imgforge")]
#[command(about = "Build bootable disk images", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an image from a prepared bundle
    Snap {
        /// Bundle directory holding meta/layout.toml
        #[arg(value_name = "BUNDLE")]
        bundle: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Build an image from a freshly bootstrapped root filesystem
    Classic {
        /// Layout file; content paths resolve relative to it
        #[arg(value_name = "LAYOUT")]
        layout: PathBuf,

        /// Distribution suite to bootstrap
        #[arg(long)]
        suite: String,

        /// Package mirror
        #[arg(long)]
        mirror: Option<String>,

        /// Archive components, comma separated
        #[arg(long, value_delimiter = ',')]
        components: Vec<String>,

        /// Extra package to install (repeatable)
        #[arg(short = 'p', long = "package", value_name = "PACKAGE")]
        packages: Vec<String>,

        /// Customization hook run against the root filesystem (repeatable)
        #[arg(long = "hook", value_name = "PATH")]
        hooks: Vec<PathBuf>,

        /// Hostname written into the image
        #[arg(long)]
        hostname: Option<String>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Continue a saved run using only its workspace
    Resume {
        /// Workspace of the saved run
        #[arg(short, long, value_name = "DIR")]
        workdir: PathBuf,

        /// Compress the finished image
        #[arg(long, value_enum)]
        compression: Option<Compression>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List the steps of a build mode in execution order
    Steps {
        #[arg(value_enum)]
        image_type: ImageType,
    },

    /// Generate configuration file (.imgforge.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
pub struct CommonArgs {
    /// Image file to write
    #[arg(short = 'O', long, value_name = "IMAGE")]
    output: PathBuf,

    /// Workspace directory (a temporary one is used when omitted)
    #[arg(short, long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Fixed image size, e.g. 4G (defaults to what the layout needs)
    #[arg(long, value_parser = parse_size_arg)]
    image_size: Option<u64>,

    /// Logical sector size, 512 or 4096
    #[arg(long)]
    sector_size: Option<u64>,

    /// Target architecture
    #[arg(long)]
    arch: Option<String>,

    /// Compress the finished image
    #[arg(long, value_enum)]
    compression: Option<Compression>,

    /// Continue a previous run from its saved state
    #[arg(short, long)]
    resume: bool,

    #[command(flatten)]
    run: RunArgs,
}

/// Run-control flags shared by fresh and resumed builds.
#[derive(Args)]
pub struct RunArgs {
    /// Keep the workspace after a successful build
    #[arg(long = "preserve")]
    preserve_artifacts: bool,

    /// Stop before this step
    #[arg(short, long, value_name = "STEP", conflicts_with = "thru")]
    until: Option<String>,

    /// Stop after this step
    #[arg(short, long, value_name = "STEP")]
    thru: Option<String>,
}

fn parse_size_arg(input: &str) -> Result<u64, String> {
    parse_size(input).map_err(|e| e.to_string())
}

impl RunArgs {
    fn apply(self, cfg: &mut BuildConfig) {
        cfg.run.preserve_artifacts = self.preserve_artifacts;
        cfg.run.until = self.until;
        cfg.run.thru = self.thru;
    }
}

impl CommonArgs {
    pub fn into_config(self, mode: BuildMode, app_config: Option<&AppConfig>) -> BuildConfig {
        let mut cfg = BuildConfig::new(mode, self.output);
        if let Some(app) = app_config {
            cfg.apply_defaults(&app.defaults());
        }
        cfg.workdir = self.workdir;
        cfg.image_size = self.image_size;
        if let Some(sector_size) = self.sector_size {
            cfg.sector_size = sector_size;
        }
        if let Some(arch) = self.arch {
            cfg.architecture = config::normalize_arch(&arch);
        }
        if let Some(compression) = self.compression {
            cfg.compression = compression;
        }
        cfg.run.resume = self.resume;
        self.run.apply(&mut cfg);
        cfg
    }
}

/// Rebuild the configuration of a saved run from its state record.
pub fn resume_config(
    workdir: PathBuf,
    compression: Option<Compression>,
    run: RunArgs,
) -> BuildResult<BuildConfig> {
    let mut cfg = StateFile::in_workspace(&workdir).resume_config()?;
    if let Some(compression) = compression {
        cfg.compression = compression;
    }
    run.apply(&mut cfg);
    Ok(cfg)
}
