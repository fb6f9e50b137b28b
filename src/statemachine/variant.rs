use std::path::PathBuf;

use crate::config::{BuildConfig, BuildMode, ImageType};
use crate::steps::{self, StepDefinition};

use super::state::WorkState;
use super::workspace::Workspace;

/// Where a run finds its layout file and the content it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSources {
    pub layout_file: PathBuf,
    pub content_root: PathBuf,
}

/// What the engine needs to know about a build mode.
pub trait BuildVariant {
    fn image_type(&self) -> ImageType;

    fn catalog(&self) -> Vec<StepDefinition> {
        steps::catalog(self.image_type())
    }

    fn initial_state(&self, config: &BuildConfig) -> WorkState {
        WorkState::new(config.clone())
    }

    /// Layout as given by the user, read before anything is staged.
    fn original_layout(&self) -> LayoutSources;

    /// Layout as seen by the steps once inputs are staged in the workspace.
    fn staged_layout(&self, workspace: &Workspace) -> LayoutSources;

    /// Tree that fills the system-data structure.
    fn rootfs_dir(&self, workspace: &Workspace) -> PathBuf;
}

pub const UNPACK_DIR: &str = "unpack";
pub const CHROOT_DIR: &str = "chroot";

impl BuildVariant for BuildMode {
    fn image_type(&self) -> ImageType {
        BuildMode::image_type(self)
    }

    fn original_layout(&self) -> LayoutSources {
        match self {
            BuildMode::Snap(opts) => LayoutSources {
                layout_file: opts.bundle.join("meta").join("layout.toml"),
                content_root: opts.bundle.join("content"),
            },
            BuildMode::Classic(opts) => classic_sources(&opts.layout),
        }
    }

    fn staged_layout(&self, workspace: &Workspace) -> LayoutSources {
        match self {
            BuildMode::Snap(_) => {
                let unpack = workspace.join(UNPACK_DIR);
                LayoutSources {
                    layout_file: unpack.join("meta").join("layout.toml"),
                    content_root: unpack.join("content"),
                }
            }
            BuildMode::Classic(opts) => classic_sources(&opts.layout),
        }
    }

    fn rootfs_dir(&self, workspace: &Workspace) -> PathBuf {
        match self {
            BuildMode::Snap(_) => workspace.join(UNPACK_DIR).join("rootfs"),
            BuildMode::Classic(_) => workspace.join(CHROOT_DIR),
        }
    }
}

fn classic_sources(layout: &std::path::Path) -> LayoutSources {
    let content_root = layout
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    LayoutSources {
        layout_file: layout.to_path_buf(),
        content_root,
    }
}
