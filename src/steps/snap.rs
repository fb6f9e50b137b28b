use std::fs;

use anyhow::{bail, Context, Result};
use log::info;

use crate::config::BuildMode;
use crate::statemachine::variant::{BuildVariant, UNPACK_DIR};

use super::artifacts::BUNDLE;
use super::common::{copy_tree, populate_structure, structures_dir};
use super::StepContext;

/// Copy the bundle into the workspace so later steps never read the
/// caller's directory again.
pub fn unpack_bundle(ctx: &mut StepContext<'_>) -> Result<()> {
    let BuildMode::Snap(opts) = &ctx.config().mode else {
        bail!("unpack_bundle only applies to snap builds");
    };
    let bundle = opts.bundle.clone();
    let unpack = ctx.workspace.join(UNPACK_DIR);
    if unpack.exists() {
        fs::remove_dir_all(&unpack)
            .with_context(|| format!("failed to clear {}", unpack.display()))?;
    }
    copy_tree(&bundle, &unpack)?;

    let staged = ctx.config().mode.staged_layout(ctx.workspace);
    if !staged.layout_file.is_file() {
        bail!("bundle {} has no meta/layout.toml", bundle.display());
    }
    info!("unpacked {} into {}", bundle.display(), unpack.display());
    ctx.state.register_artifact(BUNDLE, unpack);
    Ok(())
}

pub fn populate_structures(ctx: &mut StepContext<'_>) -> Result<()> {
    structures_dir(ctx)?;
    let volume = ctx.state.volume()?.clone();
    let mode = ctx.config().mode.clone();
    let content_root = mode.staged_layout(ctx.workspace).content_root;
    let rootfs = mode.rootfs_dir(ctx.workspace);

    for structure in &volume.structures {
        let tree = (structure.is_system_data() && rootfs.is_dir()).then_some(rootfs.as_path());
        populate_structure(ctx, structure, &content_root, tree)?;
    }
    Ok(())
}
