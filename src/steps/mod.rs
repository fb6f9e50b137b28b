//! Step catalogs.
//!
//! A step is a plain function over a [`StepContext`]. Steps must be
//! idempotent: each one recreates its outputs from scratch, so running it
//! again after a crash between its side effects and the checkpoint is
//! harmless.

mod classic;
mod common;
mod snap;
mod tail;

use std::fmt;

use crate::config::{BuildConfig, ImageType};
use crate::statemachine::state::WorkState;
use crate::statemachine::workspace::Workspace;
use crate::tools::CommandRunner;

pub use tail::{ArtifactKind, Manifest, ManifestArtifact, ManifestStructure};

/// Artifact names registered by the steps.
pub mod artifacts {
    pub const BUNDLE: &str = "bundle";
    pub const ROOTFS: &str = "rootfs";
    pub const LAYOUT: &str = "layout";
    pub const DISK_IMAGE: &str = "disk-image";
    pub const STRUCTURES: &str = "structures";
    pub const BOOTLOADER: &str = "bootloader";
    pub const MANIFEST: &str = "manifest";
    pub const COMPRESSED_IMAGE: &str = "compressed-image";

    /// Artifacts that outlive the workspace.
    pub const OUTPUTS: [&str; 3] = [DISK_IMAGE, MANIFEST, COMPRESSED_IMAGE];
}

pub type StepFn = fn(&mut StepContext<'_>) -> anyhow::Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Snap,
    Classic,
    Shared,
}

#[derive(Clone, Copy)]
pub struct StepDefinition {
    pub name: &'static str,
    pub run: StepFn,
    pub membership: Membership,
    /// Artifact names this step registers.
    pub artifacts: &'static [&'static str],
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("membership", &self.membership)
            .field("artifacts", &self.artifacts)
            .finish()
    }
}

/// What a step body gets to work with. The engine hands each step a scratch
/// copy of the work state and only keeps it if the step succeeds.
pub struct StepContext<'a> {
    pub state: &'a mut WorkState,
    pub workspace: &'a Workspace,
    pub runner: &'a dyn CommandRunner,
}

impl StepContext<'_> {
    pub fn config(&self) -> &BuildConfig {
        &self.state.config
    }
}

const fn step(
    name: &'static str,
    run: StepFn,
    membership: Membership,
    artifacts: &'static [&'static str],
) -> StepDefinition {
    StepDefinition {
        name,
        run,
        membership,
        artifacts,
    }
}

use artifacts::*;

const SNAP_HEAD: &[StepDefinition] = &[
    step("unpack_bundle", snap::unpack_bundle, Membership::Snap, &[BUNDLE]),
    step("load_layout", common::load_layout, Membership::Shared, &[LAYOUT]),
    step("create_disk_image", common::create_disk_image, Membership::Shared, &[DISK_IMAGE]),
    step("partition_disk", common::partition_disk, Membership::Shared, &[]),
    step("populate_structures", snap::populate_structures, Membership::Snap, &[STRUCTURES]),
];

const CLASSIC_HEAD: &[StepDefinition] = &[
    step("bootstrap_rootfs", classic::bootstrap_rootfs, Membership::Classic, &[ROOTFS]),
    step("install_extra_packages", classic::install_extra_packages, Membership::Classic, &[]),
    step("run_customization_hooks", classic::run_customization_hooks, Membership::Classic, &[]),
    step("load_layout", common::load_layout, Membership::Shared, &[LAYOUT]),
    step("create_disk_image", common::create_disk_image, Membership::Shared, &[DISK_IMAGE]),
    step("partition_disk", common::partition_disk, Membership::Shared, &[]),
    step("populate_rootfs", classic::populate_rootfs, Membership::Classic, &[STRUCTURES]),
    step("install_bootloader", classic::install_bootloader, Membership::Classic, &[BOOTLOADER]),
];

const SHARED_TAIL: &[StepDefinition] = &[
    step("finalize", tail::finalize, Membership::Shared, &[]),
    step("generate_manifest", tail::generate_manifest, Membership::Shared, &[MANIFEST]),
    step("compress_image", tail::compress_image, Membership::Shared, &[COMPRESSED_IMAGE]),
];

/// Full ordered catalog for a build mode: its own steps, then the shared tail.
pub fn catalog(image_type: ImageType) -> Vec<StepDefinition> {
    let head = match image_type {
        ImageType::Snap => SNAP_HEAD,
        ImageType::Classic => CLASSIC_HEAD,
    };
    head.iter().chain(SHARED_TAIL).copied().collect()
}

pub fn step_names(image_type: ImageType) -> Vec<&'static str> {
    catalog(image_type).iter().map(|s| s.name).collect()
}
