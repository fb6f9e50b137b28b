use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use crate::config::{debian_arch, BuildMode, ClassicOptions};
use crate::layout::{Bootloader, Structure};
use crate::statemachine::variant::BuildVariant;
use crate::tools::ToolCommand;

use super::artifacts::{BOOTLOADER, ROOTFS};
use super::common::{populate_structure, structures_dir, STRUCTURES_DIR};
use super::StepContext;

fn classic_options(ctx: &StepContext<'_>) -> Result<ClassicOptions> {
    match &ctx.config().mode {
        BuildMode::Classic(opts) => Ok(opts.clone()),
        BuildMode::Snap(_) => bail!("step only applies to classic builds"),
    }
}

pub fn bootstrap_rootfs(ctx: &mut StepContext<'_>) -> Result<()> {
    let opts = classic_options(ctx)?;
    let arch = debian_arch(&ctx.config().architecture)
        .ok_or_else(|| anyhow!("unsupported architecture {}", ctx.config().architecture))?;
    let chroot = ctx.config().mode.rootfs_dir(ctx.workspace);
    if chroot.exists() {
        fs::remove_dir_all(&chroot)
            .with_context(|| format!("failed to clear {}", chroot.display()))?;
    }
    fs::create_dir_all(&chroot)?;

    let mut cmd = ToolCommand::new("debootstrap")
        .arg(format!("--arch={arch}"))
        .arg("--variant=minbase");
    if !opts.components.is_empty() {
        cmd = cmd.arg(format!("--components={}", opts.components.join(",")));
    }
    cmd = cmd.arg(&opts.suite).arg(&chroot).arg(&opts.mirror);
    ctx.runner
        .run(&cmd)
        .with_context(|| format!("failed to bootstrap {} for {arch}", opts.suite))?;

    info!("bootstrapped {} into {}", opts.suite, chroot.display());
    ctx.state.register_artifact(ROOTFS, chroot);
    Ok(())
}

pub fn install_extra_packages(ctx: &mut StepContext<'_>) -> Result<()> {
    let opts = classic_options(ctx)?;
    if opts.extra_packages.is_empty() {
        info!("no extra packages requested");
        return Ok(());
    }
    let chroot = ctx.config().mode.rootfs_dir(ctx.workspace);
    let apt = |args: &[&str]| {
        ToolCommand::new("chroot")
            .arg(&chroot)
            .arg("apt-get")
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
    };
    ctx.runner.run(&apt(&["update"]))?;
    ctx.runner.run(
        &apt(&["install", "-y", "--no-install-recommends"]).args(&opts.extra_packages),
    )?;
    info!("installed {}", opts.extra_packages.join(" "));
    Ok(())
}

pub fn run_customization_hooks(ctx: &mut StepContext<'_>) -> Result<()> {
    let opts = classic_options(ctx)?;
    let chroot = ctx.config().mode.rootfs_dir(ctx.workspace);

    if let Some(hostname) = &opts.hostname {
        let etc = chroot.join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("hostname"), format!("{hostname}\n"))
            .context("failed to write hostname")?;
    }

    for hook in &opts.hooks {
        info!("running hook {}", hook.display());
        ctx.runner
            .run(
                &ToolCommand::new(hook.to_string_lossy())
                    .env("IMAGE_ROOTFS", &chroot)
                    .env("IMAGE_WORKSPACE", ctx.workspace.root()),
            )
            .with_context(|| format!("hook {} failed", hook.display()))?;
    }
    Ok(())
}

/// Everything but the boot structure, which `install_bootloader` owns.
pub fn populate_rootfs(ctx: &mut StepContext<'_>) -> Result<()> {
    structures_dir(ctx)?;
    let volume = ctx.state.volume()?.clone();
    let mode = ctx.config().mode.clone();
    let content_root = mode.staged_layout(ctx.workspace).content_root;
    let chroot = mode.rootfs_dir(ctx.workspace);

    for structure in volume.structures.iter().filter(|s| !s.is_system_boot()) {
        let tree = structure.is_system_data().then_some(chroot.as_path());
        populate_structure(ctx, structure, &content_root, tree)?;
    }
    Ok(())
}

pub fn install_bootloader(ctx: &mut StepContext<'_>) -> Result<()> {
    let volume = ctx.state.volume()?.clone();
    let mode = ctx.config().mode.clone();
    let content_root = mode.staged_layout(ctx.workspace).content_root;
    let chroot = mode.rootfs_dir(ctx.workspace);

    let Some(boot) = volume.system_boot() else {
        if volume.bootloader == Bootloader::Grub {
            bail!("grub needs a structure with role system-boot");
        }
        info!("layout has no boot structure, nothing to install");
        return Ok(());
    };

    let staging = ctx.workspace.join(STRUCTURES_DIR).join("bootloader");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    if volume.bootloader == Bootloader::Grub {
        let target = grub_target(&ctx.config().architecture)?;
        ctx.runner
            .run(
                &ToolCommand::new("grub-install")
                    .arg(format!("--target={target}"))
                    .arg(format!(
                        "--directory={}",
                        chroot.join("usr/lib/grub").join(target).display()
                    ))
                    .arg(format!("--efi-directory={}", staging.display()))
                    .arg(format!("--boot-directory={}", staging.join("boot").display()))
                    .args(["--removable", "--no-nvram"]),
            )
            .context("grub-install failed")?;
        write_grub_stub(&staging, &volume.structures)?;
    } else {
        warn!("no bootloader configured, {} only gets its content", boot.name);
    }

    populate_structure(ctx, boot, &content_root, Some(&staging))?;
    ctx.state.register_artifact(BOOTLOADER, staging);
    Ok(())
}

fn grub_target(arch: &str) -> Result<&'static str> {
    match arch {
        "x86_64" => Ok("x86_64-efi"),
        "aarch64" => Ok("arm64-efi"),
        "riscv64" => Ok("riscv64-efi"),
        other => bail!("grub is not supported on {other}"),
    }
}

/// Small config on the boot partition that hands over to the root
/// filesystem's own grub.cfg.
fn write_grub_stub(staging: &Path, structures: &[Structure]) -> Result<()> {
    let Some(data) = structures.iter().find(|s| s.is_system_data()) else {
        bail!("grub needs a structure with role system-data");
    };
    let dir = staging.join("boot/grub");
    fs::create_dir_all(&dir)?;
    let stub = format!(
        "search --no-floppy --set=root --label {}\nset prefix=($root)/boot/grub\nconfigfile $prefix/grub.cfg\n",
        data.label_or_name()
    );
    fs::write(dir.join("grub.cfg"), stub).context("failed to write grub.cfg")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grub_targets() {
        assert_eq!(grub_target("x86_64").unwrap(), "x86_64-efi");
        assert_eq!(grub_target("aarch64").unwrap(), "arm64-efi");
        assert!(grub_target("armv7l").is_err());
    }
}
