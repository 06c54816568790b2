//! The five-stage provisioning pipeline.
//!
//! Control flows strictly forward through validate, partition, encrypt,
//! volumes and filesystems; each stage's success is a
//! precondition for the next. Any failure aborts the whole run; the only
//! state released on abort is what this run itself created (its mounts via
//! [`filesystems::MountStack`], its LUKS mapping via
//! [`encrypt::EncryptedVolume`]). A rewritten partition table is not rolled
//! back.

pub mod encrypt;
pub mod filesystems;
pub mod partition;
pub mod validate;
pub mod volumes;

use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::plan::{HomeSizing, InstallPlan};
use crate::retry::Backoff;
use crate::runner::{CommandRunner, DiskCommand};
use crate::secret::SecretProvider;

use filesystems::FilesystemProvisioner;
use partition::{PartitionProbe, PartitionTable};

/// How much of the Disk Validator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Full validation against the live system, confirmation required.
    Live,
    /// Preview/dry runs: nothing destructive will execute, so the target
    /// need not exist and no confirmation is demanded.
    Preview,
}

/// Collaborators and policy for one provisioning run.
pub struct ProvisionContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub secrets: &'a dyn SecretProvider,
    pub probe: &'a dyn PartitionProbe,
    pub settle: Backoff,
    pub validation: ValidationMode,
    /// Create mount-point directories; disabled for dry runs.
    pub create_mount_dirs: bool,
}

/// The layout a successful run leaves behind.
#[derive(Debug)]
pub struct Provisioned {
    pub table: PartitionTable,
    pub volume_group: volumes::VolumeGroup,
    /// The open LUKS mapping, left in place for the mounted system.
    pub mapped_device: PathBuf,
    /// Mount targets in mount order.
    pub mounted: Vec<PathBuf>,
}

/// Run the full pipeline for a plan.
pub fn provision(
    plan: &InstallPlan,
    confirmation: Option<&str>,
    ctx: &ProvisionContext,
) -> Result<Provisioned> {
    plan.validate()
        .map_err(|err| ProvisionError::config(err.to_string()))?;

    match ctx.validation {
        ValidationMode::Live => validate::run(plan, confirmation)?,
        ValidationMode::Preview => {
            debug!("preview mode: skipping live device validation")
        }
    }

    let table = partition::run(plan, ctx.runner, ctx.probe, &ctx.settle)?;

    let mapped = encrypt::run(plan, &table, ctx.secrets, ctx.runner)?;

    // From here on, any error path drops `mapped`, which closes the mapping.
    let volume_group = volumes::run(plan, mapped.path(), ctx.runner)?;

    let stack = FilesystemProvisioner::new(plan, &table, &volume_group, ctx.runner)
        .with_mount_dir_creation(ctx.create_mount_dirs)
        .provision()?;

    let mounted = stack.persist();
    let mapped_device = mapped.persist();

    info!(
        device = %plan.device.display(),
        vg = %plan.vg_name,
        "provisioning complete"
    );
    Ok(Provisioned {
        table,
        volume_group,
        mapped_device,
        mounted,
    })
}

/// The nominal command sequence for a plan, for preview output.
///
/// Keyfile paths are placeholders; the volume sizing shown assumes the
/// space check passes.
pub fn preview_commands(plan: &InstallPlan) -> Result<Vec<DiskCommand>> {
    let table = PartitionTable::for_plan(plan);
    let key_file = PathBuf::from("<keyfile>");
    let mapped = plan.mapper_path();

    let mut commands = table.commands();
    commands.push(DiskCommand::LuksFormat {
        device: table.lvm_path(),
        key_file: key_file.clone(),
    });
    commands.push(DiskCommand::LuksOpen {
        device: table.lvm_path(),
        mapper_name: plan.mapper_name.clone(),
        key_file,
    });
    commands.push(DiskCommand::BlockDeviceSize {
        device: mapped.clone(),
    });
    commands.push(DiskCommand::PvCreate {
        device: mapped.clone(),
    });
    commands.push(DiskCommand::VgCreate {
        vg_name: plan.vg_name.clone(),
        device: mapped,
    });
    commands.push(DiskCommand::LvCreateFixed {
        vg_name: plan.vg_name.clone(),
        lv_name: "root".to_string(),
        size: plan.root_size,
    });
    commands.push(DiskCommand::LvCreateRemainder {
        vg_name: plan.vg_name.clone(),
        lv_name: "home".to_string(),
    });
    if let HomeSizing::RemainderMinusReserve { reserve } = plan.home_sizing {
        commands.push(DiskCommand::LvReduce {
            vg_name: plan.vg_name.clone(),
            lv_name: "home".to_string(),
            by: reserve,
        });
    }

    commands.push(DiskCommand::Mkfs {
        device: table.esp_path(),
        fs: crate::plan::FsType::Fat32,
    });
    commands.push(DiskCommand::Mkfs {
        device: plan.root_lv_path(),
        fs: plan.root_fs,
    });
    commands.push(DiskCommand::Mkfs {
        device: plan.home_lv_path(),
        fs: plan.home_fs,
    });
    for entry in plan.mount_plan()?.entries() {
        commands.push(DiskCommand::Mount {
            source: entry.source.clone(),
            target: entry.target.clone(),
            fs: entry.fstype,
        });
    }

    Ok(commands)
}

/// Human-readable preview of a plan's command sequence. Destructive
/// commands are marked.
pub fn summary(plan: &InstallPlan) -> Result<String> {
    let commands = preview_commands(plan)?;
    let mut lines = vec![
        format!("Provisioning plan for {}", plan.device.display()),
        format!("  ESP: {}  root: {}  home: {:?}", plan.esp_size, plan.root_size, plan.home_sizing),
        format!("  Commands ({}):", commands.len()),
    ];
    for (i, command) in commands.iter().enumerate() {
        let marker = if command.is_destructive() { "*" } else { " " };
        lines.push(format!("  {marker} {:2}. {command}", i + 1));
    }
    lines.push("  (* destructive)".to_string());
    Ok(lines.join("\n"))
}
