//! Stage 4: Volume Manager.
//!
//! Builds the LVM stack on the opened container: physical volume, one
//! volume group, then the `root` and `home` logical volumes. Root has fixed
//! capacity and is always created first so "remainder" is well-defined; home
//! takes all remaining free extents, optionally shrunk by a fixed reserve.
//!
//! The space check happens against the queried device size *before* any
//! creation command is issued, so an oversized root never reaches the tools.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::plan::{ByteSize, HomeSizing, InstallPlan};
use crate::runner::{CommandRunner, DiskCommand};

/// Allowance for PV/VG metadata when checking whether the plan fits.
/// Extent rounding beyond this is left to the tools.
pub const LVM_METADATA_ALLOWANCE: ByteSize = ByteSize::from_mib(4);

/// Home must end up with at least one extent.
const MIN_HOME: ByteSize = ByteSize::from_mib(4);

/// A created logical volume. `size` is the plan-derived capacity; for home
/// it is the remainder estimate, not a tool-reported figure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    pub path: PathBuf,
    pub size: ByteSize,
}

/// The volume group built by this stage, backed by exactly one physical
/// volume (the mapped encrypted device).
#[derive(Debug, Clone)]
pub struct VolumeGroup {
    pub name: String,
    pub pv_device: PathBuf,
    pub root: LogicalVolume,
    pub home: LogicalVolume,
}

/// Capacity home receives under a sizing policy, or the reason it cannot.
///
/// Fails when root alone exceeds the usable capacity, or when the reserve
/// would squeeze home below a single extent.
pub fn home_capacity(usable: ByteSize, root: ByteSize, policy: HomeSizing) -> Result<ByteSize> {
    let after_root = usable
        .checked_sub(root)
        .ok_or(ProvisionError::InsufficientSpace {
            requested: root,
            available: usable,
        })?;

    let reserve = policy.reserve();
    let home = after_root.saturating_sub(reserve);
    if home < MIN_HOME {
        let requested = root
            .checked_add(reserve)
            .and_then(|sum| sum.checked_add(MIN_HOME))
            .unwrap_or(ByteSize::from_bytes(u64::MAX));
        return Err(ProvisionError::InsufficientSpace {
            requested,
            available: usable,
        });
    }
    Ok(home)
}

/// Query a block device's capacity through the runner.
fn query_device_size(runner: &dyn CommandRunner, device: &Path) -> Result<ByteSize> {
    let output = runner.run(&DiskCommand::BlockDeviceSize {
        device: device.to_path_buf(),
    })?;
    if !output.success {
        return Err(ProvisionError::volume(
            device.display().to_string(),
            format!("size query failed: {}", output.diagnostic()),
        ));
    }
    let bytes: u64 = output.stdout.trim().parse().map_err(|_| {
        ProvisionError::volume(
            device.display().to_string(),
            format!("unparseable size query output: {:?}", output.stdout.trim()),
        )
    })?;
    Ok(ByteSize::from_bytes(bytes))
}

/// Create the PV, VG and logical volumes on the mapped device.
pub fn run(
    plan: &InstallPlan,
    mapped_device: &Path,
    runner: &dyn CommandRunner,
) -> Result<VolumeGroup> {
    let total = query_device_size(runner, mapped_device)?;
    let usable = total.saturating_sub(LVM_METADATA_ALLOWANCE);

    // Capacity planning failure surfaces here, not as a tool error later.
    let home_size = home_capacity(usable, plan.root_size, plan.home_sizing)?;
    info!(
        vg = %plan.vg_name,
        total = %total,
        root = %plan.root_size,
        home = %home_size,
        "creating volume group"
    );

    let mut commands = vec![
        DiskCommand::PvCreate {
            device: mapped_device.to_path_buf(),
        },
        DiskCommand::VgCreate {
            vg_name: plan.vg_name.clone(),
            device: mapped_device.to_path_buf(),
        },
        // Root first: the remainder home consumes must already be reduced
        // by root's extents.
        DiskCommand::LvCreateFixed {
            vg_name: plan.vg_name.clone(),
            lv_name: "root".to_string(),
            size: plan.root_size,
        },
        DiskCommand::LvCreateRemainder {
            vg_name: plan.vg_name.clone(),
            lv_name: "home".to_string(),
        },
    ];
    if let HomeSizing::RemainderMinusReserve { reserve } = plan.home_sizing {
        commands.push(DiskCommand::LvReduce {
            vg_name: plan.vg_name.clone(),
            lv_name: "home".to_string(),
            by: reserve,
        });
    }

    for command in commands {
        let output = runner.run(&command)?;
        if !output.success {
            return Err(ProvisionError::volume(
                format!("{command}"),
                output.diagnostic(),
            ));
        }
    }

    debug!(vg = %plan.vg_name, "volume group ready");
    Ok(VolumeGroup {
        name: plan.vg_name.clone(),
        pv_device: mapped_device.to_path_buf(),
        root: LogicalVolume {
            name: "root".to_string(),
            path: plan.root_lv_path(),
            size: plan.root_size,
        },
        home: LogicalVolume {
            name: "home".to_string(),
            path: plan.home_lv_path(),
            size: home_size,
        },
    })
}
