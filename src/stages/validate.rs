//! Stage 1: Disk Validator.
//!
//! Every later stage is destructive and irreversible, so this is the only
//! safety net: the target must be a real block device, nothing on it may be
//! mounted, and the caller must have confirmed the exact device path. Pure
//! check with no side effects.

use std::path::Path;

use tracing::debug;

use crate::device::{self, MountRecord};
use crate::error::{ProvisionError, Result};
use crate::plan::InstallPlan;

/// Validate the target disk against the live system.
pub fn run(plan: &InstallPlan, confirmation: Option<&str>) -> Result<()> {
    check_confirmation(&plan.device, confirmation)?;

    if !device::is_block_device(&plan.device) {
        return Err(ProvisionError::DeviceNotFound {
            device: plan.device.clone(),
        });
    }

    let mounts = device::current_mounts()?;
    check_not_mounted(&plan.device, &mounts)?;

    // The mapper name must be free: one open container per name, and a
    // stale mapping from an earlier run has to be closed explicitly.
    let mapper = device::mapper_path(&plan.mapper_name);
    if mapper.exists() {
        return Err(ProvisionError::EncryptionSetup {
            device: plan.device.clone(),
            detail: format!(
                "mapper name '{}' is already in use ({})",
                plan.mapper_name,
                mapper.display()
            ),
        });
    }

    debug!(device = %plan.device.display(), "disk validated");
    Ok(())
}

/// The confirmation token must equal the device path, character for
/// character. Anything else (absent, truncated, a different device) is a
/// refusal; ambiguous input never proceeds.
pub fn check_confirmation(device: &Path, confirmation: Option<&str>) -> Result<()> {
    let confirmed = confirmation
        .map(|token| Path::new(token) == device && !token.is_empty())
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(ProvisionError::NotConfirmed {
            device: device.to_path_buf(),
        })
    }
}

/// Fail if the device or any of its partitions appears in the mount table.
pub fn check_not_mounted(device: &Path, mounts: &[MountRecord]) -> Result<()> {
    if let Some(record) = device::mounts_for_device(device, mounts).first() {
        return Err(ProvisionError::AlreadyMounted {
            device: device.to_path_buf(),
            target: record.target.clone(),
        });
    }
    Ok(())
}
