//! Stage 3: Encryptor.
//!
//! Formats the LVM container partition as a LUKS2 volume and opens it under
//! the plan's mapper name. The passphrase comes from the secret provider and
//! only ever touches the tool through a wiped-on-drop keyfile.
//!
//! The open mapping is a leak hazard: [`EncryptedVolume`] closes it on drop
//! unless the pipeline persists it after a fully successful run.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::device;
use crate::error::{ProvisionError, Result};
use crate::plan::InstallPlan;
use crate::runner::{CommandRunner, DiskCommand};
use crate::secret::{SecretFile, SecretProvider};
use crate::stages::partition::PartitionTable;

/// cryptsetup exit status for "no usable keyslot" (authentication failure).
const CRYPTSETUP_NO_KEY: i32 = 2;

/// Re-prompt ceiling: the initial attempt plus this many fresh passphrases.
const MAX_REPROMPTS: u32 = 3;

/// An open LUKS mapping.
///
/// Exists only between a successful open and the close. Dropping the handle
/// closes the mapping (best effort, logged on failure), so every abort path
/// releases it; a successful run calls [`EncryptedVolume::persist`] to leave
/// the mapping in place for the mounted system.
pub struct EncryptedVolume<'r> {
    runner: &'r dyn CommandRunner,
    name: String,
    path: PathBuf,
    armed: bool,
}

impl<'r> EncryptedVolume<'r> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mapped block device (`/dev/mapper/<name>`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the mapping open past this handle's lifetime.
    pub fn persist(mut self) -> PathBuf {
        self.armed = false;
        self.path.clone()
    }

    fn close(&mut self) -> Result<()> {
        debug!(mapper = %self.name, "closing encrypted mapping");
        let output = self.runner.run(&DiskCommand::LuksClose {
            mapper_name: self.name.clone(),
        })?;
        if !output.success {
            return Err(ProvisionError::EncryptionSetup {
                device: self.path.clone(),
                detail: format!("close failed: {}", output.diagnostic()),
            });
        }
        Ok(())
    }
}

impl Drop for EncryptedVolume<'_> {
    fn drop(&mut self) {
        if self.armed && self.close().is_err() {
            warn!(mapper = %self.name, "failed to close encrypted mapping");
        }
    }
}

/// Format and open the LUKS container.
pub fn run<'r>(
    plan: &InstallPlan,
    table: &PartitionTable,
    secrets: &dyn SecretProvider,
    runner: &'r dyn CommandRunner,
) -> Result<EncryptedVolume<'r>> {
    let luks_device = table.lvm_path();
    let mapper = device::mapper_path(&plan.mapper_name);

    let passphrase = secrets
        .passphrase(0)?
        .ok_or_else(|| ProvisionError::EncryptionSetup {
            device: luks_device.clone(),
            detail: "passphrase source yielded no passphrase".to_string(),
        })?;
    let mut key_file = SecretFile::new(&passphrase)?;

    info!(device = %luks_device.display(), "formatting LUKS2 container");
    let output = runner.run(&DiskCommand::LuksFormat {
        device: luks_device.clone(),
        key_file: key_file.path().to_path_buf(),
    })?;
    if !output.success {
        return Err(ProvisionError::EncryptionSetup {
            device: luks_device,
            detail: output.diagnostic(),
        });
    }

    // Open, re-prompting through the provider on authentication failure.
    // The same value is never silently resubmitted: a retry happens only
    // with a fresh passphrase, and static providers decline to give one.
    let mut attempt: u32 = 0;
    loop {
        info!(device = %luks_device.display(), mapper = %plan.mapper_name, "opening LUKS container");
        let output = runner.run(&DiskCommand::LuksOpen {
            device: luks_device.clone(),
            mapper_name: plan.mapper_name.clone(),
            key_file: key_file.path().to_path_buf(),
        })?;

        if output.success {
            return Ok(EncryptedVolume {
                runner,
                name: plan.mapper_name.clone(),
                path: mapper,
                armed: true,
            });
        }

        if output.exit_code != Some(CRYPTSETUP_NO_KEY) {
            return Err(ProvisionError::EncryptionSetup {
                device: luks_device,
                detail: output.diagnostic(),
            });
        }

        attempt += 1;
        if attempt > MAX_REPROMPTS {
            return Err(ProvisionError::WrongPassphrase { device: luks_device });
        }
        match secrets.passphrase(attempt)? {
            Some(fresh) => {
                debug!(attempt, "retrying open with fresh passphrase");
                key_file = SecretFile::new(&fresh)?;
            }
            None => return Err(ProvisionError::WrongPassphrase { device: luks_device }),
        }
    }
}
