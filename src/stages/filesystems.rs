//! Stage 5: Filesystem Provisioner.
//!
//! Formats each target (ESP as FAT32, the logical volumes with their
//! configured journaling filesystems) and mounts the hierarchy in plan
//! order: root first, then `/boot` and `/home` inside it.
//!
//! Mounts performed by this stage are tracked on a stack; if any mount
//! fails, everything already mounted is unwound in reverse order before the
//! error surfaces, leaving the system as it was when the stage began.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::plan::{FsType, InstallPlan, MountEntry};
use crate::runner::{CommandRunner, DiskCommand};
use crate::stages::partition::PartitionTable;
use crate::stages::volumes::VolumeGroup;

/// Mounts performed by this run, unwound in reverse order.
///
/// Dropping an armed stack unmounts best-effort; a successful run calls
/// [`MountStack::persist`] to leave the hierarchy mounted.
pub struct MountStack<'r> {
    runner: &'r dyn CommandRunner,
    mounted: Vec<PathBuf>,
    armed: bool,
}

impl<'r> MountStack<'r> {
    fn new(runner: &'r dyn CommandRunner) -> Self {
        Self {
            runner,
            mounted: Vec::new(),
            armed: true,
        }
    }

    /// Targets currently mounted by this stack, in mount order.
    pub fn targets(&self) -> &[PathBuf] {
        &self.mounted
    }

    fn push_mount(&mut self, entry: &MountEntry, create_dir: bool) -> Result<()> {
        if create_dir {
            fs::create_dir_all(&entry.target).map_err(|err| ProvisionError::Mount {
                target: entry.target.clone(),
                detail: format!("creating mount point: {err}"),
            })?;
        }

        debug!(source = %entry.source.display(), target = %entry.target.display(), "mounting");
        let output = self.runner.run(&DiskCommand::Mount {
            source: entry.source.clone(),
            target: entry.target.clone(),
            fs: entry.fstype,
        })?;
        if !output.success {
            return Err(ProvisionError::Mount {
                target: entry.target.clone(),
                detail: output.diagnostic(),
            });
        }
        self.mounted.push(entry.target.clone());
        Ok(())
    }

    /// Unmount everything this stack mounted, newest first. Individual
    /// failures are logged and do not stop the rest of the unwind.
    fn unwind(&mut self) {
        while let Some(target) = self.mounted.pop() {
            debug!(target = %target.display(), "unmounting");
            match self.runner.run(&DiskCommand::Umount {
                target: target.clone(),
            }) {
                Ok(output) if output.success => {}
                Ok(output) => {
                    warn!(target = %target.display(), detail = %output.diagnostic(), "unmount failed")
                }
                Err(err) => warn!(target = %target.display(), %err, "unmount failed"),
            }
        }
    }

    /// Leave the hierarchy mounted and return the mounted targets.
    pub fn persist(mut self) -> Vec<PathBuf> {
        self.armed = false;
        std::mem::take(&mut self.mounted)
    }
}

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.unwind();
        }
    }
}

/// Formats and mounts the provisioned layout.
///
/// `provision` consumes the provisioner: each target is formatted exactly
/// once per constructed instance, so re-running on an already-provisioned
/// layout is unrepresentable rather than silently tolerated.
pub struct FilesystemProvisioner<'a, 'r> {
    plan: &'a InstallPlan,
    table: &'a PartitionTable,
    volumes: &'a VolumeGroup,
    runner: &'r dyn CommandRunner,
    create_mount_dirs: bool,
}

impl<'a, 'r> FilesystemProvisioner<'a, 'r> {
    pub fn new(
        plan: &'a InstallPlan,
        table: &'a PartitionTable,
        volumes: &'a VolumeGroup,
        runner: &'r dyn CommandRunner,
    ) -> Self {
        Self {
            plan,
            table,
            volumes,
            runner,
            create_mount_dirs: true,
        }
    }

    /// Skip mount-point directory creation (dry runs, where the hierarchy
    /// must not be touched).
    pub fn with_mount_dir_creation(mut self, create: bool) -> Self {
        self.create_mount_dirs = create;
        self
    }

    /// Format every target, then mount in plan order.
    pub fn provision(self) -> Result<MountStack<'r>> {
        let format_targets: [(PathBuf, FsType); 3] = [
            (self.table.esp_path(), FsType::Fat32),
            (self.volumes.root.path.clone(), self.plan.root_fs),
            (self.volumes.home.path.clone(), self.plan.home_fs),
        ];

        for (target, fs) in format_targets {
            info!(target = %target.display(), %fs, "formatting");
            let output = self.runner.run(&DiskCommand::Mkfs {
                device: target.clone(),
                fs,
            })?;
            if !output.success {
                return Err(ProvisionError::Format {
                    target,
                    detail: output.diagnostic(),
                });
            }
        }

        let mount_plan = self.plan.mount_plan()?;
        let mut stack = MountStack::new(self.runner);
        for entry in mount_plan.entries() {
            if let Err(err) = stack.push_mount(entry, self.create_mount_dirs) {
                stack.unwind();
                return Err(err);
            }
        }

        debug!(targets = ?stack.targets(), "mount hierarchy in place");
        Ok(stack)
    }
}
