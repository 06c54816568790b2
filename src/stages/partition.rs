//! Stage 2: Partitioner.
//!
//! Wipes existing signatures, writes a GPT label, and creates the two-entry
//! layout every later stage depends on: partition 1 is the ESP with the boot
//! flag, partition 2 spans the rest of the disk as the LVM container. After
//! the table is written the kernel is asked to re-read it, and the stage
//! polls for the partition nodes with bounded backoff instead of a fixed
//! sleep.
//!
//! The 1 MiB leading gap keeps the first partition aligned.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::device;
use crate::error::{ProvisionError, Result};
use crate::plan::{ByteSize, FsType, InstallPlan};
use crate::retry::Backoff;
use crate::runner::{CommandRunner, DiskCommand, PartitionEnd, PartitionFlag};

/// Role of a partition in the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// EFI System Partition.
    Esp,
    /// LUKS/LVM container.
    Lvm,
}

/// One partition descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: u32,
    pub role: PartitionRole,
    pub start: ByteSize,
    pub end: PartitionEnd,
    pub boot_flag: bool,
}

/// The two-entry layout produced by this stage.
///
/// Construction enforces the layout contract; downstream stages read
/// partition paths from here instead of recomputing them.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    device: PathBuf,
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// The layout for a plan: `[1MiB, 1MiB+ESP)` ESP, `[1MiB+ESP, end)` LVM.
    pub fn for_plan(plan: &InstallPlan) -> Self {
        let esp_start = ByteSize::from_mib(1);
        // Plan validation bounds the ESP size, so this cannot wrap.
        let esp_end = ByteSize::from_bytes(esp_start.bytes().saturating_add(plan.esp_size.bytes()));

        Self {
            device: plan.device.clone(),
            entries: vec![
                PartitionEntry {
                    index: 1,
                    role: PartitionRole::Esp,
                    start: esp_start,
                    end: PartitionEnd::Mib(esp_end.mib()),
                    boot_flag: true,
                },
                PartitionEntry {
                    index: 2,
                    role: PartitionRole::Lvm,
                    start: esp_end,
                    end: PartitionEnd::EndOfDisk,
                    boot_flag: false,
                },
            ],
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Device node of the ESP (partition 1).
    pub fn esp_path(&self) -> PathBuf {
        device::partition_path(&self.device, 1)
    }

    /// Device node of the LVM container (partition 2).
    pub fn lvm_path(&self) -> PathBuf {
        device::partition_path(&self.device, 2)
    }

    /// The ordered command sequence that realizes this table.
    pub fn commands(&self) -> Vec<DiskCommand> {
        let mut commands = vec![
            DiskCommand::WipeSignatures {
                device: self.device.clone(),
            },
            DiskCommand::CreateGptLabel {
                device: self.device.clone(),
            },
        ];

        for entry in &self.entries {
            let (label, fs_hint) = match entry.role {
                PartitionRole::Esp => ("EFI".to_string(), Some(FsType::Fat32)),
                PartitionRole::Lvm => ("lvm".to_string(), None),
            };
            commands.push(DiskCommand::CreatePartition {
                device: self.device.clone(),
                index: entry.index,
                label,
                fs_hint,
                start_mib: entry.start.mib(),
                end: entry.end,
            });
            if entry.boot_flag {
                commands.push(DiskCommand::SetPartitionFlag {
                    device: self.device.clone(),
                    index: entry.index,
                    flag: PartitionFlag::Boot,
                });
            }
            if entry.role == PartitionRole::Lvm {
                commands.push(DiskCommand::SetPartitionFlag {
                    device: self.device.clone(),
                    index: entry.index,
                    flag: PartitionFlag::Lvm,
                });
            }
        }

        commands.push(DiskCommand::ProbePartitions {
            device: self.device.clone(),
        });
        commands
    }
}

/// Checks whether the kernel has surfaced the new partition nodes.
pub trait PartitionProbe {
    fn visible(&self, table: &PartitionTable) -> bool;
}

/// Real check: every partition's device node exists.
pub struct DevNodeProbe;

impl PartitionProbe for DevNodeProbe {
    fn visible(&self, table: &PartitionTable) -> bool {
        (1..=table.entries().len() as u32)
            .all(|index| device::partition_path(table.device(), index).exists())
    }
}

/// Probe for dry runs, where no node will ever appear.
pub struct AssumeVisible;

impl PartitionProbe for AssumeVisible {
    fn visible(&self, _table: &PartitionTable) -> bool {
        true
    }
}

/// Partition the disk and wait for the kernel to see the result.
pub fn run(
    plan: &InstallPlan,
    runner: &dyn CommandRunner,
    probe: &dyn PartitionProbe,
    settle: &Backoff,
) -> Result<PartitionTable> {
    let table = PartitionTable::for_plan(plan);
    info!(device = %plan.device.display(), esp = %plan.esp_size, "partitioning");

    for command in table.commands() {
        let output = runner.run(&command)?;
        if !output.success {
            return Err(ProvisionError::partitioning(
                plan.device.clone(),
                format!("{command}: {}", output.diagnostic()),
            ));
        }
    }

    if !settle.wait_for(|| probe.visible(&table)) {
        return Err(ProvisionError::partitioning(
            plan.device.clone(),
            "partition nodes did not appear within the re-enumeration timeout",
        ));
    }

    debug!(device = %plan.device.display(), "partition table visible");
    Ok(table)
}
