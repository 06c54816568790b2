//! Privileged command execution.
//!
//! The pipeline never builds tool invocations ad hoc: every external action
//! is one variant of the typed [`DiskCommand`] vocabulary, executed through
//! the [`CommandRunner`] trait. The production [`SystemRunner`] shells out to
//! the real tools; [`DryRunRunner`] logs what would run; tests script their
//! own runner to drive the pipeline without root or disks.
//!
//! Commands carry a keyfile path where a secret is involved, never the
//! passphrase itself, so logging a command is always safe.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::Result;
use crate::plan::{ByteSize, FsType};

// ============================================================================
// Command vocabulary
// ============================================================================

/// Partition flag set via the partitioning tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFlag {
    /// Bootable EFI System Partition flag.
    Boot,
    /// Partition is an LVM physical-volume container.
    Lvm,
}

impl PartitionFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionFlag::Boot => "boot",
            PartitionFlag::Lvm => "lvm",
        }
    }
}

/// Upper bound of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEnd {
    Mib(u64),
    EndOfDisk,
}

impl fmt::Display for PartitionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionEnd::Mib(mib) => write!(f, "{}MiB", mib),
            PartitionEnd::EndOfDisk => write!(f, "100%"),
        }
    }
}

/// One discrete privileged operation.
///
/// The pipeline issues these in a fixed order; ordering invariants live in
/// the stages, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskCommand {
    /// Remove existing filesystem/partition-table signatures.
    WipeSignatures { device: PathBuf },

    /// Write a fresh GPT label.
    CreateGptLabel { device: PathBuf },

    /// Create one partition. `index` is the expected 1-based slot.
    CreatePartition {
        device: PathBuf,
        index: u32,
        label: String,
        fs_hint: Option<FsType>,
        start_mib: u64,
        end: PartitionEnd,
    },

    /// Set a flag on an existing partition.
    SetPartitionFlag {
        device: PathBuf,
        index: u32,
        flag: PartitionFlag,
    },

    /// Ask the kernel to re-read the partition table.
    ProbePartitions { device: PathBuf },

    /// Initialize a LUKS2 header using a keyfile.
    LuksFormat { device: PathBuf, key_file: PathBuf },

    /// Open a LUKS container under a mapper name.
    LuksOpen {
        device: PathBuf,
        mapper_name: String,
        key_file: PathBuf,
    },

    /// Close an open LUKS mapping.
    LuksClose { mapper_name: String },

    /// Query a block device's size in bytes (stdout: decimal count).
    BlockDeviceSize { device: PathBuf },

    /// Register a physical volume.
    PvCreate { device: PathBuf },

    /// Create a volume group over one physical volume.
    VgCreate { vg_name: String, device: PathBuf },

    /// Create a fixed-size logical volume.
    LvCreateFixed {
        vg_name: String,
        lv_name: String,
        size: ByteSize,
    },

    /// Create a logical volume over all remaining free extents.
    LvCreateRemainder { vg_name: String, lv_name: String },

    /// Shrink a logical volume by a fixed amount.
    LvReduce {
        vg_name: String,
        lv_name: String,
        by: ByteSize,
    },

    /// Create a filesystem on a target.
    Mkfs { device: PathBuf, fs: FsType },

    /// Mount a source at a target.
    Mount {
        source: PathBuf,
        target: PathBuf,
        fs: FsType,
    },

    /// Unmount a target.
    Umount { target: PathBuf },
}

impl DiskCommand {
    /// Whether this command irreversibly alters on-disk state.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            DiskCommand::WipeSignatures { .. }
                | DiskCommand::CreateGptLabel { .. }
                | DiskCommand::CreatePartition { .. }
                | DiskCommand::LuksFormat { .. }
                | DiskCommand::Mkfs { .. }
        )
    }
}

impl fmt::Display for DiskCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WipeSignatures { device } => {
                write!(f, "wipe-signatures {}", device.display())
            }
            Self::CreateGptLabel { device } => {
                write!(f, "create-gpt-label {}", device.display())
            }
            Self::CreatePartition {
                device,
                index,
                label,
                start_mib,
                end,
                ..
            } => write!(
                f,
                "create-partition {} #{} ({}) {}MiB..{}",
                device.display(),
                index,
                label,
                start_mib,
                end
            ),
            Self::SetPartitionFlag {
                device,
                index,
                flag,
            } => write!(f, "set-flag {} #{} {}", device.display(), index, flag.as_str()),
            Self::ProbePartitions { device } => {
                write!(f, "probe-partitions {}", device.display())
            }
            Self::LuksFormat { device, .. } => {
                write!(f, "luks-format {} (keyfile)", device.display())
            }
            Self::LuksOpen {
                device,
                mapper_name,
                ..
            } => write!(
                f,
                "luks-open {} -> /dev/mapper/{}",
                device.display(),
                mapper_name
            ),
            Self::LuksClose { mapper_name } => write!(f, "luks-close {}", mapper_name),
            Self::BlockDeviceSize { device } => {
                write!(f, "block-device-size {}", device.display())
            }
            Self::PvCreate { device } => write!(f, "pv-create {}", device.display()),
            Self::VgCreate { vg_name, device } => {
                write!(f, "vg-create {} on {}", vg_name, device.display())
            }
            Self::LvCreateFixed {
                vg_name,
                lv_name,
                size,
            } => write!(f, "lv-create {}/{} {}", vg_name, lv_name, size),
            Self::LvCreateRemainder { vg_name, lv_name } => {
                write!(f, "lv-create {}/{} 100%FREE", vg_name, lv_name)
            }
            Self::LvReduce {
                vg_name,
                lv_name,
                by,
            } => write!(f, "lv-reduce {}/{} by {}", vg_name, lv_name, by),
            Self::Mkfs { device, fs } => {
                write!(f, "{} {}", fs.mkfs_program(), device.display())
            }
            Self::Mount { source, target, fs } => write!(
                f,
                "mount {} -> {} ({})",
                source.display(),
                target.display(),
                fs.mount_type()
            ),
            Self::Umount { target } => write!(f, "umount {}", target.display()),
        }
    }
}

// ============================================================================
// Output and runner trait
// ============================================================================

/// Captured result of one command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    pub fn ok_with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::ok()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
        }
    }

    /// Diagnostic text for error reporting: stderr if present, else stdout.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.is_empty() {
            format!("exit code {}", self.exit_code.unwrap_or(-1))
        } else {
            text.to_string()
        }
    }
}

/// Executes [`DiskCommand`]s and reports per-command status.
///
/// A nonzero tool exit is a *successful* `run` returning
/// `CommandOutput { success: false, .. }`; `Err` is reserved for failures to
/// execute at all (spawn errors).
pub trait CommandRunner {
    fn run(&self, command: &DiskCommand) -> Result<CommandOutput>;
}

// ============================================================================
// SystemRunner
// ============================================================================

/// Runs commands against the real system tools.
pub struct SystemRunner;

impl SystemRunner {
    /// Program + arguments for a command. Pure, so the mapping is testable
    /// without executing anything.
    pub fn argv(command: &DiskCommand) -> Vec<String> {
        fn path(p: &PathBuf) -> String {
            p.display().to_string()
        }

        match command {
            DiskCommand::WipeSignatures { device } => {
                vec!["wipefs".into(), "-a".into(), path(device)]
            }
            DiskCommand::CreateGptLabel { device } => vec![
                "parted".into(),
                "--script".into(),
                path(device),
                "mklabel".into(),
                "gpt".into(),
            ],
            DiskCommand::CreatePartition {
                device,
                label,
                fs_hint,
                start_mib,
                end,
                ..
            } => {
                let mut argv = vec![
                    "parted".into(),
                    "--script".into(),
                    path(device),
                    "mkpart".into(),
                    label.clone(),
                ];
                if let Some(fs) = fs_hint {
                    argv.push(fs.to_string());
                }
                argv.push(format!("{}MiB", start_mib));
                argv.push(end.to_string());
                argv
            }
            DiskCommand::SetPartitionFlag {
                device,
                index,
                flag,
            } => vec![
                "parted".into(),
                "--script".into(),
                path(device),
                "set".into(),
                index.to_string(),
                flag.as_str().into(),
                "on".into(),
            ],
            DiskCommand::ProbePartitions { device } => {
                vec!["partprobe".into(), path(device)]
            }
            DiskCommand::LuksFormat { device, key_file } => vec![
                "cryptsetup".into(),
                "-q".into(),
                "luksFormat".into(),
                "--type".into(),
                "luks2".into(),
                "--key-file".into(),
                path(key_file),
                path(device),
            ],
            DiskCommand::LuksOpen {
                device,
                mapper_name,
                key_file,
            } => vec![
                "cryptsetup".into(),
                "open".into(),
                "--key-file".into(),
                path(key_file),
                path(device),
                mapper_name.clone(),
            ],
            DiskCommand::LuksClose { mapper_name } => {
                vec!["cryptsetup".into(), "close".into(), mapper_name.clone()]
            }
            DiskCommand::BlockDeviceSize { device } => {
                vec!["blockdev".into(), "--getsize64".into(), path(device)]
            }
            DiskCommand::PvCreate { device } => vec!["pvcreate".into(), path(device)],
            DiskCommand::VgCreate { vg_name, device } => {
                vec!["vgcreate".into(), vg_name.clone(), path(device)]
            }
            DiskCommand::LvCreateFixed {
                vg_name,
                lv_name,
                size,
            } => vec![
                "lvcreate".into(),
                "-y".into(),
                "-L".into(),
                format!("{}m", size.mib()),
                "-n".into(),
                lv_name.clone(),
                vg_name.clone(),
            ],
            DiskCommand::LvCreateRemainder { vg_name, lv_name } => vec![
                "lvcreate".into(),
                "-y".into(),
                "-l".into(),
                "100%FREE".into(),
                "-n".into(),
                lv_name.clone(),
                vg_name.clone(),
            ],
            DiskCommand::LvReduce {
                vg_name,
                lv_name,
                by,
            } => vec![
                "lvreduce".into(),
                "-f".into(),
                "-L".into(),
                format!("-{}m", by.mib()),
                format!("{}/{}", vg_name, lv_name),
            ],
            DiskCommand::Mkfs { device, fs } => {
                let mut argv = vec![fs.mkfs_program().to_string()];
                argv.extend(fs.mkfs_flags().iter().map(|s| s.to_string()));
                argv.push(path(device));
                argv
            }
            DiskCommand::Mount { source, target, fs } => vec![
                "mount".into(),
                "-t".into(),
                fs.mount_type().into(),
                path(source),
                path(target),
            ],
            DiskCommand::Umount { target } => vec!["umount".into(), path(target)],
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &DiskCommand) -> Result<CommandOutput> {
        let argv = Self::argv(command);
        debug!(%command, ?argv, "executing");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        if result.success {
            debug!(%command, "command succeeded");
        } else {
            debug!(%command, code = ?result.exit_code, "command failed");
        }
        Ok(result)
    }
}

// ============================================================================
// DryRunRunner
// ============================================================================

/// Logs every command instead of executing it.
///
/// The size query is answered with a simulated capacity so the volume stage
/// can be previewed without a device.
pub struct DryRunRunner {
    simulated_size: ByteSize,
}

impl DryRunRunner {
    pub fn new(simulated_size: ByteSize) -> Self {
        Self { simulated_size }
    }
}

impl Default for DryRunRunner {
    fn default() -> Self {
        Self::new(ByteSize::from_gib(64))
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, command: &DiskCommand) -> Result<CommandOutput> {
        info!("[dry-run] {}", command);
        match command {
            DiskCommand::BlockDeviceSize { .. } => Ok(CommandOutput::ok_with_stdout(format!(
                "{}\n",
                self.simulated_size.bytes()
            ))),
            _ => Ok(CommandOutput::ok()),
        }
    }
}
