//! Block-device path helpers and mount-table inspection.

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Partition device path for a disk and 1-based partition index.
///
/// Disks whose names end in a digit (`/dev/nvme0n1`, `/dev/loop0`) take a
/// `p` separator; everything else concatenates directly (`/dev/sda1`).
pub fn partition_path(disk: &Path, index: u32) -> PathBuf {
    let disk_str = disk.display().to_string();
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, index))
    } else {
        PathBuf::from(format!("{}{}", disk_str, index))
    }
}

/// Device-mapper path for a mapper name.
pub fn mapper_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

/// Whether the path exists and is a block device node.
pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Parse mount-table text in /proc/self/mounts format.
///
/// Octal escapes in the target field (spaces encode as `\040`) are left
/// as-is; the records are only compared against device paths, which never
/// contain them.
pub fn parse_mount_table(content: &str) -> Vec<MountRecord> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some(MountRecord {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
            })
        })
        .collect()
}

/// Read the current mount table from the kernel.
pub fn current_mounts() -> io::Result<Vec<MountRecord>> {
    let content = fs::read_to_string("/proc/self/mounts")?;
    Ok(parse_mount_table(&content))
}

/// Mount records whose source is the given disk or one of its partitions.
pub fn mounts_for_device<'a>(disk: &Path, mounts: &'a [MountRecord]) -> Vec<&'a MountRecord> {
    let disk_str = disk.display().to_string();
    mounts
        .iter()
        .filter(|record| {
            let source = record.source.display().to_string();
            if source == disk_str {
                return true;
            }
            // Partition of this disk: the disk path followed by digits,
            // optionally with the nvme-style `p` separator.
            source
                .strip_prefix(&disk_str)
                .map(|rest| {
                    let rest = rest.strip_prefix('p').unwrap_or(rest);
                    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
                })
                .unwrap_or(false)
        })
        .collect()
}
