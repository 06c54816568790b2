//! Pre-flight environment checks.
//!
//! Verifies the runtime environment before a real provisioning run:
//! - required external tools are present,
//! - running with root privileges (EUID 0).
//!
//! Dry runs skip preflight entirely; they execute nothing.

use std::process::Command;
use tracing::{debug, warn};

/// Result of environment verification.
#[derive(Debug)]
pub struct PreflightReport {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

/// Tools every pipeline stage may invoke.
const REQUIRED_BINARIES: &[&str] = &[
    "wipefs",     // signature removal (util-linux)
    "parted",     // GPT label + partitions
    "partprobe",  // kernel table re-read (parted package)
    "cryptsetup", // LUKS format/open/close
    "pvcreate",   // LVM physical volume (lvm2)
    "vgcreate",   // LVM volume group (lvm2)
    "lvcreate",   // LVM logical volumes (lvm2)
    "lvreduce",   // reserve policy (lvm2)
    "mkfs.fat",   // ESP (dosfstools)
    "mkfs.ext4",  // root/home (e2fsprogs)
    "blockdev",   // size query (util-linux)
    "mount",
    "umount",
];

fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Check binaries and privileges, returning the full report.
pub fn verify_environment() -> PreflightReport {
    let missing = REQUIRED_BINARIES
        .iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| (*binary).to_string())
        .collect();

    PreflightReport {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Skip the root requirement (development/testing).
/// Set LUKSFORGE_SKIP_ROOT_CHECK=1 to skip.
pub fn should_skip_root_check() -> bool {
    std::env::var("LUKSFORGE_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run preflight and return a human-readable failure summary, if any.
pub fn run_preflight_checks() -> Result<(), String> {
    debug!("running pre-flight checks");
    let mut report = verify_environment();

    if should_skip_root_check() && !report.is_root {
        warn!("root check skipped (LUKSFORGE_SKIP_ROOT_CHECK=1)");
        report.is_root = true;
    }

    if report.is_ok() {
        debug!("pre-flight checks passed");
        return Ok(());
    }

    let mut lines = Vec::new();
    if !report.is_root {
        lines.push(
            "root privileges required: provisioning partitions, LUKS and LVM needs EUID 0"
                .to_string(),
        );
    }
    if !report.missing_binaries.is_empty() {
        lines.push(format!(
            "missing required tools: {}",
            report.missing_binaries.join(", ")
        ));
    }
    Err(lines.join("\n"))
}
