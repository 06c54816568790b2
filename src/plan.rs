//! Installation plan: the immutable configuration driving a provisioning run.
//!
//! A plan is loaded once from a JSON file, validated, and then passed by
//! reference through every stage. Nothing mutates it after loading.
//!
//! Byte quantities are typed (`ByteSize`) instead of raw strings so the
//! sizing arithmetic (ESP offset, remainder policy, space checks) is done on
//! numbers, not on tool-specific suffix strings.

use anyhow::{Context, Result, bail};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

use crate::device;
use crate::error::ProvisionError;
use crate::secret::PassphraseSource;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// ============================================================================
// ByteSize
// ============================================================================

/// A byte quantity with binary-unit parsing and display.
///
/// Accepts `"512MiB"`, `"20GiB"`, `"1G"`, `"256M"` and similar; all suffixes
/// are binary (`K`/`M`/`G`/`T` mean KiB/MiB/GiB/TiB). Displays as the largest
/// exact binary unit (`20GiB`, `256MiB`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * GIB)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Whole MiB count. Callers must only use this on MiB-aligned sizes;
    /// plan validation enforces alignment for every configured quantity.
    pub const fn mib(self) -> u64 {
        self.0 / MIB
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_mib_aligned(self) -> bool {
        self.0 % MIB == 0
    }

    pub fn checked_add(self, other: ByteSize) -> Option<ByteSize> {
        self.0.checked_add(other.0).map(ByteSize)
    }

    pub fn checked_sub(self, other: ByteSize) -> Option<ByteSize> {
        self.0.checked_sub(other.0).map(ByteSize)
    }

    pub fn saturating_sub(self, other: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TIB: u64 = 1024 * GIB;
        const KIB: u64 = 1024;
        match self.0 {
            n if n >= TIB && n % TIB == 0 => write!(f, "{}TiB", n / TIB),
            n if n >= GIB && n % GIB == 0 => write!(f, "{}GiB", n / GIB),
            n if n >= MIB && n % MIB == 0 => write!(f, "{}MiB", n / MIB),
            n if n >= KIB && n % KIB == 0 => write!(f, "{}KiB", n / KIB),
            n => write!(f, "{}B", n),
        }
    }
}

/// Error for unparseable byte-size strings.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid size '{0}' (expected forms like 512MiB, 20GiB, 1G)")]
pub struct ParseByteSizeError(String);

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| ParseByteSizeError(s.to_string()))?;

        let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kib" | "kb" => 1024,
            "m" | "mib" | "mb" => MIB,
            "g" | "gib" | "gb" => GIB,
            "t" | "tib" | "tb" => 1024 * GIB,
            _ => return Err(ParseByteSizeError(s.to_string())),
        };

        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| ParseByteSizeError(s.to_string()))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

// ============================================================================
// Filesystem types
// ============================================================================

/// Filesystem type for provisioning targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    /// FAT32, required for the EFI System Partition.
    #[strum(serialize = "fat32")]
    Fat32,
    #[strum(serialize = "ext4")]
    Ext4,
    #[strum(serialize = "xfs")]
    Xfs,
}

impl FsType {
    /// The mkfs program for this filesystem.
    pub fn mkfs_program(self) -> &'static str {
        match self {
            FsType::Fat32 => "mkfs.fat",
            FsType::Ext4 => "mkfs.ext4",
            FsType::Xfs => "mkfs.xfs",
        }
    }

    /// Extra mkfs flags (force/quiet where the tool supports them).
    pub fn mkfs_flags(self) -> &'static [&'static str] {
        match self {
            FsType::Fat32 => &["-F32"],
            FsType::Ext4 => &["-q", "-F"],
            FsType::Xfs => &["-f", "-q"],
        }
    }

    /// The type string passed to mount(8). FAT32 mounts as vfat.
    pub fn mount_type(self) -> &'static str {
        match self {
            FsType::Fat32 => "vfat",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        }
    }

    /// Whether this is a journaling filesystem suitable for root/home.
    pub fn is_journaling(self) -> bool {
        matches!(self, FsType::Ext4 | FsType::Xfs)
    }
}

// ============================================================================
// Home sizing policy
// ============================================================================

/// Sizing policy for the home logical volume.
///
/// Root always gets a fixed capacity; home consumes the remainder, either
/// fully or minus a fixed reserve. Both variants from the source layouts are
/// kept as configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum HomeSizing {
    /// Home takes all free extents left after root.
    #[default]
    FullRemainder,
    /// Home takes the remainder minus a fixed reserve (snapshot/metadata
    /// headroom).
    RemainderMinusReserve { reserve: ByteSize },
}

impl HomeSizing {
    pub fn reserve(self) -> ByteSize {
        match self {
            HomeSizing::FullRemainder => ByteSize::from_bytes(0),
            HomeSizing::RemainderMinusReserve { reserve } => reserve,
        }
    }
}

// ============================================================================
// Mount plan
// ============================================================================

/// One mount in the final hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: FsType,
}

/// Ordered mount sequence. Construction rejects any ordering where a child
/// mount-point would be mounted before its parent.
#[derive(Debug, Clone)]
pub struct MountPlan {
    entries: Vec<MountEntry>,
}

impl MountPlan {
    pub fn new(entries: Vec<MountEntry>) -> crate::error::Result<Self> {
        for (i, entry) in entries.iter().enumerate() {
            for later in &entries[i + 1..] {
                if entry.target.starts_with(&later.target) && entry.target != later.target {
                    return Err(ProvisionError::config(format!(
                        "mount order violation: {} must be mounted before {}",
                        later.target.display(),
                        entry.target.display()
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }
}

// ============================================================================
// InstallPlan
// ============================================================================

fn default_esp_size() -> ByteSize {
    ByteSize::from_gib(1)
}

fn default_vg_name() -> String {
    "vg0".to_string()
}

fn default_mapper_name() -> String {
    "cryptlvm".to_string()
}

fn default_fs() -> FsType {
    FsType::Ext4
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt")
}

/// Immutable description of the target layout for one provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPlan {
    /// Target disk, e.g. `/dev/sda` or `/dev/nvme0n1`.
    pub device: PathBuf,

    /// EFI System Partition size (partition 1).
    #[serde(default = "default_esp_size")]
    pub esp_size: ByteSize,

    /// Volume group created on the opened LUKS container.
    #[serde(default = "default_vg_name")]
    pub vg_name: String,

    /// Device-mapper name for the opened container.
    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,

    /// Fixed capacity of the root logical volume.
    pub root_size: ByteSize,

    /// Remainder policy for the home logical volume.
    #[serde(default)]
    pub home_sizing: HomeSizing,

    #[serde(default = "default_fs")]
    pub root_fs: FsType,

    #[serde(default = "default_fs")]
    pub home_fs: FsType,

    /// Where the passphrase comes from. Never stored inline in the plan.
    pub passphrase: PassphraseSource,

    /// Root of the mount hierarchy the provisioned system lands under.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
}

impl InstallPlan {
    /// Load a plan from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan from {:?}", path.as_ref()))?;
        let plan: Self = serde_json::from_str(&content).context("Failed to parse plan JSON")?;
        Ok(plan)
    }

    /// Save a plan to a JSON file (pretty-printed).
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize plan")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write plan to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Validate the plan before any stage runs.
    pub fn validate(&self) -> Result<()> {
        let device = self.device.to_string_lossy();
        if !device.starts_with("/dev/") {
            bail!("invalid device path '{}', must start with /dev/", device);
        }

        if self.esp_size < ByteSize::from_mib(64) {
            bail!("ESP size {} is below the 64MiB minimum", self.esp_size);
        }
        if self.esp_size > ByteSize::from_gib(16) {
            bail!("ESP size {} is implausibly large (16GiB maximum)", self.esp_size);
        }
        if self.root_size.is_zero() {
            bail!("root size must be nonzero");
        }
        for (name, size) in [
            ("esp_size", self.esp_size),
            ("root_size", self.root_size),
            ("home reserve", self.home_sizing.reserve()),
        ] {
            if !size.is_mib_aligned() {
                bail!("{} ({}) must be a whole number of MiB", name, size);
            }
        }

        for (what, name) in [("vg_name", &self.vg_name), ("mapper_name", &self.mapper_name)] {
            if name.is_empty() {
                bail!("{} must not be empty", what);
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
            {
                bail!("{} '{}' contains characters LVM/device-mapper reject", what, name);
            }
        }

        for (what, fs) in [("root_fs", self.root_fs), ("home_fs", self.home_fs)] {
            if !fs.is_journaling() {
                bail!("{} must be a journaling filesystem (ext4 or xfs), got {}", what, fs);
            }
        }

        if !self.mount_root.is_absolute() {
            bail!("mount_root must be an absolute path");
        }

        Ok(())
    }

    /// Path of the root logical volume once created.
    pub fn root_lv_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/root", self.vg_name))
    }

    /// Path of the home logical volume once created.
    pub fn home_lv_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/home", self.vg_name))
    }

    /// Path of the opened LUKS container.
    pub fn mapper_path(&self) -> PathBuf {
        device::mapper_path(&self.mapper_name)
    }

    /// The mount hierarchy for this plan: root first, then `/boot` and
    /// `/home` inside it.
    pub fn mount_plan(&self) -> crate::error::Result<MountPlan> {
        MountPlan::new(vec![
            MountEntry {
                source: self.root_lv_path(),
                target: self.mount_root.clone(),
                fstype: self.root_fs,
            },
            MountEntry {
                source: device::partition_path(&self.device, 1),
                target: self.mount_root.join("boot"),
                fstype: FsType::Fat32,
            },
            MountEntry {
                source: self.home_lv_path(),
                target: self.mount_root.join("home"),
                fstype: self.home_fs,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_plan() -> InstallPlan {
        InstallPlan {
            device: PathBuf::from("/dev/sda"),
            esp_size: ByteSize::from_gib(1),
            vg_name: "vg0".to_string(),
            mapper_name: "cryptlvm".to_string(),
            root_size: ByteSize::from_gib(20),
            home_sizing: HomeSizing::FullRemainder,
            root_fs: FsType::Ext4,
            home_fs: FsType::Ext4,
            passphrase: PassphraseSource::Env {
                var: "LUKS_PASSPHRASE".to_string(),
            },
            mount_root: PathBuf::from("/mnt"),
        }
    }

    #[test]
    fn test_byte_size_parse() {
        assert_eq!("1GiB".parse::<ByteSize>().unwrap(), ByteSize::from_gib(1));
        assert_eq!("512MiB".parse::<ByteSize>().unwrap(), ByteSize::from_mib(512));
        assert_eq!("20G".parse::<ByteSize>().unwrap(), ByteSize::from_gib(20));
        assert_eq!("256M".parse::<ByteSize>().unwrap(), ByteSize::from_mib(256));
        assert_eq!("4096".parse::<ByteSize>().unwrap(), ByteSize::from_bytes(4096));
    }

    #[test]
    fn test_byte_size_parse_rejects_garbage() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("GiB".parse::<ByteSize>().is_err());
        assert!("12parsecs".parse::<ByteSize>().is_err());
        assert!("-1G".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_byte_size_display_uses_largest_exact_unit() {
        assert_eq!(ByteSize::from_gib(20).to_string(), "20GiB");
        assert_eq!(ByteSize::from_mib(256).to_string(), "256MiB");
        assert_eq!(ByteSize::from_mib(1536).to_string(), "1536MiB");
        assert_eq!(ByteSize::from_bytes(17).to_string(), "17B");
    }

    #[test]
    fn test_fs_type_mount_type() {
        assert_eq!(FsType::Fat32.mount_type(), "vfat");
        assert_eq!(FsType::Ext4.mount_type(), "ext4");
        assert_eq!(FsType::Xfs.mount_type(), "xfs");
    }

    #[test]
    fn test_plan_validate_accepts_default_shape() {
        assert!(test_plan().validate().is_ok());
    }

    #[test]
    fn test_plan_validate_rejects_non_dev_path() {
        let mut plan = test_plan();
        plan.device = PathBuf::from("sda");
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_validate_rejects_fat32_root() {
        let mut plan = test_plan();
        plan.root_fs = FsType::Fat32;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_validate_rejects_unaligned_reserve() {
        let mut plan = test_plan();
        plan.home_sizing = HomeSizing::RemainderMinusReserve {
            reserve: ByteSize::from_bytes(1000),
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_mount_plan_orders_root_first() {
        let plan = test_plan();
        let mounts = plan.mount_plan().unwrap();
        let targets: Vec<_> = mounts.entries().iter().map(|e| e.target.clone()).collect();
        assert_eq!(
            targets,
            vec![
                PathBuf::from("/mnt"),
                PathBuf::from("/mnt/boot"),
                PathBuf::from("/mnt/home"),
            ]
        );
    }

    #[test]
    fn test_mount_plan_rejects_child_before_parent() {
        let result = MountPlan::new(vec![
            MountEntry {
                source: PathBuf::from("/dev/vg0/home"),
                target: PathBuf::from("/mnt/home"),
                fstype: FsType::Ext4,
            },
            MountEntry {
                source: PathBuf::from("/dev/vg0/root"),
                target: PathBuf::from("/mnt"),
                fstype: FsType::Ext4,
            },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_home_sizing_json_shapes() {
        let full: HomeSizing = serde_json::from_str(r#"{"policy": "full_remainder"}"#).unwrap();
        assert_eq!(full, HomeSizing::FullRemainder);

        let reserved: HomeSizing =
            serde_json::from_str(r#"{"policy": "remainder_minus_reserve", "reserve": "256MiB"}"#)
                .unwrap();
        assert_eq!(
            reserved,
            HomeSizing::RemainderMinusReserve {
                reserve: ByteSize::from_mib(256)
            }
        );
    }
}
