//! Error handling for luksforge.
//!
//! One central error type covering every pipeline stage, using thiserror.
//! Each variant names the device or target it concerns, so a failure report
//! identifies what was being touched when the run aborted.

use std::path::PathBuf;
use thiserror::Error;

use crate::plan::ByteSize;

/// Errors raised by plan validation and the provisioning pipeline.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The target path is missing or not a block device.
    #[error("device not found or not a block device: {}", .device.display())]
    DeviceNotFound { device: PathBuf },

    /// The target device (or one of its partitions) is currently mounted.
    #[error("{} is mounted at {}, unmount it before provisioning", .device.display(), .target.display())]
    AlreadyMounted { device: PathBuf, target: PathBuf },

    /// The destructive-operation confirmation token was missing or wrong.
    #[error("refusing to provision {}: confirmation token does not match the device path", .device.display())]
    NotConfirmed { device: PathBuf },

    /// Partitioning tool failure or partition re-enumeration timeout.
    #[error("partitioning {} failed: {detail}", .device.display())]
    Partitioning { device: PathBuf, detail: String },

    /// LUKS format or open failed for a reason other than authentication.
    #[error("encryption setup on {} failed: {detail}", .device.display())]
    EncryptionSetup { device: PathBuf, detail: String },

    /// LUKS open rejected the passphrase.
    #[error("wrong passphrase for {}", .device.display())]
    WrongPassphrase { device: PathBuf },

    /// Requested logical volume sizes cannot fit the volume group.
    #[error("insufficient space: requested {requested}, available {available}")]
    InsufficientSpace {
        requested: ByteSize,
        available: ByteSize,
    },

    /// LVM tool failure while building the volume stack.
    #[error("volume operation on {target} failed: {detail}")]
    Volume { target: String, detail: String },

    /// Filesystem creation failed for a target.
    #[error("formatting {} failed: {detail}", .target.display())]
    Format { target: PathBuf, detail: String },

    /// Mounting a target failed (already-performed mounts are unwound).
    #[error("mounting {} failed: {detail}", .target.display())]
    Mount { target: PathBuf, detail: String },

    /// Plan file loading or validation errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors (keyfiles, mount-point creation, /proc reads).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for luksforge operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a partitioning error for a device.
    pub fn partitioning(device: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Partitioning {
            device: device.into(),
            detail: detail.into(),
        }
    }

    /// Create a volume-stage error for a named target.
    pub fn volume(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Volume {
            target: target.into(),
            detail: detail.into(),
        }
    }
}
