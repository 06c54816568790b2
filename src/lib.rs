//! luksforge library
//!
//! Core of the encrypted-LVM disk provisioner: the typed installation plan,
//! the privileged command vocabulary, and the five-stage pipeline
//! (validate, partition, encrypt, volume-manage, provision filesystems).

pub mod cli;
pub mod device;
pub mod error;
pub mod plan;
pub mod preflight;
pub mod retry;
pub mod runner;
pub mod secret;
pub mod stages;

// Re-export the main types for convenience
pub use error::{ProvisionError, Result};
pub use plan::{ByteSize, FsType, HomeSizing, InstallPlan, MountEntry, MountPlan};
pub use retry::Backoff;
pub use runner::{
    CommandOutput, CommandRunner, DiskCommand, DryRunRunner, PartitionEnd, PartitionFlag,
    SystemRunner,
};
pub use secret::{Passphrase, PassphraseSource, PlaceholderSecrets, SecretFile, SecretProvider};
pub use stages::encrypt::EncryptedVolume;
pub use stages::filesystems::{FilesystemProvisioner, MountStack};
pub use stages::partition::{
    AssumeVisible, DevNodeProbe, PartitionEntry, PartitionProbe, PartitionRole, PartitionTable,
};
pub use stages::volumes::{LogicalVolume, VolumeGroup, home_capacity};
pub use stages::{
    preview_commands, provision, summary, ProvisionContext, Provisioned, ValidationMode,
};
