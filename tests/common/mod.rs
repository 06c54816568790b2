//! Shared test support: a scripted command runner that records every
//! command the pipeline issues and answers from a canned response function,
//! so the full pipeline runs without root, disks, or external tools.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;

use luksforge::{
    Backoff, ByteSize, CommandOutput, CommandRunner, DiskCommand, FsType, HomeSizing, InstallPlan,
    Passphrase, PassphraseSource, Result, SecretProvider,
};

type Responder = Box<dyn Fn(&DiskCommand) -> CommandOutput + Send + Sync>;

/// Records issued commands and responds from a scripted function.
pub struct ScriptedRunner {
    log: Mutex<Vec<DiskCommand>>,
    respond: Responder,
}

impl ScriptedRunner {
    pub fn new(respond: impl Fn(&DiskCommand) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    /// Every command succeeds; the size query reports `mapped_size`.
    pub fn succeeding(mapped_size: ByteSize) -> Self {
        Self::new(move |command| match command {
            DiskCommand::BlockDeviceSize { .. } => {
                CommandOutput::ok_with_stdout(format!("{}\n", mapped_size.bytes()))
            }
            _ => CommandOutput::ok(),
        })
    }

    /// Everything the pipeline has issued so far, in order.
    pub fn commands(&self) -> Vec<DiskCommand> {
        self.log.lock().unwrap().clone()
    }

    /// Index of the first command matching the predicate.
    pub fn position(&self, pred: impl Fn(&DiskCommand) -> bool) -> Option<usize> {
        self.commands().iter().position(|c| pred(c))
    }

    pub fn count(&self, pred: impl Fn(&DiskCommand) -> bool) -> usize {
        self.commands().iter().filter(|c| pred(c)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &DiskCommand) -> Result<CommandOutput> {
        self.log.lock().unwrap().push(command.clone());
        Ok((self.respond)(command))
    }
}

/// Yields one fixed passphrase and declines every re-prompt.
pub struct TestSecrets;

impl SecretProvider for TestSecrets {
    fn passphrase(&self, attempt: u32) -> Result<Option<Passphrase>> {
        if attempt == 0 {
            Ok(Some(Passphrase::new("test-passphrase")))
        } else {
            Ok(None)
        }
    }
}

/// The spec scenario plan: 1 GiB ESP, 20 GiB root, home = remainder minus
/// a 256 MiB reserve, everything ext4 on /dev/sda.
pub fn scenario_plan(mount_root: &Path) -> InstallPlan {
    InstallPlan {
        device: "/dev/sda".into(),
        esp_size: ByteSize::from_gib(1),
        vg_name: "vg0".to_string(),
        mapper_name: "cryptlvm".to_string(),
        root_size: ByteSize::from_gib(20),
        home_sizing: HomeSizing::RemainderMinusReserve {
            reserve: ByteSize::from_mib(256),
        },
        root_fs: FsType::Ext4,
        home_fs: FsType::Ext4,
        passphrase: PassphraseSource::Env {
            var: "LUKSFORGE_TEST_PASSPHRASE".to_string(),
        },
        mount_root: mount_root.to_path_buf(),
    }
}

/// A backoff policy that keeps failing tests fast.
pub fn fast_settle() -> Backoff {
    Backoff::new(
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(2),
        std::time::Duration::from_millis(20),
    )
}
