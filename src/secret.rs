//! Passphrase handling for the encryption stage.
//!
//! The passphrase is never placed on a command line (visible in `ps`) and
//! never logged. It travels from a `SecretProvider` into a 0600 keyfile on
//! tmpfs whose content is overwritten with zeros and unlinked when the
//! handle drops, even on error paths.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

// ============================================================================
// Passphrase
// ============================================================================

/// A passphrase value. Debug/Display are redacted.
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

// ============================================================================
// SecretProvider
// ============================================================================

/// Collaborator supplying the encryption passphrase.
///
/// `attempt` 0 is the initial request; attempts above 0 happen only after
/// LUKS open rejected the previous passphrase. Returning `None` declines the
/// retry and lets the authentication error surface. Non-interactive sources
/// decline every re-prompt so a wrong value is never silently resubmitted.
pub trait SecretProvider {
    fn passphrase(&self, attempt: u32) -> Result<Option<Passphrase>>;
}

/// Where a plan's passphrase comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PassphraseSource {
    /// Read from a file (trailing newline stripped).
    File { path: PathBuf },
    /// Read from an environment variable.
    Env { var: String },
}

impl SecretProvider for PassphraseSource {
    fn passphrase(&self, attempt: u32) -> Result<Option<Passphrase>> {
        if attempt > 0 {
            // A static source re-reads to the same value; retrying it would
            // just fail authentication again.
            return Ok(None);
        }
        match self {
            PassphraseSource::File { path } => {
                let raw = fs::read_to_string(path)?;
                Ok(Some(Passphrase::new(
                    raw.strip_suffix('\n').unwrap_or(&raw).to_string(),
                )))
            }
            PassphraseSource::Env { var } => match std::env::var(var) {
                Ok(value) => Ok(Some(Passphrase::new(value))),
                Err(_) => Err(crate::error::ProvisionError::config(format!(
                    "passphrase environment variable {var} is not set"
                ))),
            },
        }
    }
}

/// Provider for dry runs: yields a fixed placeholder so the preview can
/// proceed without touching any real secret material.
pub struct PlaceholderSecrets;

impl SecretProvider for PlaceholderSecrets {
    fn passphrase(&self, attempt: u32) -> Result<Option<Passphrase>> {
        if attempt == 0 {
            Ok(Some(Passphrase::new("dry-run-placeholder")))
        } else {
            Ok(None)
        }
    }
}

// ============================================================================
// SecretFile
// ============================================================================

/// RAII keyfile holding the passphrase for cryptsetup.
///
/// Created with mode 0600 under /tmp (tmpfs on install media, so
/// RAM-backed). On drop the content is overwritten with zeros before the
/// file is unlinked, including on panic unwinding.
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
    size: usize,
}

impl SecretFile {
    pub fn new(passphrase: &Passphrase) -> std::io::Result<Self> {
        // Unique name; create_new below fails on collision rather than
        // reusing someone else's file.
        let tag: u64 = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ u64::from(std::process::id());
        let path = PathBuf::from(format!("/tmp/.luksforge_key_{:016x}", tag));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(passphrase.as_str().as_bytes())?;
        file.sync_all()?;

        debug!(path = %path.display(), "keyfile created");

        Ok(Self {
            path,
            size: passphrase.as_str().len(),
        })
    }

    /// Keyfile path to hand to cryptsetup.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wipe(&self) {
        if let Ok(mut file) = OpenOptions::new().write(true).open(&self.path) {
            let zeros = vec![0u8; self.size];
            let _ = file.write_all(&zeros);
            let _ = file.sync_all();
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove keyfile");
        } else {
            debug!(path = %self.path.display(), "keyfile wiped");
        }
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        self.wipe();
    }
}
