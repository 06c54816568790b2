//! Command-line interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// luksforge - encrypted LVM disk provisioning
#[derive(Parser)]
#[command(name = "luksforge")]
#[command(about = "Provisions a GPT + ESP + LUKS2 + LVM disk layout for UEFI installs")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: log the commands that would run without executing any.
    ///
    /// The target device is not touched or even required to exist; the
    /// volume-stage size query is answered with a simulated capacity.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the provisioning pipeline against the plan's target device
    Provision {
        /// Path to the JSON plan file
        #[arg(short, long)]
        config: PathBuf,

        /// Confirmation token for the destructive run; must equal the
        /// plan's device path exactly (e.g. --confirm /dev/sda)
        #[arg(long)]
        confirm: Option<String>,

        /// Simulated disk capacity for --dry-run (e.g. 40GiB)
        #[arg(long, default_value = "64GiB")]
        assume_size: String,
    },
    /// Validate a plan file
    Validate {
        /// Path to the JSON plan file
        config: PathBuf,
    },
    /// Print the ordered command sequence a plan would execute
    Plan {
        /// Path to the JSON plan file
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_provision_with_config_and_confirm() {
        let cli = Cli::try_parse_from([
            "luksforge",
            "provision",
            "--config",
            "/etc/luksforge/plan.json",
            "--confirm",
            "/dev/sda",
        ])
        .unwrap();
        match cli.command {
            Commands::Provision {
                config, confirm, ..
            } => {
                assert_eq!(config, PathBuf::from("/etc/luksforge/plan.json"));
                assert_eq!(confirm.as_deref(), Some("/dev/sda"));
            }
            _ => panic!("expected Provision command"),
        }
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_cli_global_dry_run_flag() {
        let cli = Cli::try_parse_from([
            "luksforge",
            "provision",
            "--config",
            "plan.json",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
    }

    #[test]
    fn test_cli_validate_positional_config() {
        let cli = Cli::try_parse_from(["luksforge", "validate", "plan.json"]).unwrap();
        match cli.command {
            Commands::Validate { config } => assert_eq!(config, PathBuf::from("plan.json")),
            _ => panic!("expected Validate command"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["luksforge"]).is_err());
    }
}
