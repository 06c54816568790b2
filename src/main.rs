//! luksforge - main entry point.

use anyhow::Result;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use luksforge::cli::{Cli, Commands};
use luksforge::stages::partition::{AssumeVisible, DevNodeProbe};
use luksforge::{
    Backoff, ByteSize, DryRunRunner, InstallPlan, PlaceholderSecrets, ProvisionContext,
    SystemRunner, ValidationMode, preflight, provision, summary,
};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match cli.command {
        Commands::Validate { config } => {
            info!(path = %config.display(), "validating plan");
            let plan = load_plan(&config)?;
            match plan.validate() {
                Ok(()) => {
                    println!("✓ Plan is valid: {}", config.display());
                }
                Err(err) => {
                    error!(%err, "plan validation failed");
                    eprintln!("✗ Plan validation failed: {err}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Plan { config } => {
            let plan = load_plan(&config)?;
            plan.validate()?;
            println!("{}", summary(&plan)?);
        }
        Commands::Provision {
            config,
            confirm,
            assume_size,
        } => {
            let plan = load_plan(&config)?;
            plan.validate()?;
            run_provision(&plan, confirm.as_deref(), cli.dry_run, &assume_size)?;
        }
    }

    Ok(())
}

fn load_plan(config: &std::path::Path) -> Result<InstallPlan> {
    let plan = InstallPlan::load_from_file(config)?;
    Ok(plan)
}

fn run_provision(
    plan: &InstallPlan,
    confirmation: Option<&str>,
    dry_run: bool,
    assume_size: &str,
) -> Result<()> {
    let secrets = plan.passphrase.clone();
    let result = if dry_run {
        let size: ByteSize = assume_size
            .parse()
            .map_err(|err| anyhow::anyhow!("--assume-size: {err}"))?;
        info!(simulated = %size, "dry run: no command will be executed");
        let runner = DryRunRunner::new(size);
        let ctx = ProvisionContext {
            runner: &runner,
            secrets: &PlaceholderSecrets,
            probe: &AssumeVisible,
            settle: Backoff::settle(),
            validation: ValidationMode::Preview,
            create_mount_dirs: false,
        };
        provision(plan, confirmation, &ctx)
    } else {
        if let Err(report) = preflight::run_preflight_checks() {
            eprintln!("✗ Pre-flight checks failed:\n{report}");
            std::process::exit(1);
        }
        let runner = SystemRunner;
        let ctx = ProvisionContext {
            runner: &runner,
            secrets: &secrets,
            probe: &DevNodeProbe,
            settle: Backoff::settle(),
            validation: ValidationMode::Live,
            create_mount_dirs: true,
        };
        provision(plan, confirmation, &ctx)
    };

    match result {
        Ok(provisioned) => {
            if dry_run {
                println!("✓ Dry run complete for {}; no command was executed", plan.device.display());
            } else {
                println!("✓ Provisioning complete on {}", plan.device.display());
            }
            println!("  LUKS mapping: {}", provisioned.mapped_device.display());
            println!(
                "  Volume group {}: root {} / home {}",
                provisioned.volume_group.name,
                provisioned.volume_group.root.size,
                provisioned.volume_group.home.size
            );
            for target in &provisioned.mounted {
                println!("  mounted: {}", target.display());
            }
            Ok(())
        }
        Err(err) => {
            error!(%err, "provisioning aborted");
            eprintln!("✗ Provisioning aborted: {err}");
            std::process::exit(1);
        }
    }
}
