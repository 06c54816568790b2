//! End-to-end pipeline properties, driven through a scripted runner.
//!
//! These tests exercise the full provisioning sequence (ordering
//! invariants, proactive space checking, failure unwinding) without
//! touching a real disk.

mod common;

use common::{ScriptedRunner, TestSecrets, fast_settle, scenario_plan};
use luksforge::stages::partition::{AssumeVisible, PartitionProbe, PartitionTable};
use luksforge::{
    ByteSize, CommandOutput, DiskCommand, ProvisionContext, ProvisionError, ValidationMode,
    provision,
};
use std::path::PathBuf;

fn preview_ctx<'a>(runner: &'a ScriptedRunner) -> ProvisionContext<'a> {
    ProvisionContext {
        runner,
        secrets: &TestSecrets,
        probe: &AssumeVisible,
        settle: fast_settle(),
        validation: ValidationMode::Preview,
        create_mount_dirs: true,
    }
}

fn is_mount_on(command: &DiskCommand, target: &PathBuf) -> bool {
    matches!(command, DiskCommand::Mount { target: t, .. } if t == target)
}

// =============================================================================
// Happy path: the 40 GiB scenario
// =============================================================================

#[test]
fn test_scenario_40gib_layout_and_sizing() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());

    // 40 GiB disk minus the 1 GiB ESP: the mapped container reports 39 GiB.
    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    let provisioned = provision(&plan, None, &preview_ctx(&runner)).unwrap();

    // home = 39GiB - 4MiB metadata allowance - 20GiB root - 256MiB reserve
    assert_eq!(
        provisioned.volume_group.home.size,
        ByteSize::from_mib(19 * 1024 - 260)
    );
    assert_eq!(provisioned.volume_group.root.size, ByteSize::from_gib(20));
    assert_eq!(
        provisioned.mapped_device,
        PathBuf::from("/dev/mapper/cryptlvm")
    );

    // Final hierarchy: / <- root LV, /boot <- ESP, /home <- home LV.
    assert_eq!(
        provisioned.mounted,
        vec![
            dir.path().to_path_buf(),
            dir.path().join("boot"),
            dir.path().join("home"),
        ]
    );

    // The reserve policy is realized as an lv-reduce of home.
    assert_eq!(
        runner.count(|c| matches!(
            c,
            DiskCommand::LvReduce { lv_name, by, .. }
                if lv_name == "home" && *by == ByteSize::from_mib(256)
        )),
        1
    );

    // Success leaves the mapping open and the hierarchy mounted.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksClose { .. })), 0);
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::Umount { .. })), 0);
}

#[test]
fn test_stage_ordering_is_strictly_forward() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());
    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    provision(&plan, None, &preview_ctx(&runner)).unwrap();

    let wipe = runner
        .position(|c| matches!(c, DiskCommand::WipeSignatures { .. }))
        .unwrap();
    let luks_format = runner
        .position(|c| matches!(c, DiskCommand::LuksFormat { .. }))
        .unwrap();
    let luks_open = runner
        .position(|c| matches!(c, DiskCommand::LuksOpen { .. }))
        .unwrap();
    let size_query = runner
        .position(|c| matches!(c, DiskCommand::BlockDeviceSize { .. }))
        .unwrap();
    let pv = runner
        .position(|c| matches!(c, DiskCommand::PvCreate { .. }))
        .unwrap();
    let vg = runner
        .position(|c| matches!(c, DiskCommand::VgCreate { .. }))
        .unwrap();
    let first_mkfs = runner
        .position(|c| matches!(c, DiskCommand::Mkfs { .. }))
        .unwrap();
    let first_mount = runner
        .position(|c| matches!(c, DiskCommand::Mount { .. }))
        .unwrap();

    assert_eq!(wipe, 0, "signature wipe must be the first command");
    assert!(wipe < luks_format);
    assert!(luks_format < luks_open);
    assert!(luks_open < size_query);
    assert!(size_query < pv);
    assert!(pv < vg);
    assert!(vg < first_mkfs);
    assert!(first_mkfs < first_mount);
}

#[test]
fn test_root_lv_created_before_home_lv() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());
    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    provision(&plan, None, &preview_ctx(&runner)).unwrap();

    let root = runner
        .position(|c| matches!(c, DiskCommand::LvCreateFixed { lv_name, .. } if lv_name == "root"))
        .unwrap();
    let home = runner
        .position(
            |c| matches!(c, DiskCommand::LvCreateRemainder { lv_name, .. } if lv_name == "home"),
        )
        .unwrap();
    assert!(root < home, "remainder sizing requires root to exist first");
}

#[test]
fn test_no_child_mount_before_parent() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());
    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    provision(&plan, None, &preview_ctx(&runner)).unwrap();

    let root = runner
        .position(|c| is_mount_on(c, &dir.path().to_path_buf()))
        .unwrap();
    let boot = runner
        .position(|c| is_mount_on(c, &dir.path().join("boot")))
        .unwrap();
    let home = runner
        .position(|c| is_mount_on(c, &dir.path().join("home")))
        .unwrap();

    assert!(root < boot);
    assert!(root < home);
}

// =============================================================================
// Capacity planning
// =============================================================================

#[test]
fn test_oversized_root_fails_before_any_creation_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = scenario_plan(dir.path());
    plan.root_size = ByteSize::from_gib(100);

    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    assert!(matches!(err, ProvisionError::InsufficientSpace { .. }));

    // Only the size query ran in the volume stage; nothing was created.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::BlockDeviceSize { .. })), 1);
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::PvCreate { .. })), 0);
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::VgCreate { .. })), 0);
    assert_eq!(
        runner.count(|c| {
            matches!(
                c,
                DiskCommand::LvCreateFixed { .. } | DiskCommand::LvCreateRemainder { .. }
            )
        }),
        0
    );

    // The mapping this run opened is closed on the abort path.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksClose { .. })), 1);
}

// =============================================================================
// Encryption failures
// =============================================================================

#[test]
fn test_wrong_passphrase_leaves_no_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());

    let runner = ScriptedRunner::new(|command| match command {
        DiskCommand::LuksOpen { .. } => {
            CommandOutput::failed(2, "No key available with this passphrase.")
        }
        _ => CommandOutput::ok(),
    });

    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    assert!(matches!(err, ProvisionError::WrongPassphrase { .. }));

    // The static provider declines a re-prompt: one open attempt only, the
    // same value is never silently resubmitted.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksOpen { .. })), 1);

    // Open never succeeded, so there is no mapping and nothing to close.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksClose { .. })), 0);
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::PvCreate { .. })), 0);
}

#[test]
fn test_luks_format_failure_is_encryption_setup() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());

    let runner = ScriptedRunner::new(|command| match command {
        DiskCommand::LuksFormat { .. } => CommandOutput::failed(1, "Device or resource busy"),
        _ => CommandOutput::ok(),
    });

    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    match err {
        ProvisionError::EncryptionSetup { device, detail } => {
            assert_eq!(device, PathBuf::from("/dev/sda2"));
            assert!(detail.contains("busy"));
        }
        other => panic!("expected EncryptionSetup, got {other:?}"),
    }
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksOpen { .. })), 0);
}

// =============================================================================
// Partitioning failures
// =============================================================================

#[test]
fn test_partition_tool_failure_aborts_whole_run() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());

    let runner = ScriptedRunner::new(|command| match command {
        DiskCommand::CreateGptLabel { .. } => CommandOutput::failed(1, "unrecognised disk label"),
        _ => CommandOutput::ok(),
    });

    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    assert!(matches!(err, ProvisionError::Partitioning { .. }));
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksFormat { .. })), 0);
}

#[test]
fn test_partition_visibility_timeout_is_partitioning_error() {
    struct NeverVisible;
    impl PartitionProbe for NeverVisible {
        fn visible(&self, _table: &PartitionTable) -> bool {
            false
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());
    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    let ctx = ProvisionContext {
        probe: &NeverVisible,
        ..preview_ctx(&runner)
    };

    let err = provision(&plan, None, &ctx).unwrap_err();
    match err {
        ProvisionError::Partitioning { device, detail } => {
            assert_eq!(device, PathBuf::from("/dev/sda"));
            assert!(detail.contains("re-enumeration"));
        }
        other => panic!("expected Partitioning, got {other:?}"),
    }
    // The pipeline stopped before encryption.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksFormat { .. })), 0);
}

// =============================================================================
// Filesystem-stage failures and unwinding
// =============================================================================

#[test]
fn test_failed_home_mount_unwinds_in_reverse_order() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());
    let home_target = dir.path().join("home");

    let failing = home_target.clone();
    let runner = ScriptedRunner::new(move |command| match command {
        DiskCommand::BlockDeviceSize { .. } => {
            CommandOutput::ok_with_stdout(format!("{}\n", ByteSize::from_gib(39).bytes()))
        }
        DiskCommand::Mount { target, .. } if *target == failing => {
            CommandOutput::failed(32, "mount: wrong fs type")
        }
        _ => CommandOutput::ok(),
    });

    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    match err {
        ProvisionError::Mount { target, .. } => assert_eq!(target, home_target),
        other => panic!("expected Mount, got {other:?}"),
    }

    // Reverse-order unwind: boot unmounted before root, after the failed
    // home mount; then the mapping is closed.
    let commands = runner.commands();
    let failed_mount = runner
        .position(|c| is_mount_on(c, &home_target))
        .unwrap();
    let umounts: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, DiskCommand::Umount { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(umounts.len(), 2, "both prior mounts must be unwound");
    assert!(umounts[0] > failed_mount);
    match (&commands[umounts[0]], &commands[umounts[1]]) {
        (DiskCommand::Umount { target: first }, DiskCommand::Umount { target: second }) => {
            assert_eq!(*first, dir.path().join("boot"));
            assert_eq!(*second, dir.path().to_path_buf());
        }
        _ => unreachable!(),
    }

    let close = runner
        .position(|c| matches!(c, DiskCommand::LuksClose { .. }))
        .unwrap();
    assert!(close > umounts[1], "mapping closes after the unwind");
}

#[test]
fn test_format_failure_names_target_and_closes_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let plan = scenario_plan(dir.path());

    let runner = ScriptedRunner::new(|command| match command {
        DiskCommand::BlockDeviceSize { .. } => {
            CommandOutput::ok_with_stdout(format!("{}\n", ByteSize::from_gib(39).bytes()))
        }
        DiskCommand::Mkfs { device, .. } if device.ends_with("root") => {
            CommandOutput::failed(1, "mkfs.ext4: short write")
        }
        _ => CommandOutput::ok(),
    });

    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    match err {
        ProvisionError::Format { target, .. } => {
            assert_eq!(target, PathBuf::from("/dev/vg0/root"));
        }
        other => panic!("expected Format, got {other:?}"),
    }

    // Nothing was mounted yet, so no unmounts; the mapping still closes.
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::Mount { .. })), 0);
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::Umount { .. })), 0);
    assert_eq!(runner.count(|c| matches!(c, DiskCommand::LuksClose { .. })), 1);
}

// =============================================================================
// Live validation
// =============================================================================

#[test]
fn test_live_run_requires_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = scenario_plan(dir.path());
    plan.device = PathBuf::from("/dev/null");

    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    let ctx = ProvisionContext {
        validation: ValidationMode::Live,
        ..preview_ctx(&runner)
    };

    let err = provision(&plan, None, &ctx).unwrap_err();
    assert!(matches!(err, ProvisionError::NotConfirmed { .. }));
    assert!(runner.commands().is_empty(), "no command may run unconfirmed");

    let err = provision(&plan, Some("/dev/sdb"), &ctx).unwrap_err();
    assert!(matches!(err, ProvisionError::NotConfirmed { .. }));
}

#[test]
fn test_live_run_rejects_non_block_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = scenario_plan(dir.path());
    // A character device: exists, but is not a disk.
    plan.device = PathBuf::from("/dev/null");

    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    let ctx = ProvisionContext {
        validation: ValidationMode::Live,
        ..preview_ctx(&runner)
    };

    let err = provision(&plan, Some("/dev/null"), &ctx).unwrap_err();
    assert!(matches!(err, ProvisionError::DeviceNotFound { .. }));
    assert!(runner.commands().is_empty());
}

#[test]
fn test_invalid_plan_rejected_before_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = scenario_plan(dir.path());
    plan.device = PathBuf::from("sda");

    let runner = ScriptedRunner::succeeding(ByteSize::from_gib(39));
    let err = provision(&plan, None, &preview_ctx(&runner)).unwrap_err();
    assert!(matches!(err, ProvisionError::Config(_)));
    assert!(runner.commands().is_empty());
}
