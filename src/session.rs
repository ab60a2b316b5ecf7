//! Drives an upgrader through its stages around the installation step.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use strum::Display;

use crate::backup::BackupOutcome;
use crate::planner::PartitionTargets;
use crate::restore::RestoreReport;
use crate::upgrader::{
    BackupInput, CompleteUpgradeInput, PrepareTargetInput, PrepareTargetOutput,
    PrepareUpgradeInput, PreservedIdentity, StageEnv, Upgrader,
};

/// Steps of an upgrade, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    PrepareTarget,
    Backup,
    PrepareUpgrade,
    Install,
    CompleteUpgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub targets: PartitionTargets,
    /// Run the backup when the strategy leaves it to the operator.
    pub optional_backup: bool,
}

/// Everything the stages produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub target: PrepareTargetOutput,
    pub backup: Option<BackupOutcome>,
    pub identity: PreservedIdentity,
    pub restore: RestoreReport,
}

/// Runs every stage in order, aborting on the first failure.
///
/// `install` writes the new system and returns where its root is mounted.
/// Stage progress is forwarded to `progress` together with the stage.
pub fn run_upgrade<'a>(
    upgrader: &mut (dyn Upgrader + 'a),
    env: &mut StageEnv<'_>,
    options: &SessionOptions,
    install: impl FnOnce(&PreservedIdentity) -> Result<Utf8PathBuf>,
    progress: &mut dyn FnMut(Stage, u8),
) -> Result<SessionReport> {
    let descriptor = upgrader.descriptor().clone();
    let targets = options.targets;

    tracing::info!(strategy = %descriptor.kind, "preparing target");
    let target = upgrader
        .prepare_target(env, &PrepareTargetInput { targets }, &mut |p: u8| {
            progress(Stage::PrepareTarget, p)
        })
        .with_context(|| format!("{} failed", Stage::PrepareTarget))?;

    let backup = if descriptor.requires_backup || (descriptor.optional_backup && options.optional_backup) {
        tracing::info!("backing up existing installation");
        let outcome = upgrader
            .do_backup(env, &BackupInput { targets }, &mut |p: u8| progress(Stage::Backup, p))
            .with_context(|| format!("{} failed", Stage::Backup))?;
        Some(outcome)
    } else {
        tracing::info!("backup skipped");
        None
    };

    tracing::info!("preparing upgrade");
    let identity = upgrader
        .prepare_upgrade(env, &PrepareUpgradeInput::new(targets, &target), &mut |p: u8| {
            progress(Stage::PrepareUpgrade, p)
        })
        .with_context(|| format!("{} failed", Stage::PrepareUpgrade))?;

    progress(Stage::Install, 0);
    let root_mount = install(&identity).with_context(|| format!("{} failed", Stage::Install))?;
    progress(Stage::Install, 100);

    tracing::info!(root = %root_mount, "completing upgrade");
    let restore = upgrader
        .complete_upgrade(
            env,
            &CompleteUpgradeInput {
                root_mount,
                backup_partnum: targets.backup,
            },
        )
        .with_context(|| format!("{} failed", Stage::CompleteUpgrade))?;
    progress(Stage::CompleteUpgrade, 100);

    Ok(SessionReport {
        target,
        backup,
        identity,
        restore,
    })
}
