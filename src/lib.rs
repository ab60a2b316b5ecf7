pub mod backup;
pub mod cli;
pub mod config;
pub mod disk;
pub mod error;
pub mod executor;
pub mod host;
pub mod installation;
pub mod keyvalue;
pub mod planner;
pub mod registry;
pub mod restore;
pub mod session;
pub mod upgrader;
pub mod version;

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::config::Scenario;
use crate::disk::{DiskDescription, MemoryDisk, PartitionTool};
use crate::executor::CommandExecutor;
use crate::host::CommandHost;
use crate::planner::{DiskSnapshot, plan_layout};
use crate::registry::Registry;
use crate::upgrader::{CompleteUpgradeInput, StageEnv, apply_plan};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

fn load(opts: &cli::ScenarioArgs) -> Result<Scenario> {
    config::load_scenario(&opts.file)
        .with_context(|| format!("failed to load scenario from {}", opts.file))
}

/// Describes which upgrader, if any, handles the scenario's installation.
pub fn check_report(scenario: &Scenario) -> String {
    let registry = Registry::for_product(&scenario.config);
    let src = &scenario.installation;
    match registry.resolve_installation(src) {
        Ok(d) => format!(
            "{} {} ({}) on {}: upgrade available via {}\n  \
             requires backup: {}\n  optional backup: {}\n  \
             prompt for target: {}\n  repartition: {}\n",
            src.product,
            src.version,
            src.variant,
            src.primary_disk,
            d.kind,
            d.requires_backup,
            d.optional_backup,
            d.prompt_for_target,
            d.repartition
        ),
        Err(e) => format!("{}\n", e),
    }
}

/// Plans the OEM layout for the scenario's disk and applies it to an
/// in-memory copy, describing both the plan and the resulting table.
pub fn plan_report(scenario: &Scenario) -> Result<String> {
    let desc = scenario
        .disk
        .as_ref()
        .context("scenario has no disk description to plan against")?;
    let (mut disk, mut volumes) = MemoryDisk::from_description(desc)?;

    let snapshot = DiskSnapshot::capture(&disk, &volumes)?;
    let plan = plan_layout(&snapshot, &scenario.targets, &scenario.config.plan_params()?)?;

    let mut out = String::new();
    writeln!(out, "layout plan for {}{}:", desc.device, if plan.oem_hdd { " (OEM HDD)" } else { "" })?;
    for (number, disposition) in &plan.dispositions {
        writeln!(out, "  partition {}: {}", number, disposition)?;
    }
    writeln!(out, "  root:   start {} size {}", plan.root_start, plan.root_size)?;
    writeln!(out, "  backup: start {} size {}", plan.backup_start, plan.backup_size)?;
    if !plan.post_backup_delete.is_empty() {
        writeln!(out, "  delete after backup: {:?}", plan.post_backup_delete)?;
    }

    let mut installation = scenario.installation.clone();
    apply_plan(&plan, &scenario.targets, &mut disk, &mut volumes, &mut installation, &mut |_: u8| {})?;

    writeln!(out, "resulting partition table:")?;
    for (number, p) in disk.partitions() {
        writeln!(
            out,
            "  {}: start {} end {} size {} id {}{}",
            disk.partition_device(number),
            p.start,
            p.end(),
            p.size,
            p.id,
            if p.active { " active" } else { "" }
        )?;
    }
    if let Some(state) = &installation.state_device {
        writeln!(out, "state device after renames: {}", state)?;
    }
    Ok(out)
}

pub fn run_check(opts: &cli::ScenarioArgs) -> Result<()> {
    let scenario = load(opts)?;
    print!("{}", check_report(&scenario));
    Ok(())
}

pub fn run_plan(opts: &cli::ScenarioArgs) -> Result<()> {
    let scenario = load(opts)?;
    print!("{}", plan_report(&scenario)?);
    Ok(())
}

pub fn run_validate(opts: &cli::ScenarioArgs) -> Result<()> {
    let scenario = load(opts)?;
    info!("validation successful:\n{:#?}", scenario);
    Ok(())
}

/// Runs the completion stage against the installation described by the scenario.
pub fn run_complete(opts: &cli::CompleteArgs, executor: Arc<dyn CommandExecutor>) -> Result<()> {
    let mut scenario = load(&opts.scenario)?;
    let registry = Registry::for_product(&scenario.config);
    let desc = scenario.disk.clone().unwrap_or_else(|| DiskDescription {
        device: scenario.installation.primary_disk.clone(),
        size: 0,
        sector_size: 512,
        partitions: Vec::new(),
        volumes: Vec::new(),
    });
    let (mut disk, mut volumes) = MemoryDisk::from_description(&desc)?;
    let host = CommandHost::new(executor);
    let config = scenario.config.clone();
    let backup_partnum = scenario.targets.backup;

    let mut upgrader = registry.instantiate(&mut scenario.installation)?;
    let mut env = StageEnv {
        host: &host,
        partitions: &mut disk,
        volumes: &mut volumes,
        config: &config,
        oem_backend: None,
        dry_run: opts.dry_run,
    };
    let report = upgrader.complete_upgrade(
        &mut env,
        &CompleteUpgradeInput {
            root_mount: opts.root.clone(),
            backup_partnum,
        },
    )?;

    if opts.dry_run {
        info!("dry run finished, nothing was written to {}", opts.root);
        return Ok(());
    }
    info!(
        restored = report.restored.len(),
        missing = report.missing.len(),
        "upgrade completed in {}",
        opts.root
    );
    Ok(())
}
