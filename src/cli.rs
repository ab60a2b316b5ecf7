use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report which upgrader handles the described installation
    Check(ScenarioArgs),

    /// Preview the partition layout changes on an in-memory copy of the disk
    Plan(ScenarioArgs),

    /// Validate the given YAML scenario
    Validate(ScenarioArgs),

    /// Restore preserved state from the backup partition into a new root
    Complete(CompleteArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

impl Commands {
    /// Log level requested by the subcommand, if it takes one.
    pub fn log_level(&self) -> Option<LogLevel> {
        match self {
            Self::Check(opts) | Self::Plan(opts) | Self::Validate(opts) => Some(opts.log_level),
            Self::Complete(opts) => Some(opts.scenario.log_level),
            Self::Completions(_) => None,
        }
    }
}

#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Path to the YAML file describing the upgrade scenario
    #[arg(short, long, default_value = "scenario.yml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct CompleteArgs {
    #[command(flatten)]
    pub scenario: ScenarioArgs,

    /// Mount point of the newly installed root filesystem
    #[arg(long)]
    pub root: Utf8PathBuf,

    /// Do not run commands, just show what would be done
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Verbosity of the log output, mapped onto `tracing` levels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
