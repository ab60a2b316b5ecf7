use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::generate;
use tracing::error;

use hostupgrade::cli::{self, Cli, Commands};
use hostupgrade::executor::RealCommandExecutor;

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if let Some(level) = args.command.log_level() {
        hostupgrade::init_logging(level)?;
    }

    let result = match &args.command {
        Commands::Check(opts) => hostupgrade::run_check(opts),
        Commands::Plan(opts) => hostupgrade::run_plan(opts),
        Commands::Validate(opts) => hostupgrade::run_validate(opts),
        Commands::Complete(opts) => {
            let executor = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            hostupgrade::run_complete(opts, executor)
        }
        Commands::Completions(opts) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(opts.shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}
