mod cli;
mod commands;
mod config;
mod embedding;
mod logging;
mod model;
mod risk_blob;
mod storage;
mod util;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use tracing::error;

use crate::cli::{Cli, Commands};
use crate::commands::reembed::JobError;

const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    let cli = Cli::parse();

    let run_log = match &cli.command {
        Commands::Reembed(args) => match logging::open_run_log(&args.log_dir, Local::now()) {
            Ok(log) => Some(log),
            Err(err) => {
                eprintln!("failed to open run log: {err:#}");
                std::process::exit(EXIT_FAILURE);
            }
        },
        _ => None,
    };
    let log_path = run_log.as_ref().map(|log| log.path.clone());
    logging::init(run_log);

    if let Err(err) = run(cli, log_path.as_deref()) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }

        let code = match err.downcast_ref::<JobError>() {
            Some(JobError::Interrupted { .. }) => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli, log_path: Option<&std::path::Path>) -> Result<()> {
    match cli.command {
        Commands::Import(args) => commands::import::run(args),
        Commands::Reembed(args) => commands::reembed::run(args, log_path),
        Commands::Status(args) => commands::status::run(args),
        Commands::Normalize(args) => commands::normalize::run(args),
    }
}
