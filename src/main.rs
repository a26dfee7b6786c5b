use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

mod chain;
mod cli;
mod commands;
mod config;
mod errors;
mod gateway;
mod invalidate;
mod logging;
mod model;
mod patch;
mod report;
mod resubmit;
mod scan;
mod util;

use cli::{Command, RootArgs, ScanCommand};

fn main() -> Result<ExitCode> {
    let args = RootArgs::parse();
    logging::init(args.verbose, args.log_file.as_deref())?;
    let config = commands::load_client_config(args.config.as_deref(), args.prod)?;
    tracing::debug!(
        environment = config.environment.as_str(),
        server = %config.server(),
        "client configured"
    );

    match args.command {
        Command::Invalidate(args) => commands::run_invalidate(&config, args),
        Command::Resubmit(args) => commands::run_resubmit(&config, args),
        Command::Scan(ScanCommand::Campaigns(args)) => commands::run_scan_campaigns(&config, args),
        Command::Scan(ScanCommand::Requests(args)) => commands::run_scan_requests(&config, args),
        Command::Patch(args) => commands::run_patch(&config, args),
    }
}
