use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use session_usage_monitor::app;
use session_usage_monitor::cli::Cli;
use session_usage_monitor::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("session-usage-monitor error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    app::run(cli)
}
