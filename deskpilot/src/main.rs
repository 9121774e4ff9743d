mod activity;
mod autostart;
mod cli;
mod client;
mod config;
mod daemon;
mod event;
mod listener;
mod overlay;
mod paths;
mod process;
mod protocol;
mod state;
mod status;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DESKPILOT_LOG";

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    // ── Logging ───────────────────────────────────────────────────────────────
    // Autostarted daemons have stderr appended to the indicator log file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new(cli.default_log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli::run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
