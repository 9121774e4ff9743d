use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};

use crate::autostart::AutoStarter;
use crate::client::{IndicatorClient, StopOutcome};
use crate::config::{self, Config};
use crate::daemon::{IndicatorService, ServiceExit};
use crate::overlay::{show_standalone_flash, HeadlessOverlay};
use crate::paths::{self, IndicatorPaths};
use crate::process::{self, ProcessTableProbe};
use crate::protocol::Command;
use crate::status;

#[derive(Parser, Debug)]
#[command(name = "deskpilot", version, about = "Desktop automation from the command line")]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopLevel,
}

#[derive(Subcommand, Debug)]
pub enum TopLevel {
    /// Control the on-screen activity indicator
    Indicator {
        #[command(subcommand)]
        action: IndicatorAction,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum IndicatorAction {
    /// Run the indicator daemon in the foreground
    Start,
    /// Ask a running indicator to exit
    Stop,
    /// Flash the indicator, optionally recording the given action
    Flash {
        /// Words describing the action, e.g. `app open Safari`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        action: Vec<String>,
    },
    /// Show whether the indicator is running and what it saw recently
    Status,
    /// Check that the indicator answers requests
    Ping,
}

impl Cli {
    /// Long-running invocations log at `info` by default; everything else
    /// stays quiet unless something goes wrong.
    pub fn default_log_level(&self) -> &'static str {
        match &self.command {
            TopLevel::Indicator {
                action: IndicatorAction::Start,
            } => "info",
            _ => "warn",
        }
    }
}

/// Shared setup for every indicator subcommand.
struct Invocation {
    config: Config,
    config_path: PathBuf,
    paths: IndicatorPaths,
}

impl Invocation {
    fn load() -> Self {
        let config_path = paths::config_file_path();
        let config = config::load_or_warn(&config_path);
        let paths = IndicatorPaths::from_state_dir(config.indicator.state_dir.as_deref());
        Self {
            config,
            config_path,
            paths,
        }
    }

    fn client(&self) -> IndicatorClient {
        IndicatorClient::new(self.paths.clone(), &self.config.indicator)
    }
}

pub fn run(cli: Cli) -> Result<ExitCode> {
    let TopLevel::Indicator { action } = cli.command;
    let ctx = Invocation::load();
    debug!("indicator socket {}", ctx.paths.socket.display());

    match action {
        IndicatorAction::Start => start(ctx),
        IndicatorAction::Stop => Ok(stop(&ctx)),
        IndicatorAction::Flash { action } => Ok(flash(&ctx, &action)),
        IndicatorAction::Status => Ok(print_status(&ctx)),
        IndicatorAction::Ping => Ok(ping(&ctx)),
    }
}

fn start(ctx: Invocation) -> Result<ExitCode> {
    let client = ctx.client();
    if client.is_running() {
        match client.running_pid() {
            Some(pid) => println!("indicator already running (pid {pid})"),
            None => println!("indicator already running"),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let service = IndicatorService::new(
        ctx.paths,
        ctx.config.indicator,
        Box::new(HeadlessOverlay::new()),
    )
    .watch_config(ctx.config_path)
    .handle_signals();

    match runtime.block_on(service.run()) {
        Ok(ServiceExit::Stopped) => Ok(ExitCode::SUCCESS),
        Ok(ServiceExit::AlreadyRunning) => {
            println!("indicator already running");
            Ok(ExitCode::SUCCESS)
        }
        Ok(ServiceExit::Displaced) => {
            info!("indicator socket disappeared; exited so a new daemon can take over");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            // Another daemon or a permissions problem; not worth an error-level log.
            info!("indicator could not start: {e:#}");
            eprintln!("indicator could not start: {e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn stop(ctx: &Invocation) -> ExitCode {
    match ctx.client().stop(ctx.config.indicator.stop_timeout()) {
        StopOutcome::NotRunning => {
            println!("indicator not running");
            ExitCode::SUCCESS
        }
        StopOutcome::Stopped => {
            println!("indicator stopped");
            ExitCode::SUCCESS
        }
        StopOutcome::Failed => {
            eprintln!("indicator did not stop");
            ExitCode::FAILURE
        }
    }
}

/// Delivers a flash through the daemon, or renders one locally when no
/// daemon is reachable. Never fails.
fn flash(ctx: &Invocation, action: &[String]) -> ExitCode {
    let client = ctx.client();
    let starter = AutoStarter::new(&ctx.config.indicator, &ctx.paths);
    if !client.flash_for_action(&starter, action) {
        debug!("no indicator reachable; flashing locally");
        let mut overlay = HeadlessOverlay::new();
        show_standalone_flash(&mut overlay, ctx.config.indicator.flash_duration());
    }
    ExitCode::SUCCESS
}

fn ping(ctx: &Invocation) -> ExitCode {
    if ctx.client().send(&Command::Ping) {
        println!("ok");
        ExitCode::SUCCESS
    } else {
        println!("indicator not reachable");
        ExitCode::FAILURE
    }
}

fn print_status(ctx: &Invocation) -> ExitCode {
    let client = IndicatorClient::with_probe(
        ctx.paths.clone(),
        Box::new(ProcessTableProbe),
        ctx.config.indicator.response_timeout(),
    );
    print!("{}", render_status(&client));
    ExitCode::SUCCESS
}

fn render_status(client: &IndicatorClient) -> String {
    let store = client.store();
    let paths = store.paths();
    let mut out = String::new();
    if !client.is_running() {
        out.push_str("indicator: not running\n");
        return out;
    }

    match client.running_pid() {
        Some(pid) => {
            out.push_str(&format!("indicator: running (pid {pid})\n"));
            if let Some(d) = process::details(pid) {
                out.push_str(&format!(
                    "  process: {}, {:.1} MB, up {}\n",
                    d.name,
                    d.memory_bytes as f64 / (1024.0 * 1024.0),
                    format_uptime(d.run_time_secs)
                ));
            }
        }
        None => out.push_str("indicator: starting\n"),
    }
    if store.socket_exists() {
        out.push_str(&format!("  socket: {}\n", paths.socket.display()));
    } else {
        out.push_str(&format!("  socket: {} (missing)\n", paths.socket.display()));
    }

    let Some(report) = status::read_status(&paths.status) else {
        return out;
    };
    let now = Local::now();
    out.push_str(&format!("  version: {}\n", report.version));
    match status::age_of(&report.started_at, now) {
        Some(age) => out.push_str(&format!("  started: {} ({age})\n", report.started_at)),
        None => out.push_str(&format!("  started: {}\n", report.started_at)),
    }
    if report.recent_activity.is_empty() {
        out.push_str("recent activity: none\n");
        return out;
    }

    out.push_str("recent activity:\n");
    for record in &report.recent_activity {
        let age = status::age_of(&record.timestamp, now).unwrap_or_else(|| "?".to_string());
        out.push_str(&format!("  {:<32} {age}\n", record.label));
    }
    out
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
