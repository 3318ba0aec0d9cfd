//! Guest init process.
//!
//! Runs as PID 1. Signal dispositions and zombie reaping follow
//! [tini](https://github.com/krallin/tini); unlike tini, init also prepares
//! the guest (mounts, network) before starting the single workload, and
//! powers the machine off once the workload exits.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use guest_init::boot::{self, Guest};
use guest_init::config::{self, DEFAULT_CONFIG_PATH};
use guest_init::network;
use guest_init::shutdown::{DEFAULT_SYSRQ_TRIGGER, Shutdown};
use guest_init::{mounts, pid1};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser, Debug)]
#[command(name = "guest-init", version)]
struct Cli {
    /// Image configuration to boot
    #[arg(long, env = "GUEST_INIT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Kernel SysRq trigger used to power off
    #[arg(long, env = "GUEST_INIT_SYSRQ", default_value = DEFAULT_SYSRQ_TRIGGER)]
    sysrq_trigger: PathBuf,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            sysrq_trigger: PathBuf::from(DEFAULT_SYSRQ_TRIGGER),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The kernel passes its own arguments through to init; never exit on them.
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            warn!(error = %e, "ignoring init arguments, using defaults");
            Cli::default()
        }
    }
}

fn main() -> ExitCode {
    if let Some(code) = network::run_hook() {
        return code;
    }

    init_tracing();
    info!(pid = std::process::id(), "guest-init starting");

    pid1::setup_signal_handlers();
    if let Err(e) = pid1::spawn_reaper() {
        error!(error = %e, "cannot start zombie reaper");
        return ExitCode::FAILURE;
    }

    let cli = parse_cli();
    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal");
            return ExitCode::FAILURE;
        }
    };

    let proc_mounted = mounts::mount_proc();
    let shutdown = Shutdown::arm(cli.sysrq_trigger);

    // Powers off; returns only if the trigger is not the real sysrq file.
    ExitCode::from(boot::boot(&Guest::kernel(), proc_mounted, config, shutdown))
}
