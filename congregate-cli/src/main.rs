//! Congregate: keeps Planning Center People and a Fibery space in agreement.
//!
//! # Usage
//!
//! ```text
//! congregate sync [--dry-run] [--reverse] [--json]
//! congregate check
//! congregate status [--json]
//! congregate cursor reset <Asource|Bsource|all>
//! ```
//!
//! Global flags: `--config <path>` replaces `~/.congregate/config.yaml`,
//! `--log-json` switches the stderr log to JSON lines. `RUST_LOG` filters
//! log output (default `info`).

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::CheckArgs, cursor::CursorCommand, status::StatusArgs, sync::SyncArgs, Global,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "congregate",
    version,
    about = "Sync People and Households between Planning Center and Fibery",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.congregate/config.yaml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to stderr as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync: Planning Center → Fibery, then Fibery → Planning Center when enabled.
    Sync(SyncArgs),

    /// Verify credentials and reachability of both systems.
    Check(CheckArgs),

    /// Show the stored sync cursors.
    Status(StatusArgs),

    /// Inspect or reset sync cursors.
    Cursor {
        #[command(subcommand)]
        command: CursorCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let global = Global {
        config: cli.config,
    };
    match cli.command {
        Commands::Sync(args) => args.run(&global),
        Commands::Check(args) => args.run(&global),
        Commands::Status(args) => args.run(&global),
        Commands::Cursor { command } => commands::cursor::run(command, &global),
    }
}

/// stderr subscriber; stdout stays reserved for command output.
fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
