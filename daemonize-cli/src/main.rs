//! Daemonize — keep a manifest's worth of shell daemons running.
//!
//! # Usage
//!
//! ```text
//! daemonize check <manifest> [--json]
//! daemonize run <manifest> [--duration-secs <n>] [--json]
//! ```

mod commands;
mod shell;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, run::RunArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "daemonize",
    version,
    about = "Run repeating background commands from a YAML manifest",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a manifest and list the daemons it defines.
    Check(CheckArgs),

    /// Start every daemon in a manifest until Ctrl-C or the duration elapses.
    Run(RunArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Check(args) => args.run(),
        Commands::Run(args) => args.run(),
    }
}
