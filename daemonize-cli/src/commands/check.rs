//! `daemonize check` — validate a manifest without starting anything.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use daemonize_core::{load_manifest, DaemonSpec, Manifest};

/// Arguments for `daemonize check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the YAML manifest.
    pub manifest: PathBuf,

    /// Emit the parsed manifest as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct DaemonTableRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "mode")]
    mode: String,
    #[tabled(rename = "replicas")]
    replicas: u32,
    #[tabled(rename = "interval")]
    interval: String,
    #[tabled(rename = "command")]
    command: String,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let manifest = load_manifest(&self.manifest)
            .with_context(|| format!("invalid manifest {}", self.manifest.display()))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&manifest)
                    .context("failed to serialize manifest JSON")?
            );
            return Ok(());
        }

        print_table(&manifest);
        Ok(())
    }
}

fn print_table(manifest: &Manifest) {
    println!(
        "{} {} ({} daemon definitions, {} pool daemons)",
        "✓".green().bold(),
        "manifest is valid".bold(),
        manifest.daemons.len(),
        manifest.daemon_count(),
    );
    if manifest.daemons.is_empty() {
        println!("No daemons defined.");
        return;
    }

    let rows: Vec<DaemonTableRow> = manifest.daemons.iter().map(table_row).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn table_row(spec: &DaemonSpec) -> DaemonTableRow {
    DaemonTableRow {
        name: spec.label(),
        mode: spec.mode.to_string(),
        replicas: spec.replicas,
        interval: format!("{}ms", spec.interval_ms),
        command: spec.command.clone(),
    }
}
