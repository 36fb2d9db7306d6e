//! `daemonize run` — start a manifest's daemons on a pool and stop them all
//! on Ctrl-C or when the run duration elapses.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use daemonize_core::{load_manifest, DaemonSpec, Manifest, RunMode};
use daemonize_pool::{DaemonPool, PoolStatus};

use crate::shell::ShellDaemon;

/// Arguments for `daemonize run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the YAML manifest.
    pub manifest: PathBuf,

    /// Stop all daemons after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Emit pool status as JSON lines.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct RunEvent<'a> {
    event: &'a str,
    #[serde(flatten)]
    status: &'a PoolStatus,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        init_tracing();
        let manifest = load_manifest(&self.manifest)
            .with_context(|| format!("invalid manifest {}", self.manifest.display()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        runtime.block_on(supervise(
            manifest,
            self.duration_secs.map(Duration::from_secs),
            self.json,
        ))
    }
}

async fn supervise(manifest: Manifest, deadline: Option<Duration>, json: bool) -> Result<()> {
    let pool = DaemonPool::new();
    for spec in &manifest.daemons {
        start_spec(&pool, spec).await?;
    }

    let started = pool.status().await;
    tracing::info!(
        running = started.running,
        named = started.named.len(),
        "daemons started"
    );
    print_status("started", &started, json)?;

    wait_for_shutdown(deadline).await?;
    pool.stop_all().await;

    let stopped = pool.status().await;
    print_status("stopped", &stopped, json)?;
    if !json {
        println!(
            "{} stopped {} daemon(s)",
            "✓".green().bold(),
            started.running
        );
    }
    Ok(())
}

async fn start_spec(pool: &DaemonPool, spec: &DaemonSpec) -> Result<()> {
    let daemon = ShellDaemon::new(spec);
    match (&spec.name, spec.mode) {
        (Some(name), RunMode::Async) => pool
            .start_name(name.0.clone(), move || daemon.clone().run_async())
            .await
            .with_context(|| format!("failed to start daemon '{name}'"))?,
        (Some(name), RunMode::Blocking) => pool
            .start_blocking_name(name.0.clone(), move || daemon.run_blocking())
            .await
            .with_context(|| format!("failed to start daemon '{name}'"))?,
        (None, RunMode::Async) => {
            for _ in 0..spec.replicas {
                let daemon = daemon.clone();
                pool.start(move || daemon.clone().run_async()).await;
            }
        }
        (None, RunMode::Blocking) => {
            for _ in 0..spec.replicas {
                let daemon = daemon.clone();
                pool.start_blocking(move || daemon.run_blocking()).await;
            }
        }
    }
    Ok(())
}

async fn wait_for_shutdown(deadline: Option<Duration>) -> Result<()> {
    let elapsed = async {
        match deadline {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("received ctrl-c, stopping daemons");
        }
        _ = elapsed => {
            tracing::info!("run duration elapsed, stopping daemons");
        }
    }
    Ok(())
}

fn print_status(event: &str, status: &PoolStatus, json: bool) -> Result<()> {
    if json {
        let line = serde_json::to_string(&RunEvent { event, status })
            .context("failed to serialize pool status JSON")?;
        println!("{line}");
        return Ok(());
    }

    println!(
        "{} {} running, named: {}",
        event.bold(),
        status.running,
        if status.named.is_empty() {
            "-".to_string()
        } else {
            status.named.join(", ")
        }
    );
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
