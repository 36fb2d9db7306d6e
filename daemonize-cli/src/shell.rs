//! Shell-command daemons: one call runs the command once, then pauses for
//! the configured interval.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use daemonize_core::DaemonSpec;

#[derive(Debug)]
pub struct ShellDaemon {
    label: String,
    command: String,
    interval: Duration,
}

impl ShellDaemon {
    pub fn new(spec: &DaemonSpec) -> Arc<Self> {
        Arc::new(Self {
            label: spec.label(),
            command: spec.command.clone(),
            interval: spec.interval(),
        })
    }

    pub async fn run_async(self: Arc<Self>) {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .status()
            .await;
        self.report(status);
        tokio::time::sleep(self.interval).await;
    }

    pub fn run_blocking(&self) {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .status();
        self.report(status);
        std::thread::sleep(self.interval);
    }

    fn report(&self, status: io::Result<ExitStatus>) {
        match status {
            Ok(status) if status.success() => {
                tracing::debug!(daemon = %self.label, "command succeeded");
            }
            Ok(status) => {
                tracing::warn!(daemon = %self.label, status = %status, "command exited unsuccessfully");
            }
            Err(err) => {
                tracing::error!(daemon = %self.label, error = %err, "failed to spawn command");
            }
        }
    }
}
