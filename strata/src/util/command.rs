//! External command execution.

use crate::errors::{StrataError, StrataResult};
use async_trait::async_trait;
use std::time::Instant;
use tokio::process::Command;

/// Runs an external program and captures its stdout.
///
/// The btrfs reclaimer depends on this rather than spawning processes itself,
/// so the reclaim algorithm can be exercised without a btrfs filesystem.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning stdout on a zero exit status.
    async fn run(&self, program: &str, args: &[String]) -> StrataResult<String>;
}

/// `CommandRunner` backed by real processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> StrataResult<String> {
        let command_line = render_command_line(program, args);
        let started = Instant::now();

        tracing::debug!(command = %command_line, "running command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| StrataError::Command(format!("{}: failed to spawn: {}", command_line, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                command = %command_line,
                status = %output.status,
                took = ?started.elapsed(),
                "command failed"
            );
            return Err(StrataError::Command(format!(
                "{}: exited with {}: {}",
                command_line,
                output.status,
                stderr.trim()
            )));
        }

        tracing::debug!(command = %command_line, took = ?started.elapsed(), "command succeeded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
