//! Argv subprocess runner with a wall-clock timeout.
//!
//! Whitelist mode passes an argv array straight to the OS — no shell is ever
//! involved. Timed-out children are killed and reaped.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait ArgvRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> anyhow::Result<CommandOutput>;
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ArgvRunner for ProcessRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> anyhow::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", program.display()))?;

        let status = child.wait_timeout(timeout)?;
        if status.is_none() {
            child.kill()?;
            let output = child.wait_with_output()?;
            return Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: true,
            });
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        })
    }
}
