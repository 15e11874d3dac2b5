//! Bounded external command execution

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of an external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` with a hard timeout. The child is killed if the
/// timeout fires.
pub async fn run_command(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<CommandOutput> {
    debug!("Executing: {} {:?}", program, args);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.with_context(|| format!("Failed to execute {}", program))?,
        Err(_) => bail!("{} timed out after {}s", program, timeout.as_secs()),
    };

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run an argv-style command and fail unless it exits zero.
pub async fn run_argv_checked(argv: &[String], timeout: Duration) -> Result<CommandOutput> {
    let (program, args) = argv.split_first().context("Command is empty")?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = run_command(program, &args, &[], timeout).await?;
    if !output.success {
        bail!(
            "{} exited with {:?}: {}",
            program,
            output.code,
            output.stderr.trim()
        );
    }
    Ok(output)
}
