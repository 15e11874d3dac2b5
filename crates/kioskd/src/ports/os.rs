//! Linux OS primitives

use super::command::{run_argv_checked, run_command};
use super::OsControl;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const DROP_CACHES: &str = "/proc/sys/vm/drop_caches";

pub struct LinuxOs {
    reboot_command: Vec<String>,
    timeout: Duration,
    drop_caches_path: PathBuf,
}

impl LinuxOs {
    pub fn new(reboot_command: Vec<String>, timeout: Duration) -> Self {
        Self {
            reboot_command,
            timeout,
            drop_caches_path: PathBuf::from(DROP_CACHES),
        }
    }

    fn signal(pid: u32, signal: Signal) -> Result<()> {
        let raw = i32::try_from(pid).with_context(|| format!("pid {} out of range", pid))?;
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => bail!("{} to pid {} failed: {}", signal, pid, e),
        }
    }
}

#[async_trait]
impl OsControl for LinuxOs {
    async fn drop_page_cache(&self) -> Result<()> {
        nix::unistd::sync();
        tokio::fs::write(&self.drop_caches_path, "3")
            .await
            .with_context(|| format!("Failed to write {}", self.drop_caches_path.display()))?;
        info!("Dropped page cache");
        Ok(())
    }

    async fn signal_parent(&self, parent_pid: u32) -> Result<()> {
        Self::signal(parent_pid, Signal::SIGCHLD)
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        warn!("Killing pid {}", pid);
        Self::signal(pid, Signal::SIGKILL)
    }

    async fn close_peer(&self, peer: IpAddr) -> Result<()> {
        let target = peer.to_string();
        let output = run_command("ss", &["-K", "dst", &target], &[], self.timeout).await?;
        if !output.success {
            bail!("ss -K dst {} failed: {}", target, output.stderr.trim());
        }
        info!("Closed connections to {}", target);
        Ok(())
    }

    async fn run_maintenance(&self, argv: &[String]) -> Result<()> {
        if argv.is_empty() {
            return Ok(());
        }
        run_argv_checked(argv, self.timeout).await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        run_argv_checked(&self.reboot_command, self.timeout)
            .await
            .context("Reboot command failed")?;
        Ok(())
    }
}
