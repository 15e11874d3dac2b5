//! systemd-backed service control

use super::command::run_command;
use super::ServiceControl;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Controls units through `systemctl`
pub struct Systemctl {
    timeout: Duration,
}

impl Systemctl {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn unit_command(&self, verb: &str, name: &str) -> Result<()> {
        info!("systemctl {} {}", verb, name);
        let output = run_command("systemctl", &[verb, name], &[], self.timeout).await?;
        if !output.success {
            bail!(
                "systemctl {} {} failed ({:?}): {}",
                verb,
                name,
                output.code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for Systemctl {
    async fn is_running(&self, name: &str) -> bool {
        match run_command("systemctl", &["is-active", "--quiet", name], &[], self.timeout).await {
            Ok(output) => output.success,
            Err(e) => {
                debug!("is-active {} failed: {}", name, e);
                false
            }
        }
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.unit_command("restart", name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.unit_command("stop", name).await
    }
}
