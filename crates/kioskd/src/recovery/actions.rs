//! Remediation actions, ordered by severity

use crate::ports::{OsControl, ServiceControl};
use crate::resources::cleanup;
use kiosk_shared::config::Config;
use kiosk_shared::MAX_LEVEL;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Restart the application, then the renderer
    ServiceRestart,
    /// Stop the renderer, wipe its cache, restart it
    CacheClearRestart,
    /// Bounce the whole graphical stack
    DisplayServerRestart,
    FullReboot,
}

impl Remediation {
    pub const ALL: [Remediation; 4] = [
        Remediation::ServiceRestart,
        Remediation::CacheClearRestart,
        Remediation::DisplayServerRestart,
        Remediation::FullReboot,
    ];

    pub fn severity(self) -> u8 {
        match self {
            Remediation::ServiceRestart => 1,
            Remediation::CacheClearRestart => 2,
            Remediation::DisplayServerRestart => 3,
            Remediation::FullReboot => 4,
        }
    }

    pub fn for_severity(severity: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.severity() == severity)
    }

    /// The action to attempt from `level`: the next rung, capped at reboot
    pub fn for_level(level: u8) -> Self {
        match Self::for_severity(level.saturating_add(1).min(MAX_LEVEL)) {
            Some(remediation) => remediation,
            None => Remediation::FullReboot,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Remediation::ServiceRestart => "service-restart",
            Remediation::CacheClearRestart => "cache-clear-restart",
            Remediation::DisplayServerRestart => "display-server-restart",
            Remediation::FullReboot => "full-reboot",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Remediation::FullReboot
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything an action needs to touch the host
pub struct ActionContext {
    pub services: Arc<dyn ServiceControl>,
    pub os: Arc<dyn OsControl>,
    pub application: String,
    pub renderer: String,
    pub display_server: String,
    pub renderer_cache_dirs: Vec<PathBuf>,
    pub reboot_grace: Duration,
}

impl ActionContext {
    pub fn new(config: &Config, services: Arc<dyn ServiceControl>, os: Arc<dyn OsControl>) -> Self {
        Self {
            services,
            os,
            application: config.services.application.clone(),
            renderer: config.services.renderer.clone(),
            display_server: config.services.display_server.clone(),
            renderer_cache_dirs: config.recovery.renderer_cache_dirs.clone(),
            reboot_grace: config.recovery.reboot_grace(),
        }
    }
}

/// Step errors collected while running an action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionReport {
    pub errors: Vec<String>,
}

impl ActionReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    fn note<T>(&mut self, step: &str, result: anyhow::Result<T>) {
        if let Err(e) = result {
            warn!("{} failed: {:#}", step, e);
            self.errors.push(format!("{}: {:#}", step, e));
        }
    }
}

impl Remediation {
    /// Run every step. A failed step is recorded and the rest still run; the
    /// re-probe decides whether the action worked.
    pub async fn run(self, ctx: &ActionContext) -> ActionReport {
        info!("Running {} (severity {})", self, self.severity());
        let mut report = ActionReport::default();
        let services = &ctx.services;

        match self {
            Remediation::ServiceRestart => {
                report.note(&format!("restart {}", ctx.application), services.restart(&ctx.application).await);
                report.note(&format!("restart {}", ctx.renderer), services.restart(&ctx.renderer).await);
            }
            Remediation::CacheClearRestart => {
                report.note(&format!("stop {}", ctx.renderer), services.stop(&ctx.renderer).await);
                for dir in &ctx.renderer_cache_dirs {
                    let cleared = cleanup::clear_dir_contents(dir).map_err(anyhow::Error::from);
                    if let Ok(stats) = &cleared {
                        info!("Cleared {} ({} bytes)", dir.display(), stats.bytes);
                    }
                    report.note(&format!("clear {}", dir.display()), cleared);
                }
                report.note(&format!("restart {}", ctx.renderer), services.restart(&ctx.renderer).await);
            }
            Remediation::DisplayServerRestart => {
                report.note(&format!("stop {}", ctx.renderer), services.stop(&ctx.renderer).await);
                report.note(&format!("stop {}", ctx.application), services.stop(&ctx.application).await);
                report.note(
                    &format!("restart {}", ctx.display_server),
                    services.restart(&ctx.display_server).await,
                );
                report.note(&format!("restart {}", ctx.application), services.restart(&ctx.application).await);
                report.note(&format!("restart {}", ctx.renderer), services.restart(&ctx.renderer).await);
            }
            Remediation::FullReboot => {
                error!("Recovery exhausted, rebooting in {}s", ctx.reboot_grace.as_secs());
                tokio::time::sleep(ctx.reboot_grace).await;
                report.note("reboot", ctx.os.reboot().await);
            }
        }
        report
    }
}

/// An action plus how long to wait before judging it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationAction {
    pub remediation: Remediation,
    pub settle_time: Duration,
}

/// Severity-indexed table of remediation actions
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    actions: [RemediationAction; 4],
}

impl ActionCatalog {
    pub fn from_config(config: &Config) -> Self {
        let settle = &config.recovery.settle;
        let entry = |remediation, secs| RemediationAction {
            remediation,
            settle_time: Duration::from_secs(secs),
        };
        Self {
            actions: [
                entry(Remediation::ServiceRestart, settle.service_restart),
                entry(Remediation::CacheClearRestart, settle.cache_clear_restart),
                entry(Remediation::DisplayServerRestart, settle.display_server_restart),
                entry(Remediation::FullReboot, 0),
            ],
        }
    }

    /// Action for `severity`, clamped to 1..=4
    pub fn for_severity(&self, severity: u8) -> RemediationAction {
        let index = severity.clamp(1, MAX_LEVEL) as usize - 1;
        self.actions[index]
    }

    pub fn for_level(&self, level: u8) -> RemediationAction {
        self.for_severity(Remediation::for_level(level).severity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::fake::{FakeOs, FakeServices};
    use std::fs;
    use tempfile::TempDir;

    fn context(config: &Config, services: Arc<FakeServices>, os: Arc<FakeOs>) -> ActionContext {
        ActionContext::new(config, services, os)
    }

    #[test]
    fn test_severity_follows_level() {
        assert_eq!(Remediation::for_level(0), Remediation::ServiceRestart);
        assert_eq!(Remediation::for_level(1), Remediation::CacheClearRestart);
        assert_eq!(Remediation::for_level(2), Remediation::DisplayServerRestart);
        assert_eq!(Remediation::for_level(3), Remediation::FullReboot);
        assert_eq!(Remediation::for_level(4), Remediation::FullReboot);
        assert_eq!(Remediation::for_level(u8::MAX), Remediation::FullReboot);
    }

    #[test]
    fn test_catalog_settle_times() {
        let config = Config::default();
        let catalog = ActionCatalog::from_config(&config);
        assert_eq!(catalog.for_severity(1).settle_time, Duration::from_secs(30));
        assert_eq!(catalog.for_severity(2).settle_time, Duration::from_secs(45));
        assert_eq!(catalog.for_severity(3).settle_time, Duration::from_secs(60));
        assert_eq!(catalog.for_level(3).remediation, Remediation::FullReboot);
        assert_eq!(catalog.for_severity(0).remediation, Remediation::ServiceRestart);
    }

    #[tokio::test]
    async fn test_service_restart_order() {
        let config = Config::default();
        let services = Arc::new(FakeServices::default());
        let ctx = context(&config, services.clone(), Arc::new(FakeOs::new()));

        let report = Remediation::ServiceRestart.run(&ctx).await;
        assert!(report.succeeded());
        assert_eq!(
            services.restarts(),
            vec![config.services.application.clone(), config.services.renderer.clone()]
        );
    }

    #[tokio::test]
    async fn test_cache_clear_wipes_dirs() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir_all(cache.join("Code Cache")).unwrap();
        fs::write(cache.join("Code Cache/index"), b"data").unwrap();

        let mut config = Config::default();
        config.recovery.renderer_cache_dirs = vec![cache.clone(), dir.path().join("missing")];
        let services = Arc::new(FakeServices::default());
        let ctx = context(&config, services.clone(), Arc::new(FakeOs::new()));

        let report = Remediation::CacheClearRestart.run(&ctx).await;
        assert!(report.succeeded(), "{:?}", report.errors);
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);
        let renderer = &config.services.renderer;
        assert_eq!(
            services.calls(),
            vec![format!("stop:{}", renderer), format!("restart:{}", renderer)]
        );
    }

    #[tokio::test]
    async fn test_display_restart_continues_past_failures() {
        let config = Config::default();
        let services = Arc::new(FakeServices::default());
        services.fail_restarts_of(&config.services.display_server);
        let ctx = context(&config, services.clone(), Arc::new(FakeOs::new()));

        let report = Remediation::DisplayServerRestart.run(&ctx).await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            services.restarts(),
            vec![
                config.services.display_server.clone(),
                config.services.application.clone(),
                config.services.renderer.clone(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_reboot_waits_grace_then_reboots() {
        let config = Config::default();
        let os = Arc::new(FakeOs::new());
        let ctx = context(&config, Arc::new(FakeServices::default()), os.clone());

        let start = tokio::time::Instant::now();
        Remediation::FullReboot.run(&ctx).await;
        assert!(start.elapsed() >= config.recovery.reboot_grace());
        assert_eq!(os.reboots(), 1);
    }
}
