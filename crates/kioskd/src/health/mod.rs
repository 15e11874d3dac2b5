//! Health probe
//!
//! Four ordered checks decide whether the kiosk is healthy: both services
//! running, the application answering HTTP, a monitor attached, and the
//! application window visible. Every check runs on every probe with its own
//! timeout; the report names each one that failed.

pub mod policy;

pub use policy::{EndpointPolicy, QuietHoursPolicy};

use crate::ports::{DisplayIntrospection, HttpLiveness, ServiceControl};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use kiosk_shared::config::{ProbeConfig, ServicesConfig};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    ProcessAlive,
    AppResponsive,
    DisplayConnected,
    WindowVisible,
}

impl CheckName {
    /// Evaluation order
    pub const ALL: [CheckName; 4] = [
        CheckName::ProcessAlive,
        CheckName::AppResponsive,
        CheckName::DisplayConnected,
        CheckName::WindowVisible,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::ProcessAlive => "process_alive",
            CheckName::AppResponsive => "app_responsive",
            CheckName::DisplayConnected => "display_connected",
            CheckName::WindowVisible => "window_visible",
        }
    }
}

impl std::fmt::Display for CheckName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: CheckName,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    /// Liveness endpoint chosen for this probe
    pub endpoint: String,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    /// Healthy iff every check passed
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.to_string())
            .collect()
    }

    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| !c.passed)
    }

    pub fn check(&self, name: CheckName) -> Option<bool> {
        self.checks.iter().find(|c| c.name == name).map(|c| c.passed)
    }
}

/// Anything that can produce a health verdict. The recovery machine uses
/// this to re-probe after a remediation settles.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthReport;
}

pub struct HealthProbe {
    services: Arc<dyn ServiceControl>,
    display: Arc<dyn DisplayIntrospection>,
    http: Arc<dyn HttpLiveness>,
    policy: Arc<dyn EndpointPolicy>,
    application: String,
    renderer: String,
    window_title: String,
    command_timeout: Duration,
    http_timeout: Duration,
}

impl HealthProbe {
    pub fn new(
        services_config: &ServicesConfig,
        probe_config: &ProbeConfig,
        services: Arc<dyn ServiceControl>,
        display: Arc<dyn DisplayIntrospection>,
        http: Arc<dyn HttpLiveness>,
        policy: Arc<dyn EndpointPolicy>,
    ) -> Self {
        Self {
            services,
            display,
            http,
            policy,
            application: services_config.application.clone(),
            renderer: services_config.renderer.clone(),
            window_title: probe_config.window_title.clone(),
            command_timeout: probe_config.command_timeout(),
            http_timeout: probe_config.http_timeout(),
        }
    }

    /// Run all checks in order against the endpoint for the current local time
    pub async fn probe(&self) -> HealthReport {
        let endpoint = self.policy.endpoint_for(Local::now().naive_local());

        let checks = vec![
            self.timed(CheckName::ProcessAlive, self.command_timeout, self.process_alive())
                .await,
            self.timed(CheckName::AppResponsive, self.http_timeout, self.app_responsive(&endpoint))
                .await,
            self.timed(CheckName::DisplayConnected, self.command_timeout, self.display_connected())
                .await,
            self.timed(CheckName::WindowVisible, self.command_timeout, self.window_visible())
                .await,
        ];

        let report = HealthReport {
            timestamp: Utc::now(),
            endpoint,
            checks,
        };

        // Only the first failure is worth a warning; the rest are noise.
        let mut warned = false;
        for check in report.checks.iter().filter(|c| !c.passed) {
            if warned {
                debug!("check {} also failed: {}", check.name, check.detail);
            } else {
                warn!("check {} failed: {}", check.name, check.detail);
                warned = true;
            }
        }
        if report.healthy() {
            info!("Kiosk healthy ({})", report.endpoint);
        }
        report
    }

    async fn timed<F>(&self, name: CheckName, limit: Duration, check: F) -> CheckResult
    where
        F: Future<Output = (bool, String)>,
    {
        let start = Instant::now();
        let (passed, detail) = match tokio::time::timeout(limit, check).await {
            Ok(outcome) => outcome,
            Err(_) => (false, format!("timed out after {}s", limit.as_secs())),
        };
        CheckResult {
            name,
            passed,
            detail,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn process_alive(&self) -> (bool, String) {
        let mut missing = Vec::new();
        for service in [&self.application, &self.renderer] {
            if !self.services.is_running(service).await {
                missing.push(service.as_str());
            }
        }
        if missing.is_empty() {
            (true, "application and renderer running".to_string())
        } else {
            (false, format!("not running: {}", missing.join(", ")))
        }
    }

    async fn app_responsive(&self, endpoint: &str) -> (bool, String) {
        match self.http.get_status(endpoint).await {
            Ok(status) if (200..400).contains(&status) => (true, format!("HTTP {}", status)),
            Ok(status) => (false, format!("HTTP {} from {}", status, endpoint)),
            Err(e) => (false, format!("{:#}", e)),
        }
    }

    async fn display_connected(&self) -> (bool, String) {
        if self.display.is_display_connected().await {
            (true, "monitor connected".to_string())
        } else {
            (false, "no connected output".to_string())
        }
    }

    async fn window_visible(&self) -> (bool, String) {
        if self.display.is_window_visible(&self.window_title).await {
            (true, format!("window '{}' visible", self.window_title))
        } else {
            (false, format!("no visible window named '{}'", self.window_title))
        }
    }
}

#[async_trait]
impl HealthCheck for HealthProbe {
    async fn check(&self) -> HealthReport {
        self.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::fake::{FakeDisplay, FakeHttp, FakeServices};

    fn probe_with(
        services: Arc<FakeServices>,
        display: Arc<FakeDisplay>,
        http: Arc<FakeHttp>,
    ) -> HealthProbe {
        let services_config = ServicesConfig::default();
        let probe_config = ProbeConfig::default();
        let policy = |_: chrono::NaiveDateTime| "http://127.0.0.1:8080/health".to_string();
        HealthProbe::new(&services_config, &probe_config, services, display, http, Arc::new(policy))
    }

    fn running_services() -> Arc<FakeServices> {
        let config = ServicesConfig::default();
        Arc::new(FakeServices::running(&[&config.application, &config.renderer]))
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let probe = probe_with(running_services(), Arc::new(FakeDisplay::healthy()), Arc::new(FakeHttp::status(200)));
        let report = probe.probe().await;
        assert!(report.healthy());
        assert!(report.failed_checks().is_empty());
        assert_eq!(report.endpoint, "http://127.0.0.1:8080/health");
        let order: Vec<CheckName> = report.checks.iter().map(|c| c.name).collect();
        assert_eq!(order, CheckName::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_redirect_counts_as_responsive() {
        let probe = probe_with(running_services(), Arc::new(FakeDisplay::healthy()), Arc::new(FakeHttp::status(302)));
        assert!(probe.probe().await.healthy());
    }

    #[tokio::test]
    async fn test_every_failure_is_reported() {
        let services = Arc::new(FakeServices::default());
        let display = Arc::new(FakeDisplay::healthy());
        display.set_window_visible(false);
        let probe = probe_with(services, display, Arc::new(FakeHttp::status(503)));

        let report = probe.probe().await;
        assert!(!report.healthy());
        assert_eq!(
            report.failed_checks(),
            vec!["process_alive", "app_responsive", "window_visible"]
        );
        assert_eq!(report.first_failure().map(|c| c.name), Some(CheckName::ProcessAlive));
        assert_eq!(report.check(CheckName::DisplayConnected), Some(true));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_check() {
        let http = Arc::new(FakeHttp::unreachable("connection refused"));
        let probe = probe_with(running_services(), Arc::new(FakeDisplay::healthy()), http.clone());
        let report = probe.probe().await;
        assert_eq!(report.failed_checks(), vec!["app_responsive"]);
        assert_eq!(http.requests(), vec!["http://127.0.0.1:8080/health"]);
    }

    #[tokio::test]
    async fn test_missing_renderer_fails_process_check() {
        let config = ServicesConfig::default();
        let services = Arc::new(FakeServices::running(&[&config.application]));
        let probe = probe_with(services, Arc::new(FakeDisplay::healthy()), Arc::new(FakeHttp::status(200)));
        let report = probe.probe().await;
        let process = &report.checks[0];
        assert!(!process.passed);
        assert!(process.detail.contains(&config.renderer));
    }
}
