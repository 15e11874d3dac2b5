//! Supervisor
//!
//! Wires the ports into the health probe, recovery machine and resource
//! monitor, and exposes the five entry points: probe cycle, sweep cycle,
//! trigger, reset and status. `watch` runs probe and sweep on schedules.

use crate::health::{EndpointPolicy, HealthCheck, HealthProbe, HealthReport, QuietHoursPolicy};
use crate::ports::{
    DisplayIntrospection, HttpLiveness, LinuxOs, OsControl, ReqwestLiveness, ServiceControl, Systemctl,
    XDisplay,
};
use crate::recovery::{ActionContext, RecoveryMachine, ResetOutcome, TriggerOutcome, TriggerReason};
use crate::resources::{ResourceMonitor, ResourceSampler, SweepOutcome, SysinfoSampler};
use anyhow::Result;
use kiosk_shared::{Config, Decision, DecisionLog, SupervisorStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Host handles used by every component
#[derive(Clone)]
pub struct Ports {
    pub services: Arc<dyn ServiceControl>,
    pub display: Arc<dyn DisplayIntrospection>,
    pub http: Arc<dyn HttpLiveness>,
    pub os: Arc<dyn OsControl>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub policy: Arc<dyn EndpointPolicy>,
}

impl Ports {
    /// systemd, X11, reqwest, Linux and sysinfo backed ports
    pub fn real(config: &Config) -> Result<Self> {
        let timeout = config.probe.command_timeout();
        Ok(Self {
            services: Arc::new(Systemctl::new(timeout)),
            display: Arc::new(XDisplay::new(config.probe.display.clone(), timeout)),
            http: Arc::new(ReqwestLiveness::new(config.probe.http_timeout())?),
            os: Arc::new(LinuxOs::new(config.recovery.reboot_command.clone(), timeout)),
            sampler: Arc::new(SysinfoSampler::new(config.resources.disk_mount.clone())),
            policy: Arc::new(QuietHoursPolicy::from_config(&config.probe)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProbeCycleOutcome {
    pub report: HealthReport,
    /// Present when the probe failed and recovery was triggered
    pub trigger: Option<TriggerOutcome>,
}

#[derive(Debug, Clone)]
pub struct SweepCycleOutcome {
    pub sweep: SweepOutcome,
    /// Present when the sweep escalated into recovery
    pub trigger: Option<TriggerOutcome>,
}

pub struct Supervisor {
    probe: Arc<HealthProbe>,
    machine: RecoveryMachine,
    monitor: ResourceMonitor,
    log: DecisionLog,
    schedule: (Duration, Duration),
}

impl Supervisor {
    pub fn new(config: &Config, ports: Ports) -> Self {
        let probe = Arc::new(HealthProbe::new(
            &config.services,
            &config.probe,
            ports.services.clone(),
            ports.display.clone(),
            ports.http.clone(),
            ports.policy.clone(),
        ));
        let context = ActionContext::new(config, ports.services.clone(), ports.os.clone());
        let verifier: Arc<dyn HealthCheck> = probe.clone();
        Self {
            machine: RecoveryMachine::new(config, context, verifier),
            monitor: ResourceMonitor::new(config, ports.sampler, ports.services, ports.os),
            log: DecisionLog::new(config.paths.decision_log(), config.paths.decision_log_max_entries),
            probe,
            schedule: (
                Duration::from_secs(config.schedule.probe_interval_secs),
                Duration::from_secs(config.schedule.sweep_interval_secs),
            ),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config, Ports::real(config)?))
    }

    pub fn machine(&self) -> &RecoveryMachine {
        &self.machine
    }

    /// Probe once; trigger recovery if unhealthy
    pub async fn probe_cycle(&self) -> Result<ProbeCycleOutcome> {
        let report = self.probe.probe().await;
        let failed_checks = report.failed_checks();
        self.log.cycle("probe").record(Decision::ProbeResult {
            healthy: report.healthy(),
            failed_checks: failed_checks.clone(),
            endpoint: report.endpoint.clone(),
        });

        let trigger = if report.healthy() {
            None
        } else {
            Some(self.machine.trigger(TriggerReason::ProbeFailed { failed_checks }).await?)
        };
        Ok(ProbeCycleOutcome { report, trigger })
    }

    /// Sweep once; a disk that stays critical feeds the recovery ladder.
    /// The trigger runs after the sweep has released the lock.
    pub async fn sweep_cycle(&self) -> Result<SweepCycleOutcome> {
        let sweep = self.monitor.sweep().await?;
        let trigger = match &sweep {
            SweepOutcome::Completed(report) if report.escalate => {
                let detail = format!("disk at {:.1}% after cleanup", report.disk_pct);
                Some(self.machine.trigger(TriggerReason::ResourcePressure { detail }).await?)
            }
            _ => None,
        };
        Ok(SweepCycleOutcome { sweep, trigger })
    }

    pub async fn trigger(&self) -> Result<TriggerOutcome> {
        self.machine.trigger(TriggerReason::Operator).await
    }

    pub fn reset(&self) -> Result<ResetOutcome> {
        self.machine.reset()
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.machine.status().await
    }

    /// Run probe and sweep cycles on their intervals until interrupted
    pub async fn watch(self: Arc<Self>) -> Result<()> {
        let (probe_every, sweep_every) = self.schedule;
        info!(
            "Watching: probe every {}s, sweep every {}s",
            probe_every.as_secs(),
            sweep_every.as_secs()
        );

        let prober = Arc::clone(&self);
        let probe_task = tokio::spawn(async move {
            loop {
                if let Err(e) = prober.probe_cycle().await {
                    warn!("Probe cycle failed: {:#}", e);
                }
                tokio::time::sleep(probe_every).await;
            }
        });

        let sweeper = Arc::clone(&self);
        let sweep_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_every).await;
                if let Err(e) = sweeper.sweep_cycle().await {
                    warn!("Sweep cycle failed: {:#}", e);
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        probe_task.abort();
        sweep_task.abort();
        Ok(())
    }
}
