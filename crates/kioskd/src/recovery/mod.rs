//! Escalating recovery
//!
//! Each trigger runs one rung of the ladder under the supervisor lock:
//! record the failure, run the action for the current level, wait for it to
//! settle, re-probe, then either reset to nominal or climb one level. Level
//! 4 reboots the machine. A healthy spell longer than the quiescence window
//! forgives past failures.

pub mod actions;

pub use actions::{ActionCatalog, ActionContext, ActionReport, Remediation, RemediationAction};

use crate::health::HealthCheck;
use anyhow::Result;
use chrono::Utc;
use kiosk_shared::config::Config;
use kiosk_shared::{
    CycleRecorder, Decision, DecisionLog, KioskError, RecoveryState, SupervisorLock, SupervisorStatus,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Why recovery was requested
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerReason {
    ProbeFailed { failed_checks: Vec<String> },
    /// Disk still critical after a full sweep
    ResourcePressure { detail: String },
    Operator,
}

impl TriggerReason {
    /// Lock holder and decision log source for this trigger
    pub fn source(&self) -> &'static str {
        match self {
            TriggerReason::ProbeFailed { .. } => "probe",
            TriggerReason::ResourcePressure { .. } => "sweep",
            TriggerReason::Operator => "operator",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TriggerReason::ProbeFailed { failed_checks } => {
                format!("probe failed: {}", failed_checks.join(", "))
            }
            TriggerReason::ResourcePressure { detail } => format!("resource pressure: {}", detail),
            TriggerReason::Operator => "operator request".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Another cycle holds the lock; nothing was done
    Contended { holder: String, pid: u32 },
    Recovered { action: Remediation, from_level: u8 },
    Escalated { action: Remediation, from_level: u8, to_level: u8 },
    RebootIssued { failure_count: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResetOutcome {
    Applied { previous: RecoveryState },
    Contended { holder: String, pid: u32 },
}

pub struct RecoveryMachine {
    state_path: PathBuf,
    lock: SupervisorLock,
    log: DecisionLog,
    catalog: ActionCatalog,
    context: ActionContext,
    verifier: Arc<dyn HealthCheck>,
    quiescence_window: Duration,
}

impl RecoveryMachine {
    pub fn new(config: &Config, context: ActionContext, verifier: Arc<dyn HealthCheck>) -> Self {
        Self {
            state_path: config.paths.state_file(),
            lock: SupervisorLock::new(config.paths.lock_file(), config.recovery.lock_stale_after()),
            log: DecisionLog::new(config.paths.decision_log(), config.paths.decision_log_max_entries),
            catalog: ActionCatalog::from_config(config),
            context,
            verifier,
            quiescence_window: config.recovery.quiescence_window(),
        }
    }

    /// Persisted state, or nominal if none
    pub fn state(&self) -> RecoveryState {
        RecoveryState::load_or_init(&self.state_path)
    }

    /// Run one rung of the ladder
    pub async fn trigger(&self, reason: TriggerReason) -> Result<TriggerOutcome> {
        let source = reason.source();
        let cycle = self.log.cycle(source);
        // An unusable lock file must not stop recovery on a broken disk.
        let _guard = match self.lock.try_acquire(source) {
            Ok(guard) => Some(guard),
            Err(KioskError::LockHeld { pid, holder, .. }) => {
                info!("Recovery already in progress ({} pid {}), skipping", holder, pid);
                cycle.record(Decision::LockContended {
                    holder: holder.clone(),
                    pid,
                });
                return Ok(TriggerOutcome::Contended { holder, pid });
            }
            Err(e) => {
                error!("Supervisor lock unavailable ({}), recovering without it", e);
                cycle.record(Decision::LockUnavailable { error: e.to_string() });
                None
            }
        };

        let now = Utc::now();
        let mut state = RecoveryState::load_or_init(&self.state_path);
        if state.is_quiescent(now, self.quiescence_window) && (state.level > 0 || state.failure_count > 0) {
            info!(
                "Last failure older than {}s, forgiving level {}",
                self.quiescence_window.as_secs(),
                state.level
            );
            cycle.record(Decision::QuiescenceReset {
                previous_level: state.level,
                previous_failures: state.failure_count,
            });
            state.forgive();
        }

        state.record_failure(now);
        let from_level = state.level;
        let action = self.catalog.for_level(from_level);
        warn!(
            "Recovery triggered ({}): level {}, failure #{}, running {}",
            reason.describe(),
            from_level,
            state.failure_count,
            action.remediation
        );
        cycle.record(Decision::TriggerAccepted {
            reason: reason.describe(),
            level: from_level,
            failure_count: state.failure_count,
        });

        if action.remediation.is_terminal() {
            return Ok(self.reboot(state, &reason, &cycle).await);
        }

        self.persist(&state);
        let report = self.run_action(action.remediation, &cycle).await;
        if !report.succeeded() {
            warn!("{} finished with {} errors", action.remediation, report.errors.len());
        }

        tokio::time::sleep(action.settle_time).await;
        let verdict = self.verifier.check().await;

        if verdict.healthy() {
            state.mark_recovered();
            self.persist(&state);
            info!("Recovered by {} from level {}", action.remediation, from_level);
            cycle.record(Decision::Recovered { from_level });
            Ok(TriggerOutcome::Recovered {
                action: action.remediation,
                from_level,
            })
        } else {
            state.escalate();
            self.persist(&state);
            let failed_checks = verdict.failed_checks();
            warn!(
                "{} did not recover the kiosk ({}), level {} -> {}",
                action.remediation,
                failed_checks.join(", "),
                from_level,
                state.level
            );
            cycle.record(Decision::Escalated {
                from_level,
                to_level: state.level,
                failed_checks,
            });
            Ok(TriggerOutcome::Escalated {
                action: action.remediation,
                from_level,
                to_level: state.level,
            })
        }
    }

    /// Terminal rung. Level 4 is persisted and the diagnostics are on disk
    /// before the reboot is issued.
    async fn reboot(&self, mut state: RecoveryState, reason: &TriggerReason, cycle: &CycleRecorder) -> TriggerOutcome {
        state.escalate();
        self.persist(&state);

        let diagnostics = json!({
            "reason": reason.describe(),
            "state": state,
            "cycle_id": cycle.cycle_id(),
        });
        error!(
            "Terminal failure after {} failures, rebooting: {}",
            state.failure_count, diagnostics
        );
        cycle.record(Decision::RebootIssued {
            failure_count: state.failure_count,
            diagnostics,
        });

        self.run_action(Remediation::FullReboot, cycle).await;
        TriggerOutcome::RebootIssued {
            failure_count: state.failure_count,
        }
    }

    async fn run_action(&self, remediation: Remediation, cycle: &CycleRecorder) -> ActionReport {
        cycle.record(Decision::ActionStarted {
            severity: remediation.severity(),
            action: remediation.name().to_string(),
        });
        let report = remediation.run(&self.context).await;
        cycle.record(Decision::ActionFinished {
            severity: remediation.severity(),
            action: remediation.name().to_string(),
            errors: report.errors.clone(),
        });
        report
    }

    /// Save failures are logged, not fatal: remediation still has to happen
    /// on a read-only or full disk.
    fn persist(&self, state: &RecoveryState) {
        if let Err(e) = state.save(&self.state_path) {
            error!("Failed to persist recovery state: {}", e);
        }
    }

    /// Clear escalation history. Waits for nothing: a running cycle makes
    /// this return `Contended`.
    pub fn reset(&self) -> Result<ResetOutcome> {
        let cycle = self.log.cycle("operator");
        let _guard = match self.lock.try_acquire("reset") {
            Ok(guard) => guard,
            Err(KioskError::LockHeld { pid, holder, .. }) => {
                cycle.record(Decision::LockContended {
                    holder: holder.clone(),
                    pid,
                });
                return Ok(ResetOutcome::Contended { holder, pid });
            }
            Err(e) => return Err(e.into()),
        };

        let previous = RecoveryState::load_or_init(&self.state_path);
        let mut state = previous.clone();
        state.reset();
        state.save(&self.state_path)?;
        info!(
            "Recovery state reset (was level {}, {} failures)",
            previous.level, previous.failure_count
        );
        cycle.record(Decision::Reset {
            previous_level: previous.level,
            previous_failures: previous.failure_count,
        });
        Ok(ResetOutcome::Applied { previous })
    }

    /// Persisted state plus a live probe. Takes no lock and writes nothing.
    pub async fn status(&self) -> SupervisorStatus {
        let state = self.state();
        let holder = match self.lock.current_holder() {
            Ok(holder) => holder,
            Err(e) => {
                warn!("Cannot read supervisor lock: {}", e);
                None
            }
        };
        let report = self.verifier.check().await;
        SupervisorStatus::new(&state, report.healthy(), report.failed_checks(), holder)
    }
}
