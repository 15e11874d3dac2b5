//! SupervisorStatus - the read-only view handed to operator tooling.

use crate::recovery_state::{EscalationLevel, RecoveryState};
use crate::supervisor_lock::LockHolder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub level: u8,
    pub level_name: String,
    pub failure_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub currently_healthy: bool,
    /// Checks that failed in the live probe
    #[serde(default)]
    pub failed_checks: Vec<String>,
    /// Present while a recovery or sweep is running
    #[serde(default)]
    pub lock_holder: Option<LockHolder>,
}

impl SupervisorStatus {
    pub fn new(
        state: &RecoveryState,
        currently_healthy: bool,
        failed_checks: Vec<String>,
        lock_holder: Option<LockHolder>,
    ) -> Self {
        Self {
            level: state.level,
            level_name: state.escalation_level().as_str().to_string(),
            failure_count: state.failure_count,
            last_failure_at: state.last_failure_at,
            currently_healthy,
            failed_checks,
            lock_holder,
        }
    }

    /// Plain-text rendering for terminals and logs
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!(
                "health:        {}",
                if self.currently_healthy {
                    "OK".to_string()
                } else {
                    format!("UNHEALTHY ({})", self.failed_checks.join(", "))
                }
            ),
            format!("level:         {} ({})", self.level, self.level_name),
            format!("failures:      {}", self.failure_count),
            format!(
                "last failure:  {}",
                self.last_failure_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            ),
        ];
        if let Some(holder) = &self.lock_holder {
            lines.push(format!(
                "in progress:   {} (pid {}, since {})",
                holder.holder,
                holder.pid,
                holder.acquired_at.to_rfc3339()
            ));
        }
        lines.join("\n")
    }

    pub fn is_escalated(&self) -> bool {
        self.level > EscalationLevel::Nominal.as_u8()
    }
}
