//! Persisted escalation state.
//!
//! The only record that outlives a single cycle. It is read, mutated in
//! memory and written back while the supervisor lock is held, and saved with
//! write-to-temp + rename so a crash mid-write leaves the previous version.

use crate::error::{KioskError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Highest escalation level; reaching it means the reboot was issued.
pub const MAX_LEVEL: u8 = 4;

/// Rungs of the remediation ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Nominal = 0,
    ServiceRestart = 1,
    CacheClearRestart = 2,
    DisplayServerRestart = 3,
    FullReboot = 4,
}

impl EscalationLevel {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Nominal),
            1 => Some(Self::ServiceRestart),
            2 => Some(Self::CacheClearRestart),
            3 => Some(Self::DisplayServerRestart),
            4 => Some(Self::FullReboot),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::ServiceRestart => "service-restart",
            Self::CacheClearRestart => "cache-clear-restart",
            Self::DisplayServerRestart => "display-server-restart",
            Self::FullReboot => "full-reboot",
        }
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalation record persisted across restarts and reboots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    /// 0 = nominal, 1..=3 escalating remediation, 4 = reboot issued
    pub level: u8,

    /// Failures since the last reset
    pub failure_count: u64,

    /// When the most recent failure was recorded
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl RecoveryState {
    /// Check the record's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.level > MAX_LEVEL {
            return Err(KioskError::InvalidState(format!(
                "level {} out of range 0..={}",
                self.level, MAX_LEVEL
            )));
        }
        if self.level > 0 && self.failure_count == 0 {
            return Err(KioskError::InvalidState(format!(
                "level {} with zero failures",
                self.level
            )));
        }
        Ok(())
    }

    pub fn escalation_level(&self) -> EscalationLevel {
        EscalationLevel::from_u8(self.level.min(MAX_LEVEL)).unwrap_or(EscalationLevel::FullReboot)
    }

    /// True when the last failure is older than `window`.
    pub fn is_quiescent(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(last) = self.last_failure_at else {
            return false;
        };
        // A failure stamped in the future (clock step) never counts as old.
        now.signed_duration_since(last)
            .to_std()
            .map(|age| age > window)
            .unwrap_or(false)
    }

    /// Forgive past failures after a long healthy spell.
    pub fn forgive(&mut self) {
        self.level = 0;
        self.failure_count = 0;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
    }

    /// Move one rung up, saturating at the terminal level.
    pub fn escalate(&mut self) {
        self.level = (self.level + 1).min(MAX_LEVEL);
    }

    /// Remediation verified healthy.
    pub fn mark_recovered(&mut self) {
        self.level = 0;
        self.failure_count = 0;
    }

    /// Operator reset to the zero value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Load state from disk; missing or corrupt files yield the zero state.
    pub fn load_or_init(path: &Path) -> Self {
        match Self::load(path) {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!("No recovery state at {}, starting nominal", path.display());
                Self::default()
            }
            Err(e) => {
                warn!(
                    "Unusable recovery state at {}: {}. Starting nominal.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Load state from disk, `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: RecoveryState = serde_json::from_str(&contents)?;
        state.validate()?;
        Ok(Some(state))
    }

    /// Save state atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, path)?;

        Ok(())
    }
}
