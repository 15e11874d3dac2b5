//! Shared types for the kiosk supervisor: persisted recovery state, the
//! supervisor lock, the decision log, configuration and the status payload.

pub mod config;
pub mod decision_log;
pub mod error;
pub mod recovery_state;
pub mod status;
pub mod supervisor_lock;

pub use config::Config;
pub use decision_log::{CycleRecorder, Decision, DecisionLog, DecisionRecord};
pub use error::{KioskError, Result};
pub use recovery_state::{EscalationLevel, RecoveryState, MAX_LEVEL};
pub use status::SupervisorStatus;
pub use supervisor_lock::{LockGuard, LockHolder, SupervisorLock};
