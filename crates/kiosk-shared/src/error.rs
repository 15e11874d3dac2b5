//! Error types for the kiosk supervisor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KioskError {
    #[error("Supervisor lock held by pid {pid} ({holder}) since {acquired_at}")]
    LockHeld {
        pid: u32,
        holder: String,
        acquired_at: String,
    },

    #[error("Invalid recovery state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl KioskError {
    /// True when another cycle owns the supervisor lock.
    pub fn is_lock_held(&self) -> bool {
        matches!(self, KioskError::LockHeld { .. })
    }
}

pub type Result<T> = std::result::Result<T, KioskError>;
